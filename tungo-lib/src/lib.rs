#![forbid(unsafe_code)]

pub mod acceptor;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod establish;
pub mod framing;
pub mod handshake;
pub mod rekey;
pub mod server;
pub mod service;
pub mod session;
pub mod transport;
pub mod tun;
pub mod worker;

pub use client::run_client;
pub use config::{load_from_path, Config, Protocol};
pub use error::{Result, TunnelError};
pub use server::run_server;
