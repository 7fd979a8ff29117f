use thiserror::Error;

use crate::crypto::CryptoError;
use crate::framing::FrameError;
use crate::rekey::RekeyError;

/// Errors that can occur in the tunnel core
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Framing(#[from] FrameError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Rekey(#[from] RekeyError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TunnelError>;
