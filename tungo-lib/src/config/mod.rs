mod credentials;
mod loader;
mod root;
mod settings;

pub use credentials::{ClientIdentity, ServerIdentity};
pub use loader::load_from_path;
pub use root::{Config, Protocol};
pub use settings::{TcpSettings, TunSettings, UdpSettings, WsSettings};
