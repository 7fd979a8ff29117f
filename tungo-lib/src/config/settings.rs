use std::net::SocketAddr;

use serde::Deserialize;

/// TCP transport endpoints
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TcpSettings {
    /// Server listen address, e.g. "0.0.0.0:8443"
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    /// Client dial address
    #[serde(default)]
    pub connect: Option<SocketAddr>,
}

/// UDP transport endpoints
#[derive(Debug, Deserialize, Clone, Default)]
pub struct UdpSettings {
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    #[serde(default)]
    pub connect: Option<SocketAddr>,
}

/// WebSocket transport endpoints
#[derive(Debug, Deserialize, Clone, Default)]
pub struct WsSettings {
    /// Server listen address for the HTTP upgrade
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    /// Client URL, "ws://host:port/path" or "wss://host:port/path"
    #[serde(default)]
    pub url: Option<String>,
    /// Certificate chain for WSS listeners (PEM)
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    /// Private key for WSS listeners (PEM)
    #[serde(default)]
    pub tls_key_path: Option<String>,
}

/// Bridge socket the platform's TUN helper exchanges raw IP packets on.
/// Device creation itself is platform plumbing and lives outside the
/// daemon.
#[derive(Debug, Deserialize, Clone)]
pub struct TunSettings {
    pub bridge_listen: SocketAddr,
    /// Helper address; learned from the first inbound packet if absent
    #[serde(default)]
    pub bridge_peer: Option<SocketAddr>,
}
