use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

use crate::crypto::DEFAULT_NONCE_RING_SIZE;
use crate::error::{Result, TunnelError};
use crate::framing::FrameCap;

use super::settings::{TcpSettings, TunSettings, UdpSettings, WsSettings};

/// Transport the tunnel runs over. Selected once; no runtime switching.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    TCP,
    UDP,
    WS,
    WSS,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Transport protocol: "TCP", "UDP", "WS" or "WSS"
    pub protocol: Protocol,
    /// TCP endpoints; required when protocol = "TCP"
    #[serde(default)]
    pub tcp_settings: TcpSettings,
    /// UDP endpoints; required when protocol = "UDP"
    #[serde(default)]
    pub udp_settings: UdpSettings,
    /// WebSocket endpoints; required when protocol = "WS" or "WSS"
    #[serde(default)]
    pub ws_settings: WsSettings,
    /// TUN bridge socket
    pub tun: TunSettings,

    /// Largest framed payload in bytes
    /// Default: 1518 (Ethernet MTU + AEAD tag + length prefix)
    #[serde(default = "default_frame_cap_bytes")]
    pub frame_cap_bytes: i64,
    /// Largest plaintext IP packet the TUN device emits
    /// Default: 1500
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Seconds an unacknowledged rekey may stay pending
    /// Default: 30
    #[serde(default = "default_pending_rekey_timeout")]
    pub pending_rekey_timeout: i64,
    /// Seconds between client-initiated key rotations
    /// Default: 3600
    #[serde(default = "default_rekey_interval")]
    pub rekey_interval: i64,
    /// Seconds an idle session stays registered
    /// Default: 43200 (12 hours)
    #[serde(default = "default_session_ttl")]
    pub session_ttl: i64,
    /// Seconds between TTL sweeps
    /// Default: 21600 (6 hours)
    #[serde(default = "default_session_cleanup_interval")]
    pub session_cleanup_interval: i64,
    /// Accepted-counter ring size per epoch on UDP
    /// Default: 100000
    #[serde(default = "default_udp_nonce_ring_size")]
    pub udp_nonce_ring_size: i64,
    /// Dial timeout in milliseconds; a 5 second floor is applied
    /// Default: 5000
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Seconds without inbound traffic before a read fails
    /// Default: 60
    #[serde(default = "default_read_idle_timeout")]
    pub read_idle_timeout: i64,

    /// Server identity signature keys (base64, 32 bytes each)
    #[serde(default)]
    pub ed25519_public_key: Option<String>,
    #[serde(default)]
    pub ed25519_private_key: Option<String>,
    /// Own static X25519 key pair (base64, 32 bytes each)
    #[serde(default)]
    pub x25519_public_key: Option<String>,
    #[serde(default)]
    pub x25519_private_key: Option<String>,
    /// Server side: the client static key admitted by the handshake
    #[serde(default)]
    pub x25519_client_public_key: Option<String>,
    /// Client side: own static private key (alias kept for generated
    /// client bundles; `x25519_private_key` wins when both are set)
    #[serde(default)]
    pub x25519_client_private_key: Option<String>,
    /// Client side: the server's static public key
    #[serde(default)]
    pub x25519_server_public_key: Option<String>,

    /// Client's VPN address, requested during the handshake
    #[serde(default)]
    pub internal_ip: Option<IpAddr>,
    /// Egress source allowlist in CIDR notation; absent = no filtering
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_optional_networks")]
    pub egress_allowlist: Option<Vec<IpNet>>,
}

impl Config {
    pub fn frame_cap(&self) -> Result<FrameCap> {
        FrameCap::new(self.frame_cap_bytes)
            .map_err(|e| TunnelError::Config(format!("frame_cap_bytes: {e}")))
    }

    pub fn pending_rekey_timeout(&self) -> Duration {
        seconds_or(self.pending_rekey_timeout, crate::rekey::DEFAULT_PENDING_TIMEOUT)
    }

    pub fn rekey_interval(&self) -> Duration {
        seconds_or(self.rekey_interval, Duration::from_secs(3600))
    }

    pub fn session_ttl(&self) -> Duration {
        seconds_or(self.session_ttl, crate::session::DEFAULT_SESSION_TTL)
    }

    pub fn session_cleanup_interval(&self) -> Duration {
        seconds_or(
            self.session_cleanup_interval,
            crate::session::DEFAULT_CLEANUP_INTERVAL,
        )
    }

    pub fn udp_nonce_ring_size(&self) -> usize {
        if self.udp_nonce_ring_size <= 0 {
            DEFAULT_NONCE_RING_SIZE
        } else {
            self.udp_nonce_ring_size as usize
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        seconds_or(self.read_idle_timeout, Duration::from_secs(60))
    }

    /// Client keep-alive cadence: half the idle timeout, so silence on a
    /// healthy link never trips the server's read deadline.
    pub fn keepalive_interval(&self) -> Duration {
        self.read_idle_timeout() / 2
    }
}

fn seconds_or(value: i64, fallback: Duration) -> Duration {
    if value <= 0 {
        fallback
    } else {
        Duration::from_secs(value as u64)
    }
}

fn default_frame_cap_bytes() -> i64 {
    // DefaultEthernetMTU + ChaCha20-Poly1305 tag + length prefix
    1518
}

fn default_mtu() -> usize {
    1500
}

fn default_pending_rekey_timeout() -> i64 {
    30
}

fn default_rekey_interval() -> i64 {
    3600
}

fn default_session_ttl() -> i64 {
    43_200
}

fn default_session_cleanup_interval() -> i64 {
    21_600
}

fn default_udp_nonce_ring_size() -> i64 {
    DEFAULT_NONCE_RING_SIZE as i64
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_read_idle_timeout() -> i64 {
    60
}

/// CIDR strings parse strictly: a typo in an allowlist must fail loudly
/// rather than silently widen or narrow the filter.
fn deserialize_optional_networks<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<IpNet>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let strings: Option<Vec<String>> = Option::deserialize(deserializer)?;
    let Some(strings) = strings else {
        return Ok(None);
    };
    let mut networks = Vec::with_capacity(strings.len());
    for s in strings {
        match s.parse::<IpNet>() {
            Ok(net) => networks.push(net),
            Err(e) => {
                return Err(serde::de::Error::custom(format!(
                    "invalid network '{s}': {e}"
                )))
            }
        }
    }
    Ok(Some(networks))
}
