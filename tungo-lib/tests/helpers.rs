//! Shared helpers for tunnel integration tests

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener as StdTcpListener};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::SigningKey;
use x25519_dalek::{PublicKey, StaticSecret};

use tungo_lib::config::{Config, Protocol, TcpSettings, TunSettings, UdpSettings, WsSettings};

pub const SERVER_NOISE_SEED: [u8; 32] = [0x40; 32];
pub const CLIENT_NOISE_SEED: [u8; 32] = [0x41; 32];
pub const SERVER_SIGNING_SEED: [u8; 32] = [0x42; 32];

fn b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Route tunnel logs into the test harness when RUST_LOG asks for them.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Grab an ephemeral localhost port.
pub fn pick_free_port() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

/// Baseline config both roles share; tests override endpoints and role
/// key material afterwards.
pub fn base_config(protocol: Protocol) -> Config {
    Config {
        protocol,
        tcp_settings: TcpSettings::default(),
        udp_settings: UdpSettings::default(),
        ws_settings: WsSettings::default(),
        tun: TunSettings {
            // tests drive an in-memory device; the bridge is unused
            bridge_listen: "127.0.0.1:1".parse().expect("addr"),
            bridge_peer: None,
        },
        frame_cap_bytes: 1518,
        mtu: 1500,
        pending_rekey_timeout: 30,
        rekey_interval: 3600,
        session_ttl: 0,
        session_cleanup_interval: 0,
        udp_nonce_ring_size: 0,
        dial_timeout_ms: 5000,
        read_idle_timeout: 60,
        ed25519_public_key: None,
        ed25519_private_key: None,
        x25519_public_key: None,
        x25519_private_key: None,
        x25519_client_public_key: None,
        x25519_client_private_key: None,
        x25519_server_public_key: None,
        internal_ip: None,
        egress_allowlist: None,
    }
}

pub fn server_config(protocol: Protocol) -> Config {
    let server_noise = StaticSecret::from(SERVER_NOISE_SEED);
    let client_noise = StaticSecret::from(CLIENT_NOISE_SEED);
    let signing = SigningKey::from_bytes(&SERVER_SIGNING_SEED);

    let mut cfg = base_config(protocol);
    cfg.x25519_private_key = Some(b64(&server_noise.to_bytes()));
    cfg.ed25519_private_key = Some(b64(&signing.to_bytes()));
    cfg.x25519_client_public_key = Some(b64(PublicKey::from(&client_noise).as_bytes()));
    cfg
}

pub fn client_config(protocol: Protocol, internal_ip: &str) -> Config {
    let server_noise = StaticSecret::from(SERVER_NOISE_SEED);
    let client_noise = StaticSecret::from(CLIENT_NOISE_SEED);
    let signing = SigningKey::from_bytes(&SERVER_SIGNING_SEED);

    let mut cfg = base_config(protocol);
    cfg.x25519_private_key = Some(b64(&client_noise.to_bytes()));
    cfg.x25519_server_public_key = Some(b64(PublicKey::from(&server_noise).as_bytes()));
    cfg.ed25519_public_key = Some(b64(signing.verifying_key().as_bytes()));
    cfg.internal_ip = Some(internal_ip.parse().expect("internal ip"));
    cfg
}

/// Minimal IPv4 packet: 20-byte header plus payload.
pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // ttl
    packet[9] = 17; // udp
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet[20..].copy_from_slice(payload);
    packet
}
