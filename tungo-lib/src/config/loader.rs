use std::fs;
use std::path::Path;

use crate::crypto::STREAM_OVERHEAD;
use crate::error::{Result, TunnelError};

use super::{Config, Protocol};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| TunnelError::Config(format!("failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| TunnelError::Config(format!("failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    let cap = cfg.frame_cap()?;
    if cfg.mtu == 0 {
        return Err(TunnelError::Config("mtu must be positive".into()));
    }
    if cap.get() < cfg.mtu + STREAM_OVERHEAD {
        return Err(TunnelError::Config(format!(
            "frame_cap_bytes {} cannot carry an encrypted {}-byte packet",
            cap.get(),
            cfg.mtu
        )));
    }
    match cfg.protocol {
        Protocol::TCP => {
            if cfg.tcp_settings.listen.is_none() && cfg.tcp_settings.connect.is_none() {
                return Err(TunnelError::Config(
                    "protocol TCP requires tcp_settings.listen or tcp_settings.connect".into(),
                ));
            }
        }
        Protocol::UDP => {
            if cfg.udp_settings.listen.is_none() && cfg.udp_settings.connect.is_none() {
                return Err(TunnelError::Config(
                    "protocol UDP requires udp_settings.listen or udp_settings.connect".into(),
                ));
            }
        }
        Protocol::WS | Protocol::WSS => {
            if cfg.ws_settings.listen.is_none() && cfg.ws_settings.url.is_none() {
                return Err(TunnelError::Config(
                    "protocol WS/WSS requires ws_settings.listen or ws_settings.url".into(),
                ));
            }
            if cfg.protocol == Protocol::WSS
                && cfg.ws_settings.listen.is_some()
                && (cfg.ws_settings.tls_cert_path.is_none() || cfg.ws_settings.tls_key_path.is_none())
            {
                return Err(TunnelError::Config(
                    "WSS listeners require ws_settings.tls_cert_path and tls_key_path".into(),
                ));
            }
        }
    }

    Ok(())
}
