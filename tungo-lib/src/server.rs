//! Server runtime: repository, TTL sweeper, shared-TUN dispatcher, and
//! the configured transport's acceptor, all bound to one cancellation
//! token.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::acceptor::{run_tcp_acceptor, run_udp_acceptor, run_ws_acceptor, AcceptorContext};
use crate::config::{Config, Protocol};
use crate::error::{Result, TunnelError};
use crate::session::{SessionRepository, TtlRepository};
use crate::transport::{tcp, udp, ws};
use crate::tun::TunDevice;
use crate::worker::run_tun_dispatcher;

pub async fn run_server(
    cfg: Arc<Config>,
    tun: Arc<TunDevice>,
    cancel: CancellationToken,
) -> Result<()> {
    let identity = Arc::new(cfg.server_identity()?);
    let repo = Arc::new(TtlRepository::new(
        SessionRepository::new(),
        cfg.session_ttl(),
    ));

    let sweeper = repo.spawn_sweeper(cfg.session_cleanup_interval(), cancel.clone());
    let dispatcher = tokio::spawn(run_tun_dispatcher(
        repo.clone(),
        tun.clone(),
        cfg.mtu,
        cancel.clone(),
    ));

    let ctx = AcceptorContext {
        cfg: cfg.clone(),
        identity,
        repo: repo.clone(),
        tun,
        cancel: cancel.clone(),
    };

    let result = match cfg.protocol {
        Protocol::TCP => {
            let addr = cfg.tcp_settings.listen.ok_or_else(|| {
                TunnelError::Config("tcp_settings.listen is required for a server".into())
            })?;
            let listener = tcp::listen(addr).await?;
            info!(%addr, "listening (tcp)");
            run_tcp_acceptor(ctx, listener).await
        }
        Protocol::UDP => {
            let addr = cfg.udp_settings.listen.ok_or_else(|| {
                TunnelError::Config("udp_settings.listen is required for a server".into())
            })?;
            let socket = udp::bind(addr).await?;
            info!(%addr, "listening (udp)");
            run_udp_acceptor(ctx, socket).await
        }
        Protocol::WS | Protocol::WSS => {
            let addr = cfg.ws_settings.listen.ok_or_else(|| {
                TunnelError::Config("ws_settings.listen is required for a server".into())
            })?;
            let tls = if cfg.protocol == Protocol::WSS {
                let cert = cfg.ws_settings.tls_cert_path.as_deref().ok_or_else(|| {
                    TunnelError::Config("ws_settings.tls_cert_path is required for WSS".into())
                })?;
                let key = cfg.ws_settings.tls_key_path.as_deref().ok_or_else(|| {
                    TunnelError::Config("ws_settings.tls_key_path is required for WSS".into())
                })?;
                Some(ws::build_tls_acceptor(cert, key)?)
            } else {
                None
            };
            let listener = tcp::listen(addr).await?;
            info!(%addr, secure = tls.is_some(), "listening (ws)");
            run_ws_acceptor(ctx, listener, tls).await
        }
    };

    // teardown: stop the background tasks, then close every session
    cancel.cancel();
    let _ = dispatcher.await;
    let _ = sweeper.await;
    repo.inner().clear().await;
    info!("server stopped");
    result
}
