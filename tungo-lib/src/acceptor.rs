//! Server-side accept loops: one per configured transport.
//!
//! Stream transports accept, upgrade (TLS/WS as configured), handshake,
//! register the session, and hand it to a per-session ingress worker.
//! The UDP loop demultiplexes datagrams inline: known external addresses
//! route straight into the session, unknown ones are treated as
//! handshake initiations (IK completes in a single round trip).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ServerIdentity};
use crate::crypto::{NonceMode, SharedCipher, TunnelCipher};
use crate::error::Result;
use crate::framing::DeadlineStream;
use crate::handshake;
use crate::rekey::RekeyFsm;
use crate::session::{canonical_addr, Session, TtlRepository};
use crate::transport::{stream_link, tcp, ws, BoxedIo, DatagramWriter, LinkWriter};
use crate::tun::TunDevice;
use crate::worker::{process_record, run_server_worker, Role, Step};

/// Everything a spawned per-connection task needs.
#[derive(Clone)]
pub struct AcceptorContext {
    pub cfg: Arc<Config>,
    pub identity: Arc<ServerIdentity>,
    pub repo: Arc<TtlRepository>,
    pub tun: Arc<TunDevice>,
    pub cancel: CancellationToken,
}

impl AcceptorContext {
    fn handshake_deadline(&self) -> std::time::Duration {
        self.cfg.dial_timeout().max(std::time::Duration::from_secs(5))
    }
}

/// Accept TCP clients until cancellation. Accept errors are logged and
/// the loop continues; dropping the listener on cancellation is what
/// unblocks a pending accept.
pub async fn run_tcp_acceptor(ctx: AcceptorContext, listener: TcpListener) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tcp::configure_accepted(&stream);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let idle = ctx.cfg.read_idle_timeout();
                    let io: BoxedIo = Box::new(DeadlineStream::new(stream, idle));
                    serve_stream_connection(ctx, io, peer).await;
                });
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        }
    }
    info!("tcp acceptor stopped");
    Ok(())
}

/// Accept WS (and, with a TLS acceptor, WSS) clients until cancellation.
pub async fn run_ws_acceptor(
    ctx: AcceptorContext,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tcp::configure_accepted(&stream);
                let ctx = ctx.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    let idle = ctx.cfg.read_idle_timeout();
                    let upgraded: Result<BoxedIo> = async {
                        match tls {
                            Some(acceptor) => {
                                let stream = acceptor.accept(stream).await.map_err(|e| {
                                    crate::error::TunnelError::Tls(e.to_string())
                                })?;
                                let ws = ws::accept(stream).await?;
                                Ok(Box::new(DeadlineStream::new(ws, idle)) as BoxedIo)
                            }
                            None => {
                                let ws = ws::accept(stream).await?;
                                Ok(Box::new(DeadlineStream::new(ws, idle)) as BoxedIo)
                            }
                        }
                    }
                    .await;

                    match upgraded {
                        Ok(io) => serve_stream_connection(ctx, io, peer).await,
                        Err(err) => debug!(%peer, error = %err, "websocket upgrade failed"),
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        }
    }
    info!("ws acceptor stopped");
    Ok(())
}

/// Handshake an upgraded stream, register the session, run its worker.
async fn serve_stream_connection(ctx: AcceptorContext, io: BoxedIo, peer: SocketAddr) {
    let Ok(cap) = ctx.cfg.frame_cap() else {
        return;
    };
    let (mut reader, mut writer) = stream_link(io, cap);

    // an accept racing shutdown closes without handshaking
    let outcome = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            writer.shutdown().await;
            return;
        }
        outcome = tokio::time::timeout(
            ctx.handshake_deadline(),
            handshake::server_side_handshake(&mut reader, &mut writer, &ctx.identity),
        ) => outcome,
    };
    let outcome = match outcome {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            debug!(%peer, error = %err, "handshake failed");
            writer.shutdown().await;
            return;
        }
        Err(_) => {
            debug!(%peer, "handshake timed out");
            writer.shutdown().await;
            return;
        }
    };

    let internal_ip = outcome.internal_ip;
    let cipher = SharedCipher::new(TunnelCipher::new(outcome.secrets, NonceMode::Stream));
    let fsm = Arc::new(RekeyFsm::new(
        Arc::new(cipher.clone()),
        ctx.cfg.pending_rekey_timeout(),
    ));
    let session = Session::new(
        internal_ip,
        peer,
        cipher,
        fsm,
        writer,
        ctx.cancel.child_token(),
    );

    info!(internal = %internal_ip, external = %peer, "client connected");
    ctx.repo.add(session.clone()).await;
    run_server_worker(session, reader, ctx.tun.clone(), ctx.repo.clone(), ctx.cfg.mtu).await;
}

/// Serve all UDP clients from one socket. Ingress for registered
/// sessions is processed inline; datagrams from unknown sources are
/// handshake initiations.
pub async fn run_udp_acceptor(ctx: AcceptorContext, socket: UdpSocket) -> Result<()> {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; crate::framing::MAX_FRAME_CAP as usize];

    loop {
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, peer) = match received {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "udp receive failed");
                continue;
            }
        };
        let peer = canonical_addr(peer);

        if let Ok(session) = ctx.repo.get_by_external(peer).await {
            let overhead = session.cipher().lock().overhead();
            let step = process_record(
                &session,
                &buf[..n],
                &ctx.tun,
                Role::Server,
                Some(&ctx.repo),
                ctx.cfg.mtu,
                overhead,
            )
            .await;
            if let Step::Exit(reason) = step {
                let (up, down) = session.traffic();
                info!(
                    internal = %session.internal_addr(),
                    external = %peer,
                    bytes_up = up,
                    bytes_down = down,
                    ?reason,
                    "session closed"
                );
                ctx.repo.delete(&session).await;
            }
            continue;
        }

        match handshake::respond(&ctx.identity, &buf[..n]) {
            Ok((reply, outcome)) => {
                if let Err(err) = socket.send_to(&reply, peer).await {
                    warn!(%peer, error = %err, "handshake reply failed");
                    continue;
                }
                let internal_ip = outcome.internal_ip;
                let cipher = SharedCipher::new(TunnelCipher::new(
                    outcome.secrets,
                    NonceMode::Datagram { ring_size: ctx.cfg.udp_nonce_ring_size() },
                ));
                let fsm = Arc::new(RekeyFsm::new(
                    Arc::new(cipher.clone()),
                    ctx.cfg.pending_rekey_timeout(),
                ));
                let writer =
                    LinkWriter::Datagram(DatagramWriter::to_peer(socket.clone(), peer));
                let session = Session::new(
                    internal_ip,
                    peer,
                    cipher,
                    fsm,
                    writer,
                    ctx.cancel.child_token(),
                );
                info!(internal = %internal_ip, external = %peer, "client connected");
                ctx.repo.add(session).await;
            }
            Err(err) => {
                debug!(%peer, error = %err, "ignoring datagram from unknown peer");
            }
        }
    }
    info!("udp acceptor stopped");
    Ok(())
}
