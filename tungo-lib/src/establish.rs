//! Client-side connection establishment: dial, handshake, retry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ClientIdentity, Config, Protocol};
use crate::error::{Result, TunnelError};
use crate::framing::DeadlineStream;
use crate::handshake::{client_side_handshake, HandshakeOutcome};
use crate::transport::{
    stream_link, tcp, udp, ws, BoxedIo, DatagramReader, DatagramWriter, LinkReader, LinkWriter,
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(32);
const MAX_ATTEMPTS: u32 = 30;
const MIN_ATTEMPT_DEADLINE: Duration = Duration::from_secs(5);

/// A dialed, framed, handshaken connection ready for the dataplane.
pub struct Established {
    pub reader: LinkReader,
    pub writer: LinkWriter,
    pub outcome: HandshakeOutcome,
    pub peer: SocketAddr,
}

pub struct Establisher {
    cfg: Arc<Config>,
    identity: ClientIdentity,
    cancel: CancellationToken,
}

impl Establisher {
    pub fn new(cfg: Arc<Config>, cancel: CancellationToken) -> Result<Self> {
        let identity = cfg.client_identity()?;
        Ok(Self { cfg, identity, cancel })
    }

    /// Dial and handshake with exponential backoff: 1 s doubling to
    /// 32 s, at most 30 attempts. Each attempt runs under its own
    /// deadline; cancellation aborts the in-flight attempt and the
    /// backoff sleep alike.
    pub async fn establish(&self) -> Result<Established> {
        let deadline = self.cfg.dial_timeout().max(MIN_ATTEMPT_DEADLINE);
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TunnelError::Cancelled),
                outcome = tokio::time::timeout(deadline, self.attempt()) => outcome,
            };
            match outcome {
                Ok(Ok(established)) => {
                    info!(attempt, peer = %established.peer, "connection established");
                    return Ok(established);
                }
                // the failed attempt's transport closes when it drops
                Ok(Err(err)) => warn!(attempt, error = %err, "establish attempt failed"),
                Err(_) => warn!(attempt, deadline = ?deadline, "establish attempt timed out"),
            }

            if attempt < MAX_ATTEMPTS {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TunnelError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
        Err(TunnelError::Dial(format!(
            "gave up after {MAX_ATTEMPTS} attempts"
        )))
    }

    async fn attempt(&self) -> Result<Established> {
        let requested_ip = self.cfg.internal_ip.ok_or_else(|| {
            TunnelError::Config("internal_ip is required to join the overlay".into())
        })?;
        let cap = self.cfg.frame_cap()?;
        let idle = self.cfg.read_idle_timeout();

        match self.cfg.protocol {
            Protocol::TCP => {
                let addr = self.cfg.tcp_settings.connect.ok_or_else(|| {
                    TunnelError::Config("tcp_settings.connect is required".into())
                })?;
                let stream = tcp::dial(addr)
                    .await
                    .map_err(|e| TunnelError::Dial(format!("tcp {addr}: {e}")))?;
                let io: BoxedIo = Box::new(DeadlineStream::new(stream, idle));
                self.handshake_stream(io, cap, requested_ip, addr).await
            }
            Protocol::WS | Protocol::WSS => {
                let url = self.cfg.ws_settings.url.clone().ok_or_else(|| {
                    TunnelError::Config("ws_settings.url is required".into())
                })?;
                let stream = ws::connect(&url).await?;
                let io: BoxedIo = Box::new(DeadlineStream::new(stream, idle));
                // the logical peer lives behind the URL; the socket addr
                // is only used for logging on the client
                let peer = SocketAddr::from(([0, 0, 0, 0], 0));
                self.handshake_stream(io, cap, requested_ip, peer).await
            }
            Protocol::UDP => {
                let addr = self.cfg.udp_settings.connect.ok_or_else(|| {
                    TunnelError::Config("udp_settings.connect is required".into())
                })?;
                let socket = Arc::new(
                    udp::connect(addr)
                        .await
                        .map_err(|e| TunnelError::Dial(format!("udp {addr}: {e}")))?,
                );
                let mut reader =
                    LinkReader::Datagram(DatagramReader::new(socket.clone(), Some(idle)));
                let mut writer = LinkWriter::Datagram(DatagramWriter::connected(socket));
                let outcome =
                    client_side_handshake(&mut reader, &mut writer, &self.identity, requested_ip)
                        .await?;
                Ok(Established { reader, writer, outcome, peer: addr })
            }
        }
    }

    async fn handshake_stream(
        &self,
        io: BoxedIo,
        cap: crate::framing::FrameCap,
        requested_ip: std::net::IpAddr,
        peer: SocketAddr,
    ) -> Result<Established> {
        let (mut reader, mut writer) = stream_link(io, cap);
        let outcome =
            client_side_handshake(&mut reader, &mut writer, &self.identity, requested_ip).await?;
        Ok(Established { reader, writer, outcome, peer })
    }
}
