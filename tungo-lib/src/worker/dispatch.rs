use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::session::TtlRepository;
use crate::tun::TunDevice;

use super::destination_ip;

/// Server-side egress: one task reads the shared TUN device and routes
/// each packet to the owning session by destination address.
///
/// The session handle is copied out of the repository before any crypto
/// or transport work, so the repository lock is never held across them.
pub async fn run_tun_dispatcher(
    repo: Arc<TtlRepository>,
    tun: Arc<TunDevice>,
    mtu: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; mtu];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tun.read_packet(&mut buf) => read,
        };
        let n = match read {
            Ok(n) => n,
            Err(err) => {
                if !cancel.is_cancelled() {
                    warn!(error = %err, "tun read failed, stopping dispatcher");
                }
                break;
            }
        };
        if n == 0 {
            continue;
        }

        let Some(dest) = destination_ip(&buf[..n]) else {
            trace!("dropping packet with unparsable destination");
            continue;
        };
        let session = match repo.get_by_internal(dest).await {
            Ok(session) => session,
            Err(_) => {
                trace!(%dest, "no session for destination");
                continue;
            }
        };

        match session.encrypt_and_send(&buf[..n]).await {
            Ok(()) => session.add_up(n as u64),
            Err(err) => {
                warn!(internal = %session.internal_addr(), error = %err, "egress failed, closing session");
                repo.delete(&session).await;
            }
        }
    }
}
