//! Client runtime: establish, pump, reconnect.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, Protocol};
use crate::crypto::{NonceMode, SharedCipher, TunnelCipher};
use crate::error::Result;
use crate::establish::Establisher;
use crate::rekey::{RekeyFsm, RekeyInitScheduler};
use crate::session::Session;
use crate::tun::TunDevice;
use crate::worker::{run_client_worker, ExitReason, WorkerSettings};

pub async fn run_client(
    cfg: Arc<Config>,
    tun: Arc<TunDevice>,
    cancel: CancellationToken,
) -> Result<()> {
    let establisher = Establisher::new(cfg.clone(), cancel.clone())?;

    while !cancel.is_cancelled() {
        let established = match establisher.establish().await {
            Ok(established) => established,
            Err(crate::error::TunnelError::Cancelled) => break,
            Err(err) => return Err(err),
        };

        let mode = match cfg.protocol {
            Protocol::UDP => NonceMode::Datagram { ring_size: cfg.udp_nonce_ring_size() },
            _ => NonceMode::Stream,
        };
        let internal_ip = established.outcome.internal_ip;
        let cipher = SharedCipher::new(TunnelCipher::new(established.outcome.secrets, mode));
        let fsm = Arc::new(RekeyFsm::new(
            Arc::new(cipher.clone()),
            cfg.pending_rekey_timeout(),
        ));
        let session = Session::new(
            internal_ip,
            established.peer,
            cipher,
            fsm,
            established.writer,
            cancel.child_token(),
        );

        let scheduler = RekeyInitScheduler::new(cfg.rekey_interval());
        let settings = WorkerSettings {
            mtu: cfg.mtu,
            allowlist: cfg.egress_allowlist.clone(),
            keepalive_interval: Some(cfg.keepalive_interval()),
        };

        info!(internal = %internal_ip, "tunnel up");
        let exit = run_client_worker(
            session,
            established.reader,
            tun.clone(),
            scheduler,
            settings,
        )
        .await;

        match exit {
            ExitReason::Cancelled => break,
            // the TUN side is gone; reconnecting cannot help
            ExitReason::TunClosed | ExitReason::TunWriteFailed => break,
            reason => {
                info!(?reason, "tunnel down, reconnecting");
            }
        }
    }

    info!("client stopped");
    Ok(())
}
