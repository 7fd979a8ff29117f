//! Dataplane workers: the per-connection loops that pump IP packets
//! between the TUN device and the encrypted transport.
//!
//! The client runs both directions (its egress loop also drives the
//! rekey scheduler and keep-alives). Server sessions run an ingress loop
//! each, while the shared-TUN egress side lives in [`dispatch`].

mod dispatch;
mod filter;

pub use dispatch::run_tun_dispatcher;
pub use filter::{destination_ip, is_source_allowed, source_ip};

use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use rand::rngs::OsRng;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::rekey::{RekeyError, RekeyInitScheduler};
use crate::service::ServicePacket;
use crate::session::{Session, TtlRepository};
use crate::transport::LinkReader;
use crate::tun::TunDevice;

/// Which end of the tunnel this worker serves; decides how rekey control
/// packets are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Cancelled,
    ReadFailed,
    WriteFailed,
    TunClosed,
    TunWriteFailed,
    PeerReset,
    EpochExhausted,
    Protocol,
}

pub struct WorkerSettings {
    pub mtu: usize,
    /// Egress source allowlist; `None` disables filtering.
    pub allowlist: Option<Vec<IpNet>>,
    /// Idle interval after which the client emits a KeepAlive.
    pub keepalive_interval: Option<Duration>,
}

pub(crate) enum Step {
    Continue,
    Exit(ExitReason),
}

/// Run the client dataplane until teardown: ingress as a task, egress
/// inline, first exit cancels the other through the session token.
pub async fn run_client_worker(
    session: Arc<Session>,
    reader: LinkReader,
    tun: Arc<TunDevice>,
    scheduler: RekeyInitScheduler,
    settings: WorkerSettings,
) -> ExitReason {
    let ingress = {
        let session = session.clone();
        let tun = tun.clone();
        let mtu = settings.mtu;
        tokio::spawn(async move {
            let exit = run_ingress(&session, reader, &tun, Role::Client, None, mtu).await;
            session.close();
            exit
        })
    };

    let egress_exit = run_egress(&session, &tun, scheduler, &settings).await;
    session.close();
    let ingress_exit = ingress.await.unwrap_or(ExitReason::Cancelled);

    session.shutdown_transport().await;
    let (up, down) = session.traffic();
    info!(
        internal = %session.internal_addr(),
        bytes_up = up,
        bytes_down = down,
        ?egress_exit,
        ?ingress_exit,
        "client worker stopped"
    );

    if ingress_exit == ExitReason::Cancelled {
        egress_exit
    } else {
        ingress_exit
    }
}

/// Run one server-side session's ingress until teardown, then remove the
/// session from the repository. Deletion and close are both idempotent.
pub async fn run_server_worker(
    session: Arc<Session>,
    reader: LinkReader,
    tun: Arc<TunDevice>,
    repo: Arc<TtlRepository>,
    mtu: usize,
) {
    let exit = run_ingress(&session, reader, &tun, Role::Server, Some(&repo), mtu).await;
    session.close();
    session.shutdown_transport().await;
    repo.delete(&session).await;

    let (up, down) = session.traffic();
    info!(
        internal = %session.internal_addr(),
        external = %session.external_addr(),
        bytes_up = up,
        bytes_down = down,
        ?exit,
        "session closed"
    );
}

/// TUN → transport. Reads up to MTU bytes, applies the source filter,
/// encrypts, sends, and (client side) gives the rekey scheduler a tick
/// after each data packet.
async fn run_egress(
    session: &Arc<Session>,
    tun: &TunDevice,
    mut scheduler: RekeyInitScheduler,
    settings: &WorkerSettings,
) -> ExitReason {
    let cancel = session.cancel_token().clone();
    let mut buf = vec![0u8; settings.mtu];
    let mut last_activity = Instant::now();

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return ExitReason::Cancelled,
            read = tun.read_packet(&mut buf) => read,
            _ = keepalive_due(last_activity, settings.keepalive_interval) => {
                if let Err(err) = session.encrypt_and_send(&ServicePacket::KeepAlive.encode()).await {
                    debug!(error = %err, "keep-alive send failed");
                    return ExitReason::WriteFailed;
                }
                last_activity = Instant::now();
                continue;
            }
        };

        let n = match read {
            Ok(n) => n,
            Err(err) => {
                if cancel.is_cancelled() {
                    return ExitReason::Cancelled;
                }
                warn!(error = %err, "tun read failed");
                return ExitReason::TunClosed;
            }
        };
        if n == 0 {
            continue;
        }

        if let Some(allowlist) = &settings.allowlist {
            if !is_source_allowed(&buf[..n], allowlist) {
                trace!("dropping packet outside source allowlist");
                continue;
            }
        }

        if let Err(err) = session.encrypt_and_send(&buf[..n]).await {
            if !cancel.is_cancelled() {
                debug!(error = %err, "transport write failed");
            }
            return ExitReason::WriteFailed;
        }
        session.add_up(n as u64);
        last_activity = Instant::now();

        if let Some(init) = scheduler.tick(Instant::now().into_std(), session.fsm()) {
            if session.encrypt_and_send(&init).await.is_err() {
                return ExitReason::WriteFailed;
            }
            debug!("rekey init sent");
        }
    }
}

async fn keepalive_due(last_activity: Instant, interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep_until(last_activity + interval).await,
        None => std::future::pending().await,
    }
}

/// Transport → TUN. One record per iteration; per-packet failures drop
/// the packet and keep the loop alive, everything else tears down.
async fn run_ingress(
    session: &Arc<Session>,
    mut reader: LinkReader,
    tun: &TunDevice,
    role: Role,
    repo: Option<&Arc<TtlRepository>>,
    mtu: usize,
) -> ExitReason {
    let cancel = session.cancel_token().clone();
    let overhead = session.cipher().lock().overhead();
    let mut buf = vec![0u8; crate::framing::MAX_FRAME_CAP as usize];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return ExitReason::Cancelled,
            read = reader.recv(&mut buf) => read,
        };
        let n = match read {
            Ok(n) => n,
            Err(err) => {
                if cancel.is_cancelled() {
                    return ExitReason::Cancelled;
                }
                debug!(error = %err, "transport read failed");
                return ExitReason::ReadFailed;
            }
        };

        match process_record(session, &buf[..n], tun, role, repo, mtu, overhead).await {
            Step::Continue => {}
            Step::Exit(reason) => return reason,
        }
    }
}

/// Handle one received record: length sanity, decrypt with slot
/// fallback, then either control dispatch or TUN delivery.
///
/// Shared between the per-session ingress loops and the UDP acceptor,
/// which demultiplexes records inline.
pub(crate) async fn process_record(
    session: &Arc<Session>,
    record: &[u8],
    tun: &TunDevice,
    role: Role,
    repo: Option<&Arc<TtlRepository>>,
    mtu: usize,
    overhead: usize,
) -> Step {
    if record.len() < overhead || record.len() > mtu + overhead {
        trace!(len = record.len(), "dropping record with implausible length");
        return Step::Continue;
    }

    let plaintext = match session.cipher().lock().decrypt(record) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            trace!(error = %err, "dropping undecryptable record");
            return Step::Continue;
        }
    };

    // a rotation the peer never acknowledged must not linger
    session
        .fsm()
        .abort_pending_if_expired(std::time::Instant::now());

    match ServicePacket::decode(&plaintext) {
        Ok(None) => {
            if let Err(err) = tun.write_packet(&plaintext).await {
                warn!(error = %err, "tun write failed");
                return Step::Exit(ExitReason::TunWriteFailed);
            }
            session.add_down(plaintext.len() as u64);
            repo_touch(session, repo);
            Step::Continue
        }
        Ok(Some(packet)) => handle_service(session, packet, role, repo).await,
        Err(err) => {
            debug!(error = %err, "dropping malformed service packet");
            Step::Continue
        }
    }
}

async fn handle_service(
    session: &Arc<Session>,
    packet: ServicePacket,
    role: Role,
    repo: Option<&Arc<TtlRepository>>,
) -> Step {
    match (packet, role) {
        (ServicePacket::RekeyInit(peer_public), Role::Server) => {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret);
            match session.fsm().rekey_from_dh(secret, &peer_public) {
                Ok(outcome) => {
                    // the ACK still travels under the old epoch; only
                    // after it is on the wire may send switch, which
                    // ordered delivery makes safe for stream transports
                    let ack = ServicePacket::RekeyAck(public.to_bytes()).encode();
                    if session.encrypt_and_send(&ack).await.is_err() {
                        return Step::Exit(ExitReason::WriteFailed);
                    }
                    session.fsm().activate_send_epoch(outcome.epoch);
                    debug!(epoch = outcome.epoch, "rekey answered");
                    Step::Continue
                }
                Err(err) => rekey_failure(session, err).await,
            }
        }
        (ServicePacket::RekeyAck(peer_public), Role::Client) => {
            let Some(secret) = session.fsm().take_pending_private() else {
                debug!("dropping unsolicited rekey ack");
                return Step::Continue;
            };
            match session.fsm().rekey_from_dh(secret, &peer_public) {
                Ok(outcome) => {
                    session.fsm().activate_send_epoch(outcome.epoch);
                    info!(epoch = outcome.epoch, "rekey complete");
                    Step::Continue
                }
                Err(err) => rekey_failure(session, err).await,
            }
        }
        (ServicePacket::SessionReset, _) => {
            info!("peer requested session reset");
            Step::Exit(ExitReason::PeerReset)
        }
        (ServicePacket::KeepAlive, Role::Server) => {
            repo_touch(session, repo);
            // echo, so the client's read deadline sees a live link
            if session
                .encrypt_and_send(&ServicePacket::KeepAlive.encode())
                .await
                .is_err()
            {
                return Step::Exit(ExitReason::WriteFailed);
            }
            Step::Continue
        }
        (ServicePacket::KeepAlive, Role::Client) => Step::Continue,
        (packet, role) => {
            debug!(?packet, ?role, "dropping control packet for the wrong role");
            Step::Continue
        }
    }
}

fn repo_touch(session: &Arc<Session>, repo: Option<&Arc<TtlRepository>>) {
    if let Some(repo) = repo {
        repo.touch(session.internal_addr());
    }
}

async fn rekey_failure(session: &Arc<Session>, err: RekeyError) -> Step {
    match err {
        RekeyError::RekeyInProgress => {
            debug!("rekey already in flight; peer will retry");
            Step::Continue
        }
        RekeyError::EpochExhausted => {
            warn!("epoch space exhausted; resetting session");
            let _ = session
                .encrypt_and_send(&ServicePacket::SessionReset.encode())
                .await;
            Step::Exit(ExitReason::EpochExhausted)
        }
        RekeyError::NonMonotonicEpoch { epoch } => {
            warn!(epoch, "non-monotonic rekey epoch; tearing session down");
            Step::Exit(ExitReason::Protocol)
        }
    }
}
