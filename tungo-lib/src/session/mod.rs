//! Runtime binding of a VPN peer: transport send half, crypto session,
//! rekey state machine, and the addresses it is indexed under.

mod repository;
mod ttl;

pub use repository::{canonical_addr, canonical_ip, SessionRepository};
pub use ttl::{TtlRepository, DEFAULT_CLEANUP_INTERVAL, DEFAULT_SESSION_TTL};

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::crypto::SharedCipher;
use crate::error::Result;
use crate::rekey::RekeyFsm;
use crate::transport::LinkWriter;

pub struct Session {
    internal_addr: IpAddr,
    external_addr: SocketAddr,
    cipher: SharedCipher,
    fsm: Arc<RekeyFsm>,
    writer: Mutex<LinkWriter>,
    cancel: CancellationToken,
    closed: AtomicBool,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl Session {
    pub fn new(
        internal_addr: IpAddr,
        external_addr: SocketAddr,
        cipher: SharedCipher,
        fsm: Arc<RekeyFsm>,
        writer: LinkWriter,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            internal_addr: canonical_ip(internal_addr),
            external_addr: canonical_addr(external_addr),
            cipher,
            fsm,
            writer: Mutex::new(writer),
            cancel,
            closed: AtomicBool::new(false),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        })
    }

    pub fn internal_addr(&self) -> IpAddr {
        self.internal_addr
    }

    pub fn external_addr(&self) -> SocketAddr {
        self.external_addr
    }

    pub fn cipher(&self) -> &SharedCipher {
        &self.cipher
    }

    pub fn fsm(&self) -> &Arc<RekeyFsm> {
        &self.fsm
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Encrypt a plaintext record under the active epoch and send it.
    /// The cipher lock is released before the transport write.
    pub async fn encrypt_and_send(&self, plaintext: &[u8]) -> Result<()> {
        let record = { self.cipher.lock().encrypt(plaintext)? };
        self.send_record(&record).await
    }

    pub async fn send_record(&self, record: &[u8]) -> Result<()> {
        self.writer.lock().await.send(record).await
    }

    /// Shut the transport send half down. Called from worker teardown;
    /// separate from `close` because it must await the writer lock.
    pub async fn shutdown_transport(&self) {
        self.writer.lock().await.shutdown().await;
    }

    /// Cancel the session's tasks and mark it closed. Idempotent:
    /// returns true only for the call that performed the close. Key
    /// material is released when the last worker drops its handles.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn add_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// (tun→transport, transport→tun) byte counters.
    pub fn traffic(&self) -> (u64, u64) {
        (
            self.bytes_up.load(Ordering::Relaxed),
            self.bytes_down.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::{NonceMode, SessionSecrets, TunnelCipher, KEY_LEN};
    use crate::framing::FrameCap;
    use crate::rekey::DEFAULT_PENDING_TIMEOUT;
    use crate::transport::stream_link;
    use zeroize::Zeroizing;

    /// Session wired to a throwaway duplex pipe, for repository tests.
    pub(crate) fn session(internal: IpAddr, external: SocketAddr) -> Arc<Session> {
        let (io, _peer) = tokio::io::duplex(1024);
        let cap = FrameCap::new(1518).unwrap();
        let (_reader, writer) = stream_link(Box::new(io), cap);
        let cipher = SharedCipher::new(TunnelCipher::new(
            SessionSecrets {
                id: [0u8; 32],
                key_c2s: Zeroizing::new([1u8; KEY_LEN]),
                key_s2c: Zeroizing::new([2u8; KEY_LEN]),
                is_server: true,
            },
            NonceMode::Stream,
        ));
        let fsm = Arc::new(RekeyFsm::new(
            Arc::new(cipher.clone()),
            DEFAULT_PENDING_TIMEOUT,
        ));
        Session::new(
            internal,
            external,
            cipher,
            fsm,
            writer,
            CancellationToken::new(),
        )
    }
}
