use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ahash::RandomState;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::TunnelError;

use super::Session;

/// Rewrite IPv4-mapped IPv6 addresses to plain IPv4 so both address
/// families probe the same index entries.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(canonical_ip(addr.ip()), addr.port())
}

struct Indexes {
    by_internal: HashMap<IpAddr, Arc<Session>, RandomState>,
    by_external: HashMap<SocketAddr, Arc<Session>, RandomState>,
}

/// Dual-indexed store for live sessions: by VPN-internal address and by
/// transport-external address. Every live session is present in both
/// indexes or in neither.
///
/// `add`/`delete` take the write lock, lookups and `range` the read
/// lock. A `range` callback must not call back into `add`/`delete`;
/// deletions discovered during a sweep are deferred to a second pass.
pub struct SessionRepository {
    inner: RwLock<Indexes>,
}

impl Default for SessionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes {
                by_internal: HashMap::default(),
                by_external: HashMap::default(),
            }),
        }
    }

    /// Register a session under both of its addresses. Any session
    /// already holding either key is displaced and closed; a client
    /// whose NAT binding moved reconnects with a new external address
    /// and silently replaces its old self.
    pub async fn add(&self, session: Arc<Session>) {
        let internal = session.internal_addr();
        let external = session.external_addr();

        let mut indexes = self.inner.write().await;
        for displaced in [
            indexes.by_internal.remove(&internal),
            indexes.by_external.remove(&external),
        ]
        .into_iter()
        .flatten()
        {
            indexes.by_internal.remove(&displaced.internal_addr());
            indexes.by_external.remove(&displaced.external_addr());
            debug!(
                internal = %displaced.internal_addr(),
                external = %displaced.external_addr(),
                "displacing session"
            );
            displaced.close();
        }
        indexes.by_internal.insert(internal, session.clone());
        indexes.by_external.insert(external, session);
    }

    /// Remove a session from both indexes and close it. Deleting a
    /// session that was already removed (or displaced by a newer one
    /// under the same keys) only re-runs the idempotent close.
    pub async fn delete(&self, session: &Arc<Session>) {
        let mut indexes = self.inner.write().await;
        if indexes
            .by_internal
            .get(&session.internal_addr())
            .is_some_and(|held| Arc::ptr_eq(held, session))
        {
            indexes.by_internal.remove(&session.internal_addr());
        }
        if indexes
            .by_external
            .get(&session.external_addr())
            .is_some_and(|held| Arc::ptr_eq(held, session))
        {
            indexes.by_external.remove(&session.external_addr());
        }
        drop(indexes);
        session.close();
    }

    pub async fn get_by_internal(&self, addr: IpAddr) -> Result<Arc<Session>, TunnelError> {
        self.inner
            .read()
            .await
            .by_internal
            .get(&canonical_ip(addr))
            .cloned()
            .ok_or(TunnelError::SessionNotFound)
    }

    pub async fn get_by_external(&self, addr: SocketAddr) -> Result<Arc<Session>, TunnelError> {
        self.inner
            .read()
            .await
            .by_external
            .get(&canonical_addr(addr))
            .cloned()
            .ok_or(TunnelError::SessionNotFound)
    }

    /// Visit every session until the callback returns false. Runs under
    /// the read lock: the callback must not call `add` or `delete` on
    /// this repository.
    pub async fn range<F: FnMut(&Arc<Session>) -> bool>(&self, mut f: F) {
        let indexes = self.inner.read().await;
        for session in indexes.by_internal.values() {
            if !f(session) {
                break;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_internal.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_internal.is_empty()
    }

    /// Drain every session, closing each. Used at server shutdown.
    pub async fn clear(&self) {
        let mut indexes = self.inner.write().await;
        for session in indexes.by_internal.values() {
            session.close();
        }
        indexes.by_internal.clear();
        indexes.by_external.clear();
    }
}
