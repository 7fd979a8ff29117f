use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ahash::RandomState;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::TunnelError;

use super::{canonical_ip, Session, SessionRepository};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// TTL decorator over the session repository.
///
/// Registration and every successful lookup push a session's deadline
/// out by the TTL. A background sweeper wakes on the cleanup interval,
/// snapshots the still-live internal addresses, and deletes every
/// session absent from the snapshot through the inner repository.
pub struct TtlRepository {
    inner: SessionRepository,
    ttl: Duration,
    deadlines: Mutex<HashMap<IpAddr, Instant, RandomState>>,
}

impl TtlRepository {
    /// Non-positive durations fall back to the defaults.
    pub fn new(inner: SessionRepository, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_SESSION_TTL } else { ttl };
        Self { inner, ttl, deadlines: Mutex::new(HashMap::default()) }
    }

    pub fn inner(&self) -> &SessionRepository {
        &self.inner
    }

    fn deadlines(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, Instant, RandomState>> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a session's expiry out by the TTL.
    pub fn touch(&self, internal: IpAddr) {
        self.deadlines()
            .insert(canonical_ip(internal), Instant::now() + self.ttl);
    }

    pub async fn add(&self, session: Arc<Session>) {
        self.touch(session.internal_addr());
        self.inner.add(session).await;
    }

    pub async fn delete(&self, session: &Arc<Session>) {
        self.deadlines().remove(&session.internal_addr());
        self.inner.delete(session).await;
    }

    pub async fn get_by_internal(&self, addr: IpAddr) -> Result<Arc<Session>, TunnelError> {
        let session = self.inner.get_by_internal(addr).await?;
        self.touch(session.internal_addr());
        Ok(session)
    }

    pub async fn get_by_external(&self, addr: SocketAddr) -> Result<Arc<Session>, TunnelError> {
        let session = self.inner.get_by_external(addr).await?;
        self.touch(session.internal_addr());
        Ok(session)
    }

    /// Evict every session whose deadline has passed. Deletions are
    /// collected during `range` and applied in a second pass, since the
    /// range callback may not mutate the repository.
    pub async fn sweep(&self, now: Instant) -> usize {
        let live: HashSet<IpAddr, RandomState> = {
            let mut deadlines = self.deadlines();
            deadlines.retain(|_, expires_at| *expires_at > now);
            deadlines.keys().copied().collect()
        };

        let mut doomed = Vec::new();
        self.inner
            .range(|session| {
                if !live.contains(&session.internal_addr()) {
                    doomed.push(session.clone());
                }
                true
            })
            .await;

        for session in &doomed {
            debug!(internal = %session.internal_addr(), "evicting expired session");
            self.inner.delete(session).await;
        }
        doomed.len()
    }

    /// Background eviction task bound to the server's lifetime.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        cleanup_interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cleanup_interval = if cleanup_interval.is_zero() {
            DEFAULT_CLEANUP_INTERVAL
        } else {
            cleanup_interval
        };
        let repo = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick of tokio's interval fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = repo.sweep(Instant::now()).await;
                        if evicted > 0 {
                            info!(evicted, "session TTL sweep");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::session;
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn repo(ttl: Duration) -> TtlRepository {
        TtlRepository::new(SessionRepository::new(), ttl)
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let repo = repo(Duration::from_secs(60));
        let s = session(ip("10.0.0.2"), sa("1.1.1.1:1001"));
        repo.add(s.clone()).await;

        assert_eq!(repo.sweep(Instant::now()).await, 0);
        assert_eq!(repo.sweep(Instant::now() + Duration::from_secs(61)).await, 1);
        assert!(s.is_closed());
        assert!(repo.inner().is_empty().await);
    }

    #[tokio::test]
    async fn lookups_refresh_the_deadline() {
        let repo = repo(Duration::from_secs(60));
        let s = session(ip("10.0.0.2"), sa("1.1.1.1:1001"));
        repo.add(s.clone()).await;

        let later = Instant::now() + Duration::from_secs(45);
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(45)).await;
        repo.get_by_external(sa("1.1.1.1:1001")).await.unwrap();
        tokio::time::resume();

        // 61s after add, but only ~16s after the refreshing lookup
        assert_eq!(repo.sweep(later + Duration::from_secs(16)).await, 0);
        assert!(!s.is_closed());
    }

    #[tokio::test]
    async fn delete_clears_the_deadline() {
        let repo = repo(Duration::from_secs(60));
        let s = session(ip("10.0.0.2"), sa("1.1.1.1:1001"));
        repo.add(s.clone()).await;
        repo.delete(&s).await;

        assert!(repo.deadlines().is_empty());
        assert_eq!(repo.sweep(Instant::now() + Duration::from_secs(61)).await, 0);
    }

    #[tokio::test]
    async fn zero_durations_are_coerced() {
        let repo = repo(Duration::ZERO);
        assert_eq!(repo.ttl, DEFAULT_SESSION_TTL);
    }

    #[tokio::test]
    async fn sessions_without_deadline_entries_are_evicted() {
        // a session that somehow lost its TTL entry is garbage-collected
        let repo = repo(Duration::from_secs(60));
        let s = session(ip("10.0.0.2"), sa("1.1.1.1:1001"));
        repo.inner().add(s.clone()).await;

        assert_eq!(repo.sweep(Instant::now()).await, 1);
        assert!(s.is_closed());
    }
}
