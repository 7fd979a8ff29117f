use std::collections::{HashSet, VecDeque};

use super::CryptoError;

/// Bounded set of accepted datagram counters for one epoch.
///
/// Replay protection for transports that reorder: a counter already in
/// the ring is a replay, a counter older than the oldest remembered one
/// by more than the reorder window is stale, anything else is accepted
/// and remembered, evicting the oldest entry once the ring is full.
pub struct NonceRing {
    capacity: usize,
    reorder_window: u64,
    seen: HashSet<u64, ahash::RandomState>,
    order: VecDeque<u64>,
}

impl NonceRing {
    pub fn new(capacity: usize, reorder_window: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            reorder_window,
            seen: HashSet::with_capacity_and_hasher(capacity, ahash::RandomState::default()),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Accept `counter` if it is neither replayed nor stale.
    pub fn accept(&mut self, counter: u64) -> Result<(), CryptoError> {
        if self.seen.contains(&counter) {
            return Err(CryptoError::ReplayDetected);
        }
        if let Some(&oldest) = self.order.front() {
            if counter < oldest.saturating_sub(self.reorder_window) {
                return Err(CryptoError::StaleNonce);
            }
        }

        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(counter);
        self.seen.insert(counter);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
