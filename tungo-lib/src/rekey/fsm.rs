use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{derive_rekey_pair, KeySlots, KEY_LEN};

use super::{RekeyError, DEFAULT_PENDING_TIMEOUT, MAX_EPOCH_SAFETY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyPhase {
    /// No rotation in flight; `start_rekey` is the only permitted entry.
    Stable,
    /// Key installation is running outside the lock.
    Rekeying,
    /// Keys installed for receive; send switches on the peer's ACK.
    Pending,
}

/// What `activate_send_epoch` did with the peer's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The pending epoch was promoted; send now uses it.
    Promoted(u16),
    /// An ACK arrived while installation was still running; it will be
    /// honored when installation completes.
    Recorded,
    /// Stale, future, or otherwise inapplicable epoch.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyOutcome {
    pub epoch: u16,
    /// True when an early ACK fast-forwarded straight to Stable.
    pub promoted: bool,
}

/// Observable state tuple, consistent under the FSM lock.
#[derive(Debug, Clone, Copy)]
pub struct FsmSnapshot {
    pub phase: RekeyPhase,
    pub send_epoch: u16,
    pub last_rekey_epoch: u16,
    pub peer_epoch_seen_max: u16,
    pub has_pending: bool,
    pub pending_send_epoch: u16,
    pub pending_since: Option<Instant>,
}

struct FsmState {
    phase: RekeyPhase,
    send_epoch: u16,
    last_rekey_epoch: u16,
    peer_epoch_seen_max: u16,
    has_pending: bool,
    pending_send_epoch: u16,
    pending_since: Option<Instant>,
    pending_private: Option<StaticSecret>,
    early_ack: Option<u16>,
}

/// Effects on the key slots, drained only after the state lock is
/// released so the lock is never held across crypto work.
enum KeyEffect {
    SetSendEpoch(u16),
    RemoveEpoch(u16),
}

/// Rekey lifecycle state machine.
///
/// One mutex guards the bookkeeping fields; key buffers live in the
/// crypto layer behind its own lock. The mutex is released while the
/// slot installation runs, which is what makes the early-ACK path
/// possible: `activate_send_epoch` can interleave with `start_rekey`.
pub struct RekeyFsm {
    state: Mutex<FsmState>,
    slots: Arc<dyn KeySlots>,
    pending_timeout: Duration,
    max_epoch: u16,
}

impl RekeyFsm {
    pub fn new(slots: Arc<dyn KeySlots>, pending_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(FsmState {
                phase: RekeyPhase::Stable,
                send_epoch: 0,
                last_rekey_epoch: 0,
                peer_epoch_seen_max: 0,
                has_pending: false,
                pending_send_epoch: 0,
                pending_since: None,
                pending_private: None,
                early_ack: None,
            }),
            slots,
            pending_timeout,
            max_epoch: MAX_EPOCH_SAFETY,
        }
    }

    #[cfg(test)]
    fn with_max_epoch(mut self, max_epoch: u16) -> Self {
        self.max_epoch = max_epoch;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FsmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, effects: Vec<KeyEffect>) {
        for effect in effects {
            match effect {
                KeyEffect::SetSendEpoch(epoch) => {
                    if !self.slots.set_send_epoch(epoch) {
                        tracing::warn!(epoch, "send-epoch promotion found no matching slot");
                    }
                }
                KeyEffect::RemoveEpoch(epoch) => {
                    self.slots.remove_epoch(epoch);
                }
            }
        }
    }

    pub fn phase(&self) -> RekeyPhase {
        self.lock().phase
    }

    pub fn snapshot(&self) -> FsmSnapshot {
        let st = self.lock();
        FsmSnapshot {
            phase: st.phase,
            send_epoch: st.send_epoch,
            last_rekey_epoch: st.last_rekey_epoch,
            peer_epoch_seen_max: st.peer_epoch_seen_max,
            has_pending: st.has_pending,
            pending_send_epoch: st.pending_send_epoch,
            pending_since: st.pending_since,
        }
    }

    /// Park the ephemeral private key between RekeyInit and RekeyAck.
    pub fn store_pending_private(&self, secret: StaticSecret) {
        self.lock().pending_private = Some(secret);
    }

    pub fn take_pending_private(&self) -> Option<StaticSecret> {
        self.lock().pending_private.take()
    }

    /// Install freshly derived direction keys for the next epoch.
    ///
    /// On success the FSM is Pending (or already Stable if the peer's
    /// ACK raced ahead). Every failure path removes the speculatively
    /// installed slot.
    pub fn start_rekey(
        &self,
        new_c2s: &[u8; KEY_LEN],
        new_s2c: &[u8; KEY_LEN],
    ) -> Result<RekeyOutcome, RekeyError> {
        // the caller may reuse its buffers immediately after this call
        let c2s = *new_c2s;
        let s2c = *new_s2c;

        {
            let mut st = self.lock();
            if st.phase != RekeyPhase::Stable {
                return Err(RekeyError::RekeyInProgress);
            }
            if st.last_rekey_epoch >= self.max_epoch {
                return Err(RekeyError::EpochExhausted);
            }
            st.phase = RekeyPhase::Rekeying;
            st.early_ack = None;
        }

        // slot installation runs without the state lock
        let epoch = self.slots.install_pending(&c2s, &s2c);

        let mut effects = Vec::new();
        let result = {
            let mut st = self.lock();
            if epoch <= st.last_rekey_epoch || epoch <= st.send_epoch {
                st.phase = RekeyPhase::Stable;
                st.early_ack = None;
                effects.push(KeyEffect::RemoveEpoch(epoch));
                Err(RekeyError::NonMonotonicEpoch { epoch })
            } else if epoch >= self.max_epoch {
                st.phase = RekeyPhase::Stable;
                st.early_ack = None;
                st.last_rekey_epoch = epoch;
                effects.push(KeyEffect::RemoveEpoch(epoch));
                Err(RekeyError::EpochExhausted)
            } else if st.early_ack.take() == Some(epoch) {
                // the ACK arrived while we were installing; skip Pending
                st.phase = RekeyPhase::Stable;
                st.send_epoch = epoch;
                st.last_rekey_epoch = epoch;
                st.has_pending = false;
                st.pending_since = None;
                effects.push(KeyEffect::SetSendEpoch(epoch));
                Ok(RekeyOutcome { epoch, promoted: true })
            } else {
                st.phase = RekeyPhase::Pending;
                st.has_pending = true;
                st.pending_send_epoch = epoch;
                st.pending_since = Some(Instant::now());
                Ok(RekeyOutcome { epoch, promoted: false })
            }
        };
        self.apply(effects);
        result
    }

    /// The peer acknowledged `epoch`: switch send to it if it matches
    /// the pending rotation.
    pub fn activate_send_epoch(&self, epoch: u16) -> Activation {
        let mut effects = Vec::new();
        let activation = {
            let mut st = self.lock();
            st.peer_epoch_seen_max = st.peer_epoch_seen_max.max(epoch);
            match st.phase {
                RekeyPhase::Stable => Activation::Ignored,
                RekeyPhase::Rekeying => {
                    st.early_ack = Some(epoch);
                    Activation::Recorded
                }
                RekeyPhase::Pending => {
                    if epoch == st.pending_send_epoch {
                        st.phase = RekeyPhase::Stable;
                        st.send_epoch = epoch;
                        st.last_rekey_epoch = epoch;
                        st.has_pending = false;
                        st.pending_since = None;
                        effects.push(KeyEffect::SetSendEpoch(epoch));
                        Activation::Promoted(epoch)
                    } else {
                        // behind us: the peer will catch up; ahead of
                        // us: remembered in peer_epoch_seen_max above
                        Activation::Ignored
                    }
                }
            }
        };
        self.apply(effects);
        activation
    }

    /// Drop a pending rotation the peer never acknowledged. Returns
    /// whether an abort happened. The comparison is inclusive.
    pub fn abort_pending_if_expired(&self, now: Instant) -> bool {
        let mut effects = Vec::new();
        let aborted = {
            let mut st = self.lock();
            let expired = st.phase == RekeyPhase::Pending
                && st
                    .pending_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= self.pending_timeout);
            if expired {
                st.phase = RekeyPhase::Stable;
                st.has_pending = false;
                st.pending_since = None;
                st.pending_private = None;
                effects.push(KeyEffect::RemoveEpoch(st.pending_send_epoch));
            }
            expired
        };
        self.apply(effects);
        aborted
    }

    /// Run the X25519 agreement against the peer's ephemeral, derive the
    /// next epoch's keys, and start the rotation.
    pub fn rekey_from_dh(
        &self,
        local: StaticSecret,
        peer_public: &[u8; 32],
    ) -> Result<RekeyOutcome, RekeyError> {
        let shared = local.diffie_hellman(&PublicKey::from(*peer_public));
        let keys = derive_rekey_pair(
            shared.as_bytes(),
            &self.slots.current_c2s_key(),
            &self.slots.current_s2c_key(),
        );
        self.start_rekey(&keys.c2s, &keys.s2c)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Scripted key-slot double: records every call, returns a preset
    /// epoch, and can block inside `install_pending` to exercise the
    /// early-ACK interleaving.
    struct MockSlots {
        epoch_to_return: u16,
        installs: StdMutex<Vec<u16>>,
        set_calls: StdMutex<Vec<u16>>,
        remove_calls: StdMutex<Vec<u16>>,
        gate: Option<(StdMutex<Receiver<()>>, Sender<()>)>,
    }

    impl MockSlots {
        fn returning(epoch: u16) -> Arc<Self> {
            Arc::new(Self {
                epoch_to_return: epoch,
                installs: StdMutex::new(Vec::new()),
                set_calls: StdMutex::new(Vec::new()),
                remove_calls: StdMutex::new(Vec::new()),
                gate: None,
            })
        }

        /// Install blocks until the returned sender fires; the returned
        /// receiver reports that installation has begun.
        fn gated(epoch: u16) -> (Arc<Self>, Sender<()>, Receiver<()>) {
            let (release_tx, release_rx) = channel();
            let (entered_tx, entered_rx) = channel();
            let slots = Arc::new(Self {
                epoch_to_return: epoch,
                installs: StdMutex::new(Vec::new()),
                set_calls: StdMutex::new(Vec::new()),
                remove_calls: StdMutex::new(Vec::new()),
                gate: Some((StdMutex::new(release_rx), entered_tx)),
            });
            (slots, release_tx, entered_rx)
        }

        fn set_calls(&self) -> Vec<u16> {
            self.set_calls.lock().unwrap().clone()
        }

        fn remove_calls(&self) -> Vec<u16> {
            self.remove_calls.lock().unwrap().clone()
        }

        fn install_count(&self) -> usize {
            self.installs.lock().unwrap().len()
        }
    }

    impl KeySlots for MockSlots {
        fn install_pending(&self, _new_c2s: &[u8; KEY_LEN], _new_s2c: &[u8; KEY_LEN]) -> u16 {
            if let Some((release, entered)) = &self.gate {
                entered.send(()).unwrap();
                release.lock().unwrap().recv().unwrap();
            }
            self.installs.lock().unwrap().push(self.epoch_to_return);
            self.epoch_to_return
        }

        fn set_send_epoch(&self, epoch: u16) -> bool {
            self.set_calls.lock().unwrap().push(epoch);
            true
        }

        fn remove_epoch(&self, epoch: u16) -> bool {
            self.remove_calls.lock().unwrap().push(epoch);
            true
        }

        fn current_c2s_key(&self) -> [u8; KEY_LEN] {
            [1u8; KEY_LEN]
        }

        fn current_s2c_key(&self) -> [u8; KEY_LEN] {
            [2u8; KEY_LEN]
        }
    }

    const K1: [u8; KEY_LEN] = [0x11; KEY_LEN];
    const K2: [u8; KEY_LEN] = [0x22; KEY_LEN];

    #[test]
    fn happy_path_pending_then_activation() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots.clone(), DEFAULT_PENDING_TIMEOUT);

        let outcome = fsm.start_rekey(&K1, &K2).unwrap();
        assert_eq!(outcome, RekeyOutcome { epoch: 10, promoted: false });

        let snap = fsm.snapshot();
        assert_eq!(snap.phase, RekeyPhase::Pending);
        assert_eq!(snap.send_epoch, 0);
        assert_eq!(snap.pending_send_epoch, 10);
        assert!(snap.has_pending);
        assert!(slots.set_calls().is_empty());

        assert_eq!(fsm.activate_send_epoch(10), Activation::Promoted(10));
        let snap = fsm.snapshot();
        assert_eq!(snap.phase, RekeyPhase::Stable);
        assert_eq!(snap.send_epoch, 10);
        assert_eq!(snap.last_rekey_epoch, 10);
        assert!(!snap.has_pending);
        assert_eq!(slots.set_calls(), vec![10]);
    }

    #[test]
    fn start_rekey_rejected_while_pending() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots.clone(), DEFAULT_PENDING_TIMEOUT);

        fsm.start_rekey(&K1, &K2).unwrap();
        assert_eq!(fsm.start_rekey(&K1, &K2), Err(RekeyError::RekeyInProgress));
        assert_eq!(slots.install_count(), 1);
    }

    #[test]
    fn early_ack_fast_forwards_to_stable() {
        let (slots, release, entered) = MockSlots::gated(42);
        let fsm = Arc::new(RekeyFsm::new(slots.clone(), DEFAULT_PENDING_TIMEOUT));

        let worker = {
            let fsm = fsm.clone();
            std::thread::spawn(move || fsm.start_rekey(&K1, &K2))
        };

        // wait until start_rekey is inside the crypto layer, then land
        // the peer's ACK while the FSM lock is free
        entered.recv().unwrap();
        assert_eq!(fsm.activate_send_epoch(42), Activation::Recorded);
        release.send(()).unwrap();

        let outcome = worker.join().unwrap().unwrap();
        assert_eq!(outcome, RekeyOutcome { epoch: 42, promoted: true });

        let snap = fsm.snapshot();
        assert_eq!(snap.phase, RekeyPhase::Stable);
        assert_eq!(snap.send_epoch, 42);
        assert_eq!(snap.last_rekey_epoch, 42);
        assert!(!snap.has_pending);
        assert_eq!(slots.set_calls(), vec![42]);
    }

    #[test]
    fn pending_timeout_aborts_inclusively() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots.clone(), Duration::from_secs(10));

        fsm.start_rekey(&K1, &K2).unwrap();
        let since = fsm.snapshot().pending_since.unwrap();

        assert!(!fsm.abort_pending_if_expired(since + Duration::from_secs(9)));
        assert_eq!(fsm.snapshot().phase, RekeyPhase::Pending);

        assert!(fsm.abort_pending_if_expired(since + Duration::from_secs(10)));
        let snap = fsm.snapshot();
        assert_eq!(snap.phase, RekeyPhase::Stable);
        assert!(!snap.has_pending);
        assert_eq!(slots.remove_calls(), vec![10]);
        assert!(slots.set_calls().is_empty());
    }

    #[test]
    fn abort_is_a_noop_when_stable() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots.clone(), Duration::from_secs(10));
        assert!(!fsm.abort_pending_if_expired(Instant::now() + Duration::from_secs(60)));
        assert!(slots.remove_calls().is_empty());
    }

    #[test]
    fn exhaustion_short_circuits_before_crypto() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots.clone(), DEFAULT_PENDING_TIMEOUT).with_max_epoch(5);
        {
            let mut st = fsm.lock();
            st.last_rekey_epoch = 5;
        }

        assert_eq!(fsm.start_rekey(&K1, &K2), Err(RekeyError::EpochExhausted));
        assert_eq!(slots.install_count(), 0);
        assert_eq!(fsm.snapshot().phase, RekeyPhase::Stable);
    }

    #[test]
    fn exhaustion_at_install_cleans_up_the_slot() {
        let slots = MockSlots::returning(65_000);
        let fsm = RekeyFsm::new(slots.clone(), DEFAULT_PENDING_TIMEOUT);

        assert_eq!(fsm.start_rekey(&K1, &K2), Err(RekeyError::EpochExhausted));
        assert_eq!(slots.remove_calls(), vec![65_000]);
        let snap = fsm.snapshot();
        assert_eq!(snap.phase, RekeyPhase::Stable);
        assert!(!snap.has_pending);

        // further attempts fail fast without touching the crypto layer
        let installs = slots.install_count();
        assert_eq!(fsm.start_rekey(&K1, &K2), Err(RekeyError::EpochExhausted));
        assert_eq!(slots.install_count(), installs);
    }

    #[test]
    fn non_monotonic_epoch_is_cleaned_up() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots.clone(), DEFAULT_PENDING_TIMEOUT);
        {
            let mut st = fsm.lock();
            st.last_rekey_epoch = 10;
        }

        assert_eq!(
            fsm.start_rekey(&K1, &K2),
            Err(RekeyError::NonMonotonicEpoch { epoch: 10 })
        );
        assert_eq!(slots.remove_calls(), vec![10]);
        assert_eq!(fsm.snapshot().phase, RekeyPhase::Stable);
    }

    #[test]
    fn stale_and_future_acks_are_ignored_in_pending() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots.clone(), DEFAULT_PENDING_TIMEOUT);

        fsm.start_rekey(&K1, &K2).unwrap();
        assert_eq!(fsm.activate_send_epoch(9), Activation::Ignored);
        assert_eq!(fsm.activate_send_epoch(12), Activation::Ignored);

        let snap = fsm.snapshot();
        assert_eq!(snap.phase, RekeyPhase::Pending);
        assert_eq!(snap.peer_epoch_seen_max, 12);
        assert!(slots.set_calls().is_empty());
    }

    #[test]
    fn activation_in_stable_is_a_noop() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots.clone(), DEFAULT_PENDING_TIMEOUT);
        assert_eq!(fsm.activate_send_epoch(3), Activation::Ignored);
        assert!(slots.set_calls().is_empty());
        assert_eq!(fsm.snapshot().send_epoch, 0);
    }

    #[test]
    fn caller_buffers_are_copied_defensively() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots, DEFAULT_PENDING_TIMEOUT);

        let mut c2s = K1;
        let mut s2c = K2;
        fsm.start_rekey(&c2s, &s2c).unwrap();
        // mutating the caller's buffers after the call is harmless
        c2s.fill(0);
        s2c.fill(0);
        assert_eq!(fsm.snapshot().pending_send_epoch, 10);
    }

    #[test]
    fn pending_private_key_custody() {
        let slots = MockSlots::returning(10);
        let fsm = RekeyFsm::new(slots, DEFAULT_PENDING_TIMEOUT);

        assert!(fsm.take_pending_private().is_none());
        fsm.store_pending_private(StaticSecret::from([9u8; 32]));
        assert!(fsm.take_pending_private().is_some());
        assert!(fsm.take_pending_private().is_none());
    }
}
