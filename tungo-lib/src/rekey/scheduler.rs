use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::service::ServicePacket;

use super::{RekeyFsm, RekeyPhase};

/// Client-side rotation clock, consulted by the egress worker after each
/// data packet.
///
/// When the interval elapses and the FSM is Stable, it mints a fresh
/// X25519 ephemeral, parks the private half in the FSM, and hands back
/// an encoded RekeyInit for the worker to encrypt and send.
pub struct RekeyInitScheduler {
    rotate_at: Instant,
    interval: Duration,
}

impl RekeyInitScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { rotate_at: Instant::now() + interval, interval }
    }

    pub fn tick(&mut self, now: Instant, fsm: &RekeyFsm) -> Option<Vec<u8>> {
        // a rotation the peer never acknowledged must not wedge the
        // schedule forever
        fsm.abort_pending_if_expired(now);

        if now < self.rotate_at {
            return None;
        }
        if fsm.phase() != RekeyPhase::Stable {
            return None;
        }

        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        fsm.store_pending_private(secret);
        self.rotate_at = now + self.interval;
        Some(ServicePacket::RekeyInit(public.to_bytes()).encode())
    }
}
