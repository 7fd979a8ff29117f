//! ChaCha20-Poly1305 session crypto with epoch-tagged key slots.
//!
//! A session holds at most three concurrent slots: `active`, an optional
//! `previous` (kept for receive fallback until the active slot sees its
//! first packet), and an optional `pending_recv` installed by the rekey
//! machinery. The 2-byte epoch is always the associated data, which
//! binds every packet to its key generation.
//!
//! Nonce discipline differs by transport class: stream transports derive
//! the 12-byte nonce from a per-direction send counter and never put it
//! on the wire; datagram transports prepend an 8-byte explicit counter
//! because datagrams may reorder or drop, and guard receives with a
//! bounded ring of accepted counters.

mod cipher;
mod kdf;
mod replay;
mod slot;

pub use cipher::{SharedCipher, TunnelCipher};
pub use kdf::{derive_rekey_pair, DirectionKeys, REKEY_LABEL_C2S, REKEY_LABEL_S2C};
pub use replay::NonceRing;

use thiserror::Error;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const EPOCH_AAD_LEN: usize = 2;
pub const EXPLICIT_NONCE_LEN: usize = 8;

/// Ciphertext overhead of a stream record.
pub const STREAM_OVERHEAD: usize = TAG_LEN;
/// Ciphertext overhead of a datagram record.
pub const DATAGRAM_OVERHEAD: usize = EXPLICIT_NONCE_LEN + TAG_LEN;

/// Accepted counters remembered per epoch on datagram transports.
pub const DEFAULT_NONCE_RING_SIZE: usize = 100_000;
/// How far behind the oldest remembered counter a datagram may arrive
/// before it is considered stale rather than merely reordered.
pub const DEFAULT_REORDER_WINDOW: u64 = 1_024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("decrypt failed")]
    DecryptFailed,

    #[error("replayed nonce")]
    ReplayDetected,

    #[error("stale nonce outside reorder window")]
    StaleNonce,

    #[error("send counter exhausted")]
    CounterExhausted,
}

/// Whether a session runs stream (implicit counter) or datagram
/// (explicit nonce + replay ring) nonce discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceMode {
    Stream,
    Datagram { ring_size: usize },
}

/// Handshake output a crypto session is built from.
pub struct SessionSecrets {
    /// Handshake transcript hash, used to correlate log lines.
    pub id: [u8; 32],
    pub key_c2s: Zeroizing<[u8; KEY_LEN]>,
    pub key_s2c: Zeroizing<[u8; KEY_LEN]>,
    pub is_server: bool,
}

/// Key-slot surface the rekey state machine drives.
///
/// Implementations take `&self` and synchronize internally so the FSM
/// can hold its own lock independently of the cipher's.
pub trait KeySlots: Send + Sync {
    /// Install a `pending_recv` slot for the next epoch and return the
    /// epoch that was assigned.
    fn install_pending(&self, new_c2s: &[u8; KEY_LEN], new_s2c: &[u8; KEY_LEN]) -> u16;

    /// Promote the pending slot with this epoch to active for sending.
    fn set_send_epoch(&self, epoch: u16) -> bool;

    /// Drop the slot holding this epoch. Returns whether it existed.
    fn remove_epoch(&self, epoch: u16) -> bool;

    fn current_c2s_key(&self) -> [u8; KEY_LEN];
    fn current_s2c_key(&self) -> [u8; KEY_LEN];
}
