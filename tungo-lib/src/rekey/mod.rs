//! Ephemeral key rotation between peers.
//!
//! The client periodically offers a fresh X25519 ephemeral via a
//! RekeyInit service packet; the server answers with its own ephemeral
//! in a RekeyAck. Both sides feed the shared secret through HKDF salted
//! by the current direction keys and install the result one epoch ahead
//! of the active slot. The state machine in [`fsm`] coordinates when
//! each side may switch its send direction to the new epoch.

mod fsm;
mod scheduler;

pub use fsm::{Activation, FsmSnapshot, RekeyFsm, RekeyOutcome, RekeyPhase};
pub use scheduler::RekeyInitScheduler;

use thiserror::Error;

/// Highest epoch a session may rekey to before it must be torn down and
/// re-established. Leaves headroom below the u16 ceiling so an epoch
/// increment can never wrap.
pub const MAX_EPOCH_SAFETY: u16 = 65_000;

/// How long a pending epoch waits for the peer's acknowledgment before
/// it is dropped.
pub const DEFAULT_PENDING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RekeyError {
    #[error("rekey already in progress")]
    RekeyInProgress,

    #[error("epoch space exhausted")]
    EpochExhausted,

    #[error("non-monotonic epoch {epoch}")]
    NonMonotonicEpoch { epoch: u16 },
}
