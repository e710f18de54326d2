//! Quota rejection errors.

use axon_primitives::Uid;

/// Reasons a charge is refused.
///
/// Rejections are expected, recoverable conditions: the pending message is
/// not admitted and no accounting state changes.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The charge would push the sender over its fair share of the pool,
    /// or the pool over its total capacity.
    #[error("charge of {requested} bytes for {uid} exceeds quota ({allocated} held, {cap} allowed)")]
    PoolExceeded {
        /// Identity of the rejected sender.
        uid: Uid,
        /// Bytes the charge asked for.
        requested: u64,
        /// Bytes the sender already holds in this pool.
        allocated: u64,
        /// The sender's fair-share cap at the moment of the charge.
        cap: u64,
    },

    /// The sender already holds the maximum number of outstanding messages.
    #[error("{uid} already holds {limit} outstanding messages")]
    TooManyMessages {
        /// Identity of the rejected sender.
        uid: Uid,
        /// Configured per-sender message ceiling.
        limit: u32,
    },

    /// The identity's domain-wide in-flight handle budget is exhausted.
    #[error("{uid} would exceed {limit} in-flight handles")]
    HandleLimitExceeded {
        /// Identity of the rejected sender.
        uid: Uid,
        /// Configured domain-wide handle budget.
        limit: u64,
    },
}
