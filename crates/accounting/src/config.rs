//! Accounting limits configuration.

use crate::constants::*;

/// Limits applied by the accounting engine.
///
/// One value configures a domain: its [`UserRegistry`](crate::UserRegistry)
/// and every [`PeerQuota`](crate::PeerQuota) created in it. All limits must
/// be non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountingConfig {
    /// Ceiling on outstanding messages one sender may hold in one peer's
    /// pool.
    pub max_messages_per_sender: u32,
    /// Domain-wide budget of in-flight transferable handles per identity.
    pub max_inflight_handles: u64,
    /// Bound on distinct live identities in one domain.
    pub max_users: u32,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            max_messages_per_sender: DEFAULT_MAX_MESSAGES_PER_SENDER,
            max_inflight_handles: DEFAULT_MAX_INFLIGHT_HANDLES,
            max_users: DEFAULT_MAX_USERS,
        }
    }
}
