//! Default limits for resource accounting.

/// Default ceiling on outstanding messages one sender may hold in one
/// peer's pool. Sized to what a 16-bit per-entry message count can hold.
pub(crate) const DEFAULT_MAX_MESSAGES_PER_SENDER: u32 = 65_535;

/// Default domain-wide budget of in-flight transferable handles per
/// identity.
pub(crate) const DEFAULT_MAX_INFLIGHT_HANDLES: u64 = 16_384;

/// Default bound on distinct live identities in one domain.
pub(crate) const DEFAULT_MAX_USERS: u32 = 16_384;
