//! User resource accounting and per-peer quota for the axon message bus.
//!
//! Every peer connection on the bus is owned by a caller identity, and
//! every receiving peer queues messages into a bounded memory pool. This
//! crate is the governance layer in between:
//!
//! - [`UserRegistry`] deduplicates identities into reference-counted
//!   [`User`] objects carrying domain-wide usage (in-flight transferable
//!   handles), independent of how many connections an identity owns.
//! - [`PeerQuota`] apportions one receiving peer's pool capacity and
//!   message slots fairly among the senders charging against it, with a
//!   dynamic equal-share bound over the currently active senders.
//!
//! Transport, message delivery and pool memory belong to the callers: they
//! acquire a [`User`] when a connection is established and release it on
//! teardown, call [`PeerQuota::charge`] before admitting a message into a
//! pool and [`PeerQuota::discharge`] when the message is released. Charges
//! are all-or-nothing and every operation completes without blocking on
//! I/O.

mod args;
mod config;
mod constants;
mod quota;
mod registry;
mod user;

pub use args::AccountingArgs;
pub use config::AccountingConfig;
pub use quota::{PeerQuota, QuotaEntry, QuotaError, QuotaSnapshot};
pub use registry::{RegistryError, UserRegistry};
pub use user::{User, UserSlot};

pub use axon_primitives::Uid;
