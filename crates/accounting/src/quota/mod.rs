//! Per-peer quota accounting.
//!
//! Every receiving peer owns a [`PeerQuota`] apportioning its bounded pool
//! among the senders currently charging against it. The transport layer
//! calls [`charge`](PeerQuota::charge) before a message is admitted into
//! the pool and [`discharge`](PeerQuota::discharge) when it is released.
//!
//! # Fairness
//!
//! A charge is admitted only if the sender's accounted bytes stay within an
//! equal share of the pool: with `k` senders holding outstanding messages
//! (counting the one charging), each may hold at most `pool_size / k`
//! bytes. The bound is recomputed on every charge, so it tightens as
//! senders become active and relaxes as they drain. A global backstop keeps
//! the summed charges within the pool even while `k` is small, and a
//! per-sender message ceiling bounds zero-size message floods.

mod entry;
mod error;

pub use entry::QuotaEntry;
pub use error::QuotaError;

use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::config::AccountingConfig;
use crate::user::{User, UserSlot};

/// Aggregate view of one peer's quota table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaSnapshot {
    /// Bytes currently reserved across all senders.
    pub total_allocated_size: u64,
    /// Outstanding messages across all senders.
    pub total_messages: u64,
    /// Allocated table rows (high-water mark of sender slots).
    pub n_entries: usize,
    /// Senders currently holding at least one outstanding message.
    pub n_active: usize,
}

/// Sender table and running totals, guarded by the quota mutex.
#[derive(Default)]
struct QuotaTable {
    entries: Vec<QuotaEntry>,
    n_active: usize,
    total_allocated_size: u64,
    total_messages: u64,
}

impl QuotaTable {
    /// Row for `slot`, growing the table on first contact.
    ///
    /// Growth appends zeroed rows only; existing rows keep their values.
    fn entry_mut(&mut self, slot: usize) -> &mut QuotaEntry {
        if self.entries.len() <= slot {
            self.entries.resize_with(slot + 1, QuotaEntry::default);
        }
        &mut self.entries[slot]
    }
}

/// Per-receiving-peer quota state.
///
/// Owned by exactly one receiving peer and dropped with it. The whole
/// check-then-commit sequence of [`charge`](Self::charge) runs under a
/// single mutex acquisition, so concurrent senders targeting the same peer
/// observe a linear history of charges and the running totals never
/// disagree with the entries. Quotas of different peers share nothing.
pub struct PeerQuota {
    max_messages_per_sender: u32,
    max_inflight_handles: u64,
    table: Mutex<QuotaTable>,
}

impl PeerQuota {
    /// Create an empty quota for one receiving peer.
    pub fn new(config: &AccountingConfig) -> Self {
        Self {
            max_messages_per_sender: config.max_messages_per_sender,
            max_inflight_handles: config.max_inflight_handles,
            table: Mutex::new(QuotaTable::default()),
        }
    }

    /// Reserve `size` bytes and one message slot for `user`, plus
    /// `n_handles` against the identity's domain-wide handle budget.
    ///
    /// `pool_size` is the receiving peer's fixed pool capacity. The charge
    /// is all-or-nothing: on rejection no byte, message or handle
    /// accounting changes.
    pub fn charge(
        &self,
        user: &User,
        pool_size: u64,
        size: u64,
        n_handles: u64,
    ) -> Result<(), QuotaError> {
        let uid = user.uid();
        let slot = user.slot().index();

        let mut table = self.table.lock();
        let entry = *table.entry_mut(slot);

        // The sender counts as active once this charge lands.
        let n_active = table.n_active + usize::from(!entry.is_active());
        let cap = pool_size / n_active.max(1) as u64;

        if entry.allocated_size.saturating_add(size) > cap
            || table.total_allocated_size.saturating_add(size) > pool_size
        {
            counter!("accounting.charges_rejected", "reason" => "pool").increment(1);
            debug!(%uid, size, cap, total = table.total_allocated_size, "charge exceeds pool quota");
            return Err(QuotaError::PoolExceeded {
                uid,
                requested: size,
                allocated: entry.allocated_size,
                cap,
            });
        }
        if entry.n_messages >= self.max_messages_per_sender {
            counter!("accounting.charges_rejected", "reason" => "messages").increment(1);
            debug!(%uid, limit = self.max_messages_per_sender, "charge exceeds message ceiling");
            return Err(QuotaError::TooManyMessages {
                uid,
                limit: self.max_messages_per_sender,
            });
        }
        // Last check: past this point nothing can fail, so the handle
        // reservation is never rolled back.
        if !user.try_charge_handles(n_handles, self.max_inflight_handles) {
            counter!("accounting.charges_rejected", "reason" => "handles").increment(1);
            debug!(%uid, n_handles, limit = self.max_inflight_handles, "charge exceeds handle budget");
            return Err(QuotaError::HandleLimitExceeded {
                uid,
                limit: self.max_inflight_handles,
            });
        }

        let activating = !entry.is_active();
        {
            let row = table.entry_mut(slot);
            row.allocated_size += size;
            row.n_messages += 1;
        }
        table.n_active += usize::from(activating);
        table.total_allocated_size += size;
        table.total_messages += 1;

        counter!("accounting.messages_charged").increment(1);
        trace!(%uid, slot, size, n_handles, "charged");
        Ok(())
    }

    /// Return `size` bytes and one message slot previously charged for
    /// `user`, plus `n_handles` to the identity's domain-wide budget.
    ///
    /// Every admitted charge must be discharged exactly once, before the
    /// owning peer is torn down. Discharging more than was charged is a
    /// caller bug: debug builds assert, release builds clamp and log.
    pub fn discharge(&self, user: &User, size: u64, n_handles: u64) {
        let uid = user.uid();
        let slot = user.slot().index();

        let mut table = self.table.lock();
        let Some(entry) = table.entries.get(slot).copied() else {
            debug_assert!(false, "discharge for {uid} without a charged entry");
            error!(%uid, slot, "discharge for unknown sender entry");
            return;
        };
        debug_assert!(entry.is_active(), "discharge for {uid} without outstanding message");
        debug_assert!(
            entry.allocated_size >= size,
            "discharge of {size} bytes for {uid} exceeds accounted {}",
            entry.allocated_size
        );

        let size = size.min(entry.allocated_size);
        if !entry.is_active() {
            error!(%uid, slot, "discharge without outstanding message; clamping");
        }

        let mut deactivated = false;
        {
            let row = table.entry_mut(slot);
            row.allocated_size -= size;
            if row.n_messages > 0 {
                row.n_messages -= 1;
                deactivated = row.n_messages == 0;
            }
        }
        table.n_active -= usize::from(deactivated);
        table.total_allocated_size -= size;
        table.total_messages -= u64::from(entry.is_active());

        user.discharge_handles(n_handles);

        counter!("accounting.messages_discharged").increment(1);
        trace!(%uid, slot, size, n_handles, "discharged");
    }

    /// Aggregate totals, read from the running sums in O(1).
    pub fn snapshot(&self) -> QuotaSnapshot {
        let table = self.table.lock();
        QuotaSnapshot {
            total_allocated_size: table.total_allocated_size,
            total_messages: table.total_messages,
            n_entries: table.entries.len(),
            n_active: table.n_active,
        }
    }

    /// Accounted usage for one sender slot, if that slot ever charged here.
    pub fn entry(&self, slot: UserSlot) -> Option<QuotaEntry> {
        self.table.lock().entries.get(slot.index()).copied()
    }
}

impl Drop for PeerQuota {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        debug_assert!(
            table.total_messages == 0 && table.total_allocated_size == 0,
            "peer quota dropped with outstanding charges"
        );
        if table.total_messages != 0 || table.total_allocated_size != 0 {
            error!(
                messages = table.total_messages,
                bytes = table.total_allocated_size,
                "peer quota dropped with outstanding charges"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::UserRegistry;
    use assert_matches::assert_matches;
    use axon_primitives::Uid;

    const POOL: u64 = 1000;

    fn test_registry() -> UserRegistry {
        UserRegistry::new(&AccountingConfig::default())
    }

    fn test_quota() -> PeerQuota {
        PeerQuota::new(&AccountingConfig::default())
    }

    #[test]
    fn test_entry_created_lazily() {
        let registry = test_registry();
        let user = registry.acquire_by_identity(Uid::new(1000)).expect("acquire");
        let quota = test_quota();

        assert_eq!(quota.entry(user.slot()), None);

        quota.charge(&user, POOL, 100, 0).expect("charge");
        assert_eq!(
            quota.entry(user.slot()),
            Some(QuotaEntry {
                allocated_size: 100,
                n_messages: 1,
            })
        );

        quota.discharge(&user, 100, 0);
        registry.release(user);
    }

    #[test]
    fn test_charge_discharge_symmetry() {
        let registry = test_registry();
        let user = registry.acquire_by_identity(Uid::new(1000)).expect("acquire");
        let quota = test_quota();

        quota.charge(&user, POOL, 100, 1).expect("charge");
        quota.charge(&user, POOL, 200, 0).expect("charge");
        quota.charge(&user, POOL, 50, 2).expect("charge");

        let snapshot = quota.snapshot();
        assert_eq!(snapshot.total_allocated_size, 350);
        assert_eq!(snapshot.total_messages, 3);
        assert_eq!(snapshot.n_active, 1);
        assert_eq!(user.inflight_handles(), 3);

        quota.discharge(&user, 50, 2);
        quota.discharge(&user, 200, 0);
        quota.discharge(&user, 100, 1);

        let snapshot = quota.snapshot();
        assert_eq!(snapshot.total_allocated_size, 0);
        assert_eq!(snapshot.total_messages, 0);
        assert_eq!(snapshot.n_active, 0);
        assert_eq!(
            quota.entry(user.slot()),
            Some(QuotaEntry::default()),
            "row survives at zero"
        );
        assert_eq!(user.inflight_handles(), 0);

        registry.release(user);
    }

    #[test]
    fn test_fair_share_worked_example() {
        // Pool of 1000. A charges 600 (k = 1, cap = 1000): admitted. B
        // charges 500: B's own share passes (k = 2, cap = 500) but the
        // total would reach 1100, so the global backstop rejects. B
        // charges 300: admitted, total 900. A discharges its 600; B then
        // charges 400 more at k = 1 and ends holding 700.
        let registry = test_registry();
        let a = registry.acquire_by_identity(Uid::new(1000)).expect("acquire");
        let b = registry.acquire_by_identity(Uid::new(1001)).expect("acquire");
        let quota = test_quota();

        quota.charge(&a, POOL, 600, 0).expect("A within cap");

        assert_matches!(
            quota.charge(&b, POOL, 500, 0),
            Err(QuotaError::PoolExceeded { requested: 500, cap: 500, .. })
        );
        assert_eq!(quota.snapshot().total_allocated_size, 600);

        quota.charge(&b, POOL, 300, 0).expect("B within cap and pool");
        assert_eq!(quota.snapshot().total_allocated_size, 900);

        quota.discharge(&a, 600, 0);
        assert_eq!(quota.snapshot().total_allocated_size, 300);
        assert_eq!(quota.snapshot().n_active, 1);

        quota.charge(&b, POOL, 400, 0).expect("B alone again");
        assert_eq!(
            quota.entry(b.slot()),
            Some(QuotaEntry {
                allocated_size: 700,
                n_messages: 2,
            })
        );

        quota.discharge(&b, 400, 0);
        quota.discharge(&b, 300, 0);
        registry.release(a);
        registry.release(b);
    }

    #[test]
    fn test_fair_share_cap_shrinks_with_active_senders() {
        let registry = test_registry();
        let a = registry.acquire_by_identity(Uid::new(1000)).expect("acquire");
        let b = registry.acquire_by_identity(Uid::new(1001)).expect("acquire");
        let quota = test_quota();

        quota.charge(&a, POOL, 400, 0).expect("charge");
        quota.charge(&b, POOL, 100, 0).expect("charge");

        // Two active senders: B may hold at most 500 in total.
        assert_matches!(
            quota.charge(&b, POOL, 450, 0),
            Err(QuotaError::PoolExceeded { allocated: 100, cap: 500, .. })
        );
        quota.charge(&b, POOL, 400, 0).expect("exactly at cap");

        quota.discharge(&a, 400, 0);
        quota.discharge(&b, 400, 0);
        quota.discharge(&b, 100, 0);
        registry.release(a);
        registry.release(b);
    }

    #[test]
    fn test_rejection_mutates_nothing() {
        let registry = test_registry();
        let a = registry.acquire_by_identity(Uid::new(1000)).expect("acquire");
        let b = registry.acquire_by_identity(Uid::new(1001)).expect("acquire");
        let quota = test_quota();

        quota.charge(&a, POOL, 600, 0).expect("charge");
        let before = quota.snapshot();

        assert_matches!(quota.charge(&b, POOL, 500, 3), Err(QuotaError::PoolExceeded { .. }));

        let after = quota.snapshot();
        assert_eq!(after.total_allocated_size, before.total_allocated_size);
        assert_eq!(after.total_messages, before.total_messages);
        assert_eq!(after.n_active, before.n_active);
        // The rejected sender's row was created but holds nothing.
        assert_eq!(quota.entry(b.slot()), Some(QuotaEntry::default()));
        assert_eq!(b.inflight_handles(), 0, "rejected charge reserves no handles");

        quota.discharge(&a, 600, 0);
        registry.release(a);
        registry.release(b);
    }

    #[test]
    fn test_message_ceiling_bounds_zero_size_floods() {
        let config = AccountingConfig {
            max_messages_per_sender: 2,
            ..AccountingConfig::default()
        };
        let registry = UserRegistry::new(&config);
        let user = registry.acquire_by_identity(Uid::new(1000)).expect("acquire");
        let quota = PeerQuota::new(&config);

        quota.charge(&user, POOL, 0, 0).expect("charge");
        quota.charge(&user, POOL, 0, 0).expect("charge");
        assert_matches!(
            quota.charge(&user, POOL, 0, 0),
            Err(QuotaError::TooManyMessages { limit: 2, .. })
        );
        assert_eq!(quota.snapshot().total_messages, 2);

        quota.discharge(&user, 0, 0);
        quota.discharge(&user, 0, 0);
        registry.release(user);
    }

    #[test]
    fn test_handle_budget_failure_commits_nothing() {
        let config = AccountingConfig {
            max_inflight_handles: 4,
            ..AccountingConfig::default()
        };
        let registry = UserRegistry::new(&config);
        let user = registry.acquire_by_identity(Uid::new(1000)).expect("acquire");
        let quota = PeerQuota::new(&config);

        quota.charge(&user, POOL, 100, 3).expect("charge");

        assert_matches!(
            quota.charge(&user, POOL, 100, 2),
            Err(QuotaError::HandleLimitExceeded { limit: 4, .. })
        );

        // Neither bytes, message count nor handles moved.
        let snapshot = quota.snapshot();
        assert_eq!(snapshot.total_allocated_size, 100);
        assert_eq!(snapshot.total_messages, 1);
        assert_eq!(user.inflight_handles(), 3);

        quota.discharge(&user, 100, 3);
        registry.release(user);
    }

    #[test]
    fn test_handle_budget_shared_across_quotas() {
        // The handle budget is domain-wide per identity, not per pool.
        let config = AccountingConfig {
            max_inflight_handles: 4,
            ..AccountingConfig::default()
        };
        let registry = UserRegistry::new(&config);
        let user = registry.acquire_by_identity(Uid::new(1000)).expect("acquire");
        let receiver_a = PeerQuota::new(&config);
        let receiver_b = PeerQuota::new(&config);

        receiver_a.charge(&user, POOL, 10, 3).expect("charge");
        assert_matches!(
            receiver_b.charge(&user, POOL, 10, 2),
            Err(QuotaError::HandleLimitExceeded { .. })
        );
        receiver_b.charge(&user, POOL, 10, 1).expect("charge");
        assert_eq!(user.inflight_handles(), 4);

        receiver_a.discharge(&user, 10, 3);
        receiver_b.discharge(&user, 10, 1);
        registry.release(user);
    }

    #[test]
    fn test_table_growth_preserves_existing_rows() {
        let registry = test_registry();
        let first = registry.acquire_by_identity(Uid::new(1000)).expect("acquire");
        let quota = test_quota();

        quota.charge(&first, POOL, 100, 0).expect("charge");

        // Push the table well past the first row.
        let late: Vec<_> = (0..32)
            .map(|n| registry.acquire_by_identity(Uid::new(2000 + n)).expect("acquire"))
            .collect();
        let tail = late.last().expect("acquired");
        quota.charge(tail, POOL, 1, 0).expect("charge");

        assert_eq!(quota.snapshot().n_entries, tail.slot().index() + 1);
        assert_eq!(
            quota.entry(first.slot()),
            Some(QuotaEntry {
                allocated_size: 100,
                n_messages: 1,
            })
        );

        quota.discharge(tail, 1, 0);
        quota.discharge(&first, 100, 0);
        for user in late {
            registry.release(user);
        }
        registry.release(first);
    }

    #[test]
    fn test_concurrent_charges_never_overrun_pool() {
        let registry = test_registry();
        let quota = test_quota();
        const CHARGE: u64 = 97;

        let users: Vec<_> = (0..8)
            .map(|n| registry.acquire_by_identity(Uid::new(1000 + n)).expect("acquire"))
            .collect();

        let charged: Vec<usize> = std::thread::scope(|scope| {
            users
                .iter()
                .map(|user| {
                    let quota = &quota;
                    scope.spawn(move || {
                        let mut admitted = 0;
                        while quota.charge(user, POOL, CHARGE, 0).is_ok() {
                            admitted += 1;
                            assert!(quota.snapshot().total_allocated_size <= POOL);
                        }
                        admitted
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().expect("thread"))
                .collect()
        });

        let total: u64 = charged.iter().map(|&n| n as u64 * CHARGE).sum();
        assert_eq!(quota.snapshot().total_allocated_size, total);
        assert!(total <= POOL);

        // Drain so the quota drops clean.
        for (user, admitted) in users.iter().zip(&charged) {
            for _ in 0..*admitted {
                quota.discharge(user, CHARGE, 0);
            }
        }
        let drained = quota.snapshot();
        assert_eq!(drained.total_allocated_size, 0);
        assert_eq!(drained.total_messages, 0);
        assert_eq!(drained.n_active, 0);

        for user in users {
            registry.release(user);
        }
    }
}
