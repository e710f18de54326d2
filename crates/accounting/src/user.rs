//! Per-identity accounting state.
//!
//! One [`User`] exists per distinct caller identity in a domain, shared by
//! every peer connection that identity owns. Counters use atomic operations
//! so connections update them without locking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use axon_primitives::Uid;
use parking_lot::Mutex;
use tracing::error;

/// Dense per-identity index into every peer quota's sender table.
///
/// Assigned once when the owning [`User`] is created, recycled only after
/// that object is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserSlot(u32);

impl UserSlot {
    /// The slot as a table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-identity accounting state.
///
/// Tracks domain-wide usage attributable to one identity regardless of how
/// many peer connections it owns. Obtained from
/// [`UserRegistry`](crate::UserRegistry), never constructed directly.
#[derive(Debug)]
pub struct User {
    uid: Uid,
    slot: UserSlot,
    /// Outstanding un-released acquires. Zero means the object is draining:
    /// it can no longer be acquired and is unlinked from the registry.
    refs: AtomicUsize,
    /// In-flight transferable handles attributed to this identity,
    /// domain-wide.
    inflight_handles: AtomicU64,
    slots: Arc<SlotAllocator>,
}

impl User {
    pub(crate) fn new(uid: Uid, slot: UserSlot, slots: Arc<SlotAllocator>) -> Self {
        Self {
            uid,
            slot,
            refs: AtomicUsize::new(1),
            inflight_handles: AtomicU64::new(0),
            slots,
        }
    }

    /// The identity this object accounts for.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The dense sender-table slot assigned to this identity.
    pub fn slot(&self) -> UserSlot {
        self.slot
    }

    /// Number of outstanding un-released acquires.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    /// Current in-flight handle count.
    pub fn inflight_handles(&self) -> u64 {
        self.inflight_handles.load(Ordering::Relaxed)
    }

    /// Add an acquire unless the object is already draining at zero.
    pub(crate) fn try_acquire(&self) -> bool {
        self.refs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |refs| {
                (refs != 0).then(|| refs + 1)
            })
            .is_ok()
    }

    /// Add an acquire to an object the caller already holds.
    ///
    /// Panics if the object was fully released: acquiring through a stale
    /// reference is a caller bug the registry cannot recover from.
    pub(crate) fn acquire_held(&self) {
        let prev = self.refs.fetch_add(1, Ordering::Relaxed);
        assert!(prev != 0, "acquire on fully released user {}", self.uid);
    }

    /// Drop one acquire, returning true when the count reaches zero.
    pub(crate) fn release_ref(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::Relaxed);
        assert!(prev != 0, "user {} released more times than acquired", self.uid);
        prev == 1
    }

    /// Reserve `n` in-flight handles against the domain-wide budget `max`.
    ///
    /// Either all `n` are reserved or the counter is left untouched.
    pub(crate) fn try_charge_handles(&self, n: u64, max: u64) -> bool {
        if n == 0 {
            return true;
        }
        self.inflight_handles
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |held| {
                held.checked_add(n).filter(|&total| total <= max)
            })
            .is_ok()
    }

    /// Return `n` in-flight handles to the domain-wide budget.
    ///
    /// Discharging more than was charged is a caller bug: debug builds
    /// assert, release builds clamp to zero and log.
    pub(crate) fn discharge_handles(&self, n: u64) {
        if n == 0 {
            return;
        }
        let prev = self
            .inflight_handles
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |held| {
                Some(held.saturating_sub(n))
            })
            .unwrap_or_default();
        debug_assert!(prev >= n, "user {} discharged more handles than charged", self.uid);
        if prev < n {
            error!(uid = %self.uid, held = prev, released = n, "handle discharge exceeds charge; clamping");
        }
    }
}

impl Drop for User {
    fn drop(&mut self) {
        let held = self.inflight_handles.load(Ordering::Relaxed);
        debug_assert!(held == 0, "user {} reclaimed with {held} in-flight handles", self.uid);
        if held != 0 {
            error!(uid = %self.uid, held, "user reclaimed with in-flight handles outstanding");
        }
        self.slots.release(self.slot);
    }
}

/// Allocates the dense per-identity slot indices for one domain.
///
/// Released slots go to a free list and are handed out again before the
/// high-water mark grows, keeping quota tables dense.
#[derive(Debug)]
pub(crate) struct SlotAllocator {
    capacity: u32,
    pool: Mutex<SlotPool>,
}

#[derive(Debug, Default)]
struct SlotPool {
    next: u32,
    free: Vec<u32>,
}

impl SlotAllocator {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            capacity,
            pool: Mutex::new(SlotPool::default()),
        }
    }

    /// Hand out the lowest recycled slot, or grow the high-water mark.
    pub(crate) fn alloc(&self) -> Option<UserSlot> {
        let mut pool = self.pool.lock();
        if let Some(index) = pool.free.pop() {
            return Some(UserSlot(index));
        }
        if pool.next >= self.capacity {
            return None;
        }
        let index = pool.next;
        pool.next += 1;
        Some(UserSlot(index))
    }

    pub(crate) fn release(&self, slot: UserSlot) {
        self.pool.lock().free.push(slot.0);
    }
}
