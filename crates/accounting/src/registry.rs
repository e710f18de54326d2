//! Domain-wide user registry.
//!
//! Deduplicates caller identities into reference-counted [`User`] objects:
//! however many peer connections an identity owns, its domain-wide resource
//! usage is accounted on one object.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use axon_primitives::Uid;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::AccountingConfig;
use crate::user::{SlotAllocator, User};

/// Errors from user registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The domain cannot admit another distinct identity.
    #[error("identity table exhausted ({limit} identities)")]
    IdentityAllocationFailed {
        /// Configured bound on distinct live identities.
        limit: u32,
    },
}

/// Domain-wide map from caller identity to its accounting object.
///
/// Exactly one live [`User`] exists per distinct identity. The registry is
/// an explicitly owned singleton: the domain creates one and passes it to
/// every connection-establishment path that needs it.
///
/// Acquires and releases for a single identity behave as if serialized.
/// Lookups for different identities contend only on the read side of the
/// map lock; the write lock is taken on creation and teardown.
pub struct UserRegistry {
    users: RwLock<HashMap<Uid, Arc<User>>>,
    slots: Arc<SlotAllocator>,
    max_users: u32,
}

impl UserRegistry {
    /// Create an empty registry for one domain.
    pub fn new(config: &AccountingConfig) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            slots: Arc::new(SlotAllocator::new(config.max_users)),
            max_users: config.max_users,
        }
    }

    /// Look up or create the accounting object for `uid`.
    ///
    /// Returns the existing object with one more acquire on it, or a fresh
    /// object with an acquire count of one. Concurrent calls for the same
    /// identity never produce two live objects; a racing full release is
    /// not resurrected but replaced.
    pub fn acquire_by_identity(&self, uid: Uid) -> Result<Arc<User>, RegistryError> {
        // Fast path: read lock
        if let Some(user) = self.users.read().get(&uid) {
            if user.try_acquire() {
                return Ok(Arc::clone(user));
            }
        }

        // Slow path: write lock
        let mut users = self.users.write();
        match users.entry(uid) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().try_acquire() {
                    return Ok(Arc::clone(occupied.get()));
                }
                // The old object drained concurrently. Replace it; its slot
                // stays allocated until the object is reclaimed.
                let user = self.create_user(uid)?;
                occupied.insert(Arc::clone(&user));
                Ok(user)
            }
            Entry::Vacant(vacant) => {
                let user = self.create_user(uid)?;
                vacant.insert(Arc::clone(&user));
                Ok(user)
            }
        }
    }

    /// Add an acquire to an already-held object.
    ///
    /// Used when duplicating ownership, e.g. cloning a peer connection.
    /// Panics if `user` was already fully released.
    pub fn acquire(user: &Arc<User>) -> Arc<User> {
        user.acquire_held();
        Arc::clone(user)
    }

    /// Drop one acquire of `user`, consuming the caller's handle.
    ///
    /// When the last acquire is dropped the object is unlinked from the
    /// registry. Storage is reclaimed once every concurrent holder has
    /// dropped its reference; only then is the slot recycled.
    pub fn release(&self, user: Arc<User>) {
        if user.release_ref() {
            let mut users = self.users.write();
            if let Entry::Occupied(occupied) = users.entry(user.uid()) {
                // A racing acquire may already have replaced the entry.
                if Arc::ptr_eq(occupied.get(), &user) {
                    occupied.remove();
                    debug!(uid = %user.uid(), slot = user.slot().index(), "user unlinked");
                }
            }
        }
    }

    /// Number of live identities.
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// True if no identity is live.
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// True if `uid` currently has a live accounting object.
    pub fn contains(&self, uid: Uid) -> bool {
        self.users.read().contains_key(&uid)
    }

    fn create_user(&self, uid: Uid) -> Result<Arc<User>, RegistryError> {
        let slot = self
            .slots
            .alloc()
            .ok_or(RegistryError::IdentityAllocationFailed { limit: self.max_users })?;
        let user = Arc::new(User::new(uid, slot, Arc::clone(&self.slots)));
        debug!(%uid, slot = slot.index(), "user created");
        Ok(user)
    }
}
