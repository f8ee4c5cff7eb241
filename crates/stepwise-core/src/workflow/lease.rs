//! Per-instance leases.
//!
//! The engine assumes at most one advance or resolution runs per instance at
//! a time. `InstanceLocks` gives callers an in-process way to uphold that: one
//! `tokio::sync::Mutex` per instance id, created on first use.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Lease held while operating on one instance. Released on drop.
pub type InstanceLease = OwnedMutexGuard<()>;

/// Map of per-instance mutexes. Cloning shares the map.
#[derive(Debug, Clone, Default)]
pub struct InstanceLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(instance_id).or_default().clone()
    }

    /// Wait for the lease on `instance_id`.
    pub async fn acquire(&self, instance_id: Uuid) -> InstanceLease {
        self.slot(instance_id).lock_owned().await
    }

    /// Take the lease only if nobody holds it.
    pub fn try_acquire(&self, instance_id: Uuid) -> Option<InstanceLease> {
        self.slot(instance_id).try_lock_owned().ok()
    }

    /// Drop the mutex for `instance_id` if no lease is held or awaited.
    pub fn forget(&self, instance_id: Uuid) {
        self.locks
            .remove_if(&instance_id, |_, slot| Arc::strong_count(slot) == 1);
    }

    /// Number of tracked instances.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
