//! Per-sync locking for ferry.
//!
//! All mutations for a given `(sync-type, pr-id)` pair must be serialized:
//! try-push creation allocates a sequence id and every guarded setter
//! rewrites the persisted record. [`SyncLocks`] hands out a [`SyncLease`]
//! per key; the lease is both the critical-section guard and the
//! mutability token that guarded operations demand, so holding the wrong
//! lease is a value error rather than silent corruption.
//!
//! Handlers for distinct syncs run in parallel; only same-key operations
//! contend.

use std::collections::HashMap;
use std::sync::Arc;

use ferry_types::{FerryError, SyncKey};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// Registry of per-sync mutexes.
#[derive(Debug, Default)]
pub struct SyncLocks {
    inner: Mutex<HashMap<SyncKey, Arc<Mutex<()>>>>,
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &SyncKey) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock();
        map.entry(key.clone()).or_default().clone()
    }

    /// Acquire the lease for `key`, blocking until it is free.
    pub fn lock(&self, key: SyncKey) -> SyncLease {
        let guard = Mutex::lock_arc(&self.entry(&key));
        SyncLease { key, _guard: guard }
    }

    /// Acquire the lease for `key` without blocking.
    pub fn try_lock(&self, key: SyncKey) -> Option<SyncLease> {
        let guard = Mutex::try_lock_arc(&self.entry(&key))?;
        Some(SyncLease { key, _guard: guard })
    }
}

/// Exclusive lease on one sync's mutation domain.
///
/// Released on drop. Guarded operations call [`SyncLease::check`] with the
/// key they are about to mutate.
pub struct SyncLease {
    key: SyncKey,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl std::fmt::Debug for SyncLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLease").field("key", &self.key).finish()
    }
}

impl SyncLease {
    pub fn key(&self) -> &SyncKey {
        &self.key
    }

    /// Fail when this lease does not cover `key`.
    pub fn check(&self, key: &SyncKey) -> Result<(), FerryError> {
        if &self.key == key {
            Ok(())
        } else {
            Err(FerryError::Value(format!(
                "lease for {} used to mutate {}",
                self.key, key
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sync_type: &str, pr_id: u64) -> SyncKey {
        SyncKey {
            sync_type: sync_type.to_string(),
            pr_id,
        }
    }

    #[test]
    fn same_key_is_exclusive() {
        let locks = SyncLocks::new();
        let lease = locks.lock(key("downstream", 1));
        assert!(locks.try_lock(key("downstream", 1)).is_none());
        drop(lease);
        assert!(locks.try_lock(key("downstream", 1)).is_some());
    }

    #[test]
    fn distinct_keys_are_independent() {
        let locks = SyncLocks::new();
        let _a = locks.lock(key("downstream", 1));
        let _b = locks.lock(key("downstream", 2));
        let _c = locks.lock(key("landing", 1));
    }

    #[test]
    fn lease_checks_key() {
        let locks = SyncLocks::new();
        let lease = locks.lock(key("downstream", 1));
        assert!(lease.check(&key("downstream", 1)).is_ok());

        let err = lease.check(&key("downstream", 2)).unwrap_err();
        assert!(matches!(err, FerryError::Value(_)));
    }

    #[test]
    fn lease_is_usable_across_threads() {
        let locks = Arc::new(SyncLocks::new());
        let lease = locks.lock(key("downstream", 7));

        let locks2 = Arc::clone(&locks);
        let handle = std::thread::spawn(move || locks2.try_lock(key("downstream", 7)).is_none());
        assert!(handle.join().expect("join"));
        drop(lease);
    }
}
