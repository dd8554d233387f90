//! Apply lock guard

use crate::migration::{HistoryStore, MigrationError};
use std::time::{Duration, Instant};

/// Interval between lock attempts while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Holds the store's apply lock and releases it when dropped
///
/// The guard is created before the pending set is computed, so two processes can
/// never apply the same script. Release happens on every exit path, including errors.
pub struct MigrationLockGuard<'a> {
    store: &'a dyn HistoryStore,
    owner: String,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the apply lock, polling every 100ms until `timeout` elapses
    ///
    /// A zero timeout makes a single attempt.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::ConcurrentApplyInProgress` if the lock is still held by
    /// someone else when the timeout expires, or the store's error if the lock state
    /// cannot be queried.
    pub fn acquire(store: &'a dyn HistoryStore, timeout: Duration) -> Result<Self, MigrationError> {
        let owner = format!("schemagate-{}", uuid::Uuid::new_v4());
        let start = Instant::now();

        loop {
            if store.try_lock(&owner)? {
                log::debug!("acquired migration lock as {owner}");
                return Ok(Self { store, owner });
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(MigrationError::ConcurrentApplyInProgress(if timeout.is_zero() {
                    "the migration lock is held by another process".to_string()
                } else {
                    format!(
                        "the migration lock is still held after waiting {}s",
                        timeout.as_secs()
                    )
                }));
            }

            log::debug!("migration lock is busy; waiting ({:?} elapsed)", elapsed);
            std::thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
        }
    }

    /// Identifier this guard locked with
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        match self.store.unlock(&self.owner) {
            Ok(()) => log::debug!("released migration lock held by {}", self.owner),
            Err(e) => log::warn!("failed to release migration lock held by {}: {e}", self.owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MemoryHistoryStore;
    use std::sync::Arc;

    #[test]
    fn test_guard_releases_on_drop() {
        let store = MemoryHistoryStore::new();
        {
            let guard = MigrationLockGuard::acquire(&store, Duration::ZERO).expect("lock");
            assert_eq!(store.lock_owner().as_deref(), Some(guard.owner()));
        }
        assert!(store.lock_owner().is_none());
    }

    #[test]
    fn test_zero_timeout_fails_fast() {
        let store = MemoryHistoryStore::new();
        assert!(store.try_lock("someone-else").expect("lock"));

        let start = Instant::now();
        let err = MigrationLockGuard::acquire(&store, Duration::ZERO)
            .err()
            .expect("contention");
        assert!(matches!(err, MigrationError::ConcurrentApplyInProgress(_)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_waits_for_release() {
        let store = Arc::new(MemoryHistoryStore::new());
        assert!(store.try_lock("holder").expect("lock"));

        let releaser = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(250));
                store.unlock("holder").expect("unlock");
            })
        };

        let guard = MigrationLockGuard::acquire(store.as_ref(), Duration::from_secs(5));
        assert!(guard.is_ok());
        drop(guard);
        releaser.join().expect("join");
    }
}
