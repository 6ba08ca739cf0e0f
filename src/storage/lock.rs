//! Lock acquisition with bounded retry.
//!
//! The index uses two lock files: `write.lock`, held by the single writer for
//! its whole lifetime, and `commit.lock`, held briefly while a segments file
//! is written or read.

use std::time::{Duration, Instant};

use crate::error::{LucernaError, Result};
use crate::storage::{Storage, StorageLock};

/// Name of the lock held by the index writer.
pub const WRITE_LOCK_NAME: &str = "write";

/// Name of the lock held while a segments file is written or read.
pub const COMMIT_LOCK_NAME: &str = "commit";

/// How long the write lock is waited for unless configured otherwise.
pub const DEFAULT_WRITE_LOCK_TIMEOUT: Duration = Duration::from_millis(1_000);

/// How long the commit lock is waited for unless configured otherwise.
pub const DEFAULT_COMMIT_LOCK_TIMEOUT: Duration = Duration::from_millis(10_000);

pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An obtained lock, released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock: Box<dyn StorageLock>,
    released: bool,
}

impl LockGuard {
    /// Obtain `name`, retrying every `poll_interval` until `timeout` elapses.
    pub fn obtain(
        storage: &dyn Storage,
        name: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<LockGuard> {
        let mut lock = storage.make_lock(name)?;
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if lock.try_obtain()? {
                if attempts > 1 {
                    log::debug!("obtained lock {name} after {attempts} attempts");
                }
                return Ok(LockGuard {
                    lock,
                    released: false,
                });
            }

            if started.elapsed() >= timeout {
                return Err(LucernaError::lock(format!(
                    "{name}.lock held by another process ({attempts} attempts in {timeout:?})"
                )));
            }

            log::trace!("lock {name} busy, retrying in {poll_interval:?}");
            std::thread::sleep(poll_interval);
        }
    }

    /// Name of the held lock.
    pub fn name(&self) -> &str {
        self.lock.name()
    }

    /// Release the lock now instead of on drop.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release() {
                log::warn!("failed to release lock {}: {e}", self.lock.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_second_obtain_times_out() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let guard = LockGuard::obtain(
            &storage,
            WRITE_LOCK_NAME,
            Duration::from_millis(0),
            Duration::from_millis(1),
        )
        .unwrap();

        let err = LockGuard::obtain(
            &storage,
            WRITE_LOCK_NAME,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .unwrap_err();
        assert!(err.is_lock_error());

        drop(guard);
        let again = LockGuard::obtain(
            &storage,
            WRITE_LOCK_NAME,
            Duration::from_millis(0),
            Duration::from_millis(1),
        );
        assert!(again.is_ok());
    }

    #[test]
    fn test_explicit_release() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let guard = LockGuard::obtain(
            &storage,
            COMMIT_LOCK_NAME,
            Duration::from_millis(0),
            Duration::from_millis(1),
        )
        .unwrap();
        assert_eq!(guard.name(), COMMIT_LOCK_NAME);
        assert!(storage.make_lock(COMMIT_LOCK_NAME).unwrap().is_locked());

        guard.release().unwrap();
        assert!(!storage.make_lock(COMMIT_LOCK_NAME).unwrap().is_locked());
    }
}
