//! Path-keyed mutual exclusion with bounded waits.
//!
//! Each key gets its own async mutex on first use. The table entry is dropped
//! again once the last holder or waiter releases it, so the table only holds
//! keys that are currently contended.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Result, StoreError};

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Table of per-path locks shared by every operation on one backing.
#[derive(Clone)]
pub struct PathLocks {
    table: LockTable,
    timeout: Duration,
}

/// Held lock on one key. Releases on drop.
pub struct PathLockGuard {
    key: String,
    table: LockTable,
    entry: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PathLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Acquire the lock for `key`, failing with `LockTimeout` after the configured wait.
    pub async fn acquire(&self, key: &str) -> Result<PathLockGuard> {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let acquired = tokio::time::timeout(self.timeout, entry.clone().lock_owned()).await;
        let mut guard = PathLockGuard {
            key: key.to_string(),
            table: self.table.clone(),
            entry,
            guard: None,
        };
        match acquired {
            Ok(inner) => {
                guard.guard = Some(inner);
                Ok(guard)
            }
            Err(_) => {
                debug!("Lock wait on {} timed out after {:?}", key, self.timeout);
                // Dropping `guard` here cleans up the table entry.
                Err(StoreError::LockTimeout(key.to_string()))
            }
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // One reference is ours, one is the table's.
        if Arc::strong_count(&self.entry) == 2 {
            table.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = PathLocks::new(Duration::from_millis(50));
        let held = locks.acquire("a").await.unwrap();

        let err = locks.acquire("a").await.err().unwrap();
        assert!(matches!(err, StoreError::LockTimeout(_)));
        assert!(err.is_retryable());

        drop(held);
        assert!(locks.acquire("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = PathLocks::new(Duration::from_millis(50));
        let _a = locks.acquire("a").await.unwrap();
        assert!(locks.acquire("b").await.is_ok());
    }

    #[tokio::test]
    async fn test_table_empties_after_release() {
        let locks = PathLocks::new(Duration::from_secs(1));
        {
            let _a = locks.acquire("a").await.unwrap();
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = PathLocks::new(Duration::from_secs(5));
        let held = locks.acquire("k").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("k").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
        assert!(locks.is_empty());
    }
}
