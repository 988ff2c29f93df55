//! Retry helpers over the optimistic-concurrency primitive.

use tracing::debug;

use super::{ObjectStore, StorableObject};
use crate::config::{RetryPolicy, calculate_backoff};
use crate::error::{Result, StoreError};

/// Read-modify-write `key`, re-reading and reapplying `patch` on `OutOfDate`.
///
/// Gives up with `RetriesExhausted` after `policy.max_attempts` attempts.
/// Any other failure is returned as is.
pub async fn update_object<T, S, P>(
    store: &S,
    key: &str,
    policy: &RetryPolicy,
    mut patch: P,
) -> Result<T>
where
    T: Clone + Send + Sync + 'static,
    S: ObjectStore<T> + ?Sized,
    P: FnMut(&T) -> T + Send,
{
    for attempt in 1..=policy.max_attempts {
        let current = store.get_mutable(key).await?;
        let value = patch(&current.value);
        let next = StorableObject {
            value: value.clone(),
            update_count: current.update_count,
        };
        match store.update(key, next).await {
            Ok(()) => return Ok(value),
            Err(StoreError::OutOfDate(_)) => {
                let delay = calculate_backoff(attempt, policy);
                debug!(
                    "Update of {} out of date (attempt {}), retrying in {:?}",
                    key, attempt, delay
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::RetriesExhausted {
        key: key.to_string(),
        attempts: policy.max_attempts,
    })
}

/// Make `key` hold `value`, whether or not it exists yet.
///
/// Tries `create`; on `Conflict` falls back to [`update_object`]; if the key
/// vanished in between (`NotFound`) tries `create` again. A tombstoned key
/// fails with `Deleted`.
pub async fn force_set_object_value<T, S>(
    store: &S,
    key: &str,
    value: T,
    policy: &RetryPolicy,
) -> Result<()>
where
    T: Clone + Send + Sync + 'static,
    S: ObjectStore<T> + ?Sized,
{
    for attempt in 1..=policy.max_attempts {
        match store.create(key, value.clone()).await {
            Ok(_) => return Ok(()),
            Err(StoreError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
        match update_object(store, key, policy, |_| value.clone()).await {
            Ok(_) => return Ok(()),
            Err(StoreError::NotFound(_)) => {
                debug!("{} vanished during force-set (attempt {}), recreating", key, attempt);
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::RetriesExhausted {
        key: key.to_string(),
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{InMemoryObjectStore, KeyRange, Paginated};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Wraps a store, counting successful writes and optionally failing updates.
    struct CountingStore {
        inner: InMemoryObjectStore<String>,
        creates: AtomicU32,
        updates: AtomicU32,
        stale_updates: AtomicU32,
    }

    impl CountingStore {
        fn new(stale_updates: u32) -> Self {
            Self {
                inner: InMemoryObjectStore::new(),
                creates: AtomicU32::new(0),
                updates: AtomicU32::new(0),
                stale_updates: AtomicU32::new(stale_updates),
            }
        }
    }

    #[async_trait]
    impl ObjectStore<String> for CountingStore {
        async fn create(&self, key: &str, value: String) -> Result<String> {
            let created = self.inner.create(key, value).await?;
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(created)
        }

        async fn get(&self, key: &str) -> Result<String> {
            self.inner.get(key).await
        }

        async fn get_mutable(&self, key: &str) -> Result<StorableObject<String>> {
            self.inner.get_mutable(key).await
        }

        async fn update(&self, key: &str, object: StorableObject<String>) -> Result<()> {
            if self
                .stale_updates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::OutOfDate(key.to_string()));
            }
            self.inner.update(key, object).await?;
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn get_keys_in_range(
            &self,
            range: &KeyRange,
            page_token: Option<&str>,
        ) -> Result<Paginated<String>> {
            self.inner.get_keys_in_range(range, page_token).await
        }

        async fn get_deleted_keys_in_range(
            &self,
            range: &KeyRange,
            page_token: Option<&str>,
        ) -> Result<Paginated<String>> {
            self.inner.get_deleted_keys_in_range(range, page_token).await
        }

        async fn sweep_range(&self, range: &KeyRange) -> Result<Vec<String>> {
            self.inner.sweep_range(range).await
        }
    }

    #[tokio::test]
    async fn test_force_set_creates_then_updates() {
        let store = CountingStore::new(0);
        let policy = RetryPolicy::immediate(10);

        force_set_object_value(&store, "k", "first".to_string(), &policy)
            .await
            .unwrap();
        force_set_object_value(&store, "k", "second".to_string(), &policy)
            .await
            .unwrap();

        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.updates.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("k").await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_update_object_retries_out_of_date() {
        let store = CountingStore::new(3);
        store.create("k", "a".to_string()).await.unwrap();

        let mut calls = 0;
        let value = update_object(&store, "k", &RetryPolicy::immediate(10), |v| {
            calls += 1;
            format!("{}b", v)
        })
        .await
        .unwrap();

        assert_eq!(value, "ab");
        assert_eq!(calls, 4);
        assert_eq!(store.get_mutable("k").await.unwrap().update_count, 1);
    }

    #[tokio::test]
    async fn test_update_object_gives_up_after_bound() {
        let store = CountingStore::new(u32::MAX);
        store.create("k", "a".to_string()).await.unwrap();

        let err = update_object(&store, "k", &RetryPolicy::immediate(10), |v| v.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StoreError::RetriesExhausted { attempts: 10, .. }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_update_object_surfaces_not_found() {
        let store = CountingStore::new(0);
        let err = update_object(&store, "missing", &RetryPolicy::immediate(3), |v| v.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_force_set_on_tombstone_reports_deleted() {
        let store = CountingStore::new(0);
        store.create("k", "a".to_string()).await.unwrap();
        store.delete("k").await.unwrap();

        let err = force_set_object_value(&store, "k", "b".to_string(), &RetryPolicy::immediate(3))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Deleted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let store = CountingStore::new(2);
        store.create("k", "a".to_string()).await.unwrap();

        let started = tokio::time::Instant::now();
        update_object(&store, "k", &RetryPolicy::default(), |v| v.clone())
            .await
            .unwrap();
        // 5ms + 10ms of backoff before the third attempt
        assert!(started.elapsed() >= std::time::Duration::from_millis(15));
    }
}
