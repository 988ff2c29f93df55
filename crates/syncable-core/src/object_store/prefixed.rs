use std::marker::PhantomData;

use async_trait::async_trait;

use super::{GetMultipleResult, KeyRange, ObjectStore, Paginated, StorableObject, prefix_successor};
use crate::error::{Result, StoreError};

/// View of a store restricted to keys under `prefix`, with the prefix stripped.
///
/// Several logical stores can share one physical store this way. Page tokens
/// come from the inner store and pass through unchanged.
pub struct PrefixedObjectStore<T, S> {
    inner: S,
    prefix: String,
    _value: PhantomData<fn() -> T>,
}

impl<T, S> PrefixedObjectStore<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: ObjectStore<T>,
{
    pub fn new(inner: S, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            _value: PhantomData,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn outer_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn strip(&self, key: String) -> Result<String> {
        key.strip_prefix(&self.prefix)
            .map(str::to_string)
            .ok_or_else(|| StoreError::format("prefixed store", format!("key {} outside prefix", key)))
    }

    /// Map errors that name an inner key back to the caller's key.
    fn rename_error(&self, key: &str, e: StoreError) -> StoreError {
        match e {
            StoreError::NotFound(_) => StoreError::NotFound(key.to_string()),
            StoreError::Conflict(_) => StoreError::Conflict(key.to_string()),
            StoreError::OutOfDate(_) => StoreError::OutOfDate(key.to_string()),
            StoreError::Deleted(_) => StoreError::Deleted(key.to_string()),
            other => other,
        }
    }

    fn inner_range(&self, range: &KeyRange) -> KeyRange {
        KeyRange {
            start: Some(self.outer_key(range.start.as_deref().unwrap_or(""))),
            end: match &range.end {
                Some(end) => Some(self.outer_key(end)),
                None => prefix_successor(&self.prefix),
            },
        }
    }

    fn strip_page(&self, page: Paginated<String>) -> Result<Paginated<String>> {
        Ok(Paginated {
            items: page
                .items
                .into_iter()
                .map(|k| self.strip(k))
                .collect::<Result<_>>()?,
            next_page_token: page.next_page_token,
        })
    }
}

#[async_trait]
impl<T, S> ObjectStore<T> for PrefixedObjectStore<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: ObjectStore<T>,
{
    async fn create(&self, key: &str, value: T) -> Result<T> {
        self.inner
            .create(&self.outer_key(key), value)
            .await
            .map_err(|e| self.rename_error(key, e))
    }

    async fn get(&self, key: &str) -> Result<T> {
        self.inner
            .get(&self.outer_key(key))
            .await
            .map_err(|e| self.rename_error(key, e))
    }

    async fn get_mutable(&self, key: &str) -> Result<StorableObject<T>> {
        self.inner
            .get_mutable(&self.outer_key(key))
            .await
            .map_err(|e| self.rename_error(key, e))
    }

    async fn update(&self, key: &str, object: StorableObject<T>) -> Result<()> {
        self.inner
            .update(&self.outer_key(key), object)
            .await
            .map_err(|e| self.rename_error(key, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner
            .delete(&self.outer_key(key))
            .await
            .map_err(|e| self.rename_error(key, e))
    }

    async fn get_multiple(&self, keys: &[String]) -> Result<GetMultipleResult<T>> {
        let outer: Vec<String> = keys.iter().map(|k| self.outer_key(k)).collect();
        let result = self.inner.get_multiple(&outer).await?;
        Ok(GetMultipleResult {
            found: result
                .found
                .into_iter()
                .map(|(k, v)| Ok((self.strip(k)?, v)))
                .collect::<Result<_>>()?,
            not_found: result
                .not_found
                .into_iter()
                .map(|k| self.strip(k))
                .collect::<Result<_>>()?,
        })
    }

    async fn get_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>> {
        let page = self
            .inner
            .get_keys_in_range(&self.inner_range(range), page_token)
            .await?;
        self.strip_page(page)
    }

    async fn get_deleted_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>> {
        let page = self
            .inner
            .get_deleted_keys_in_range(&self.inner_range(range), page_token)
            .await?;
        self.strip_page(page)
    }

    async fn sweep_range(&self, range: &KeyRange) -> Result<Vec<String>> {
        self.inner
            .sweep_range(&self.inner_range(range))
            .await?
            .into_iter()
            .map(|k| self.strip(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_views_share_one_store_without_collisions() {
        let shared = Arc::new(InMemoryObjectStore::<u32>::new());
        let salts = PrefixedObjectStore::new(shared.clone(), "salts/");
        let creds = PrefixedObjectStore::new(shared.clone(), "creds/");

        salts.create("alice", 1u32).await.unwrap();
        creds.create("alice", 2u32).await.unwrap();

        assert_eq!(salts.get("alice").await.unwrap(), 1);
        assert_eq!(creds.get("alice").await.unwrap(), 2);
        assert_eq!(shared.get("salts/alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_range_enumeration_strips_prefix() {
        let shared = Arc::new(InMemoryObjectStore::<u32>::new());
        shared.create("other", 0u32).await.unwrap();
        let view = PrefixedObjectStore::new(shared.clone(), "p/");
        for key in ["a", "b", "c"] {
            view.create(key, 1).await.unwrap();
        }

        let all = view.get_keys_in_range(&KeyRange::all(), None).await.unwrap();
        assert_eq!(all.items, vec!["a", "b", "c"]);

        let some = view
            .get_keys_in_range(&KeyRange::new("b", "c"), None)
            .await
            .unwrap();
        assert_eq!(some.items, vec!["b"]);
    }

    #[tokio::test]
    async fn test_errors_name_the_unprefixed_key() {
        let view = PrefixedObjectStore::new(InMemoryObjectStore::<u32>::new(), "p/");
        let err = view.get("missing").await.err().unwrap();
        assert_eq!(err.to_string(), "Not found: missing");
    }

    #[tokio::test]
    async fn test_sweep_only_touches_own_prefix() {
        let shared = Arc::new(InMemoryObjectStore::<u32>::new());
        let a = PrefixedObjectStore::new(shared.clone(), "a/");
        let b = PrefixedObjectStore::new(shared.clone(), "b/");
        a.create("k", 1u32).await.unwrap();
        b.create("k", 1u32).await.unwrap();
        a.delete("k").await.unwrap();
        b.delete("k").await.unwrap();

        assert_eq!(a.sweep().await.unwrap(), vec!["k"]);
        assert_eq!(b.get_deleted_keys(None).await.unwrap().items, vec!["k"]);
        assert!(a.get_deleted_keys(None).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_get_multiple_through_view() {
        let view = PrefixedObjectStore::new(InMemoryObjectStore::<u32>::new(), "p/");
        view.create("a", 1u32).await.unwrap();
        let result = view
            .get_multiple(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(result.found.get("a"), Some(&1));
        assert_eq!(result.not_found, vec!["b"]);
    }
}
