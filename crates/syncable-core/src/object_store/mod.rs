//! Keyed object store with optimistic concurrency.
//!
//! Every stored value carries an `update_count`. An update only succeeds when
//! the caller presents the count it read; otherwise it fails with `OutOfDate`
//! and the caller re-reads (see [`update_object`]).
//!
//! Deleting a key leaves a tombstone: the key reports `Deleted` and refuses
//! `create` until a sweep reclaims it.
//!
//! Implementations:
//! - [`InMemoryObjectStore`] - process-local table
//! - [`JsonFileObjectStore`] - one JSON document on a [`FileSystem`](crate::fs::FileSystem)
//! - [`PrefixedObjectStore`] - a key-prefixed view over another store

mod json_file;
mod memory;
mod prefixed;
mod utils;

pub use json_file::JsonFileObjectStore;
pub use memory::InMemoryObjectStore;
pub use prefixed::PrefixedObjectStore;
pub use utils::{force_set_object_value, update_object};

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// A stored value together with its version stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorableObject<T> {
    pub value: T,
    pub update_count: u64,
}

/// One page of an enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paginated<K> {
    pub items: Vec<K>,
    /// Pass back to fetch the next page; `None` on the last page.
    pub next_page_token: Option<String>,
}

/// Result of a best-effort batch read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMultipleResult<T> {
    pub found: BTreeMap<String, T>,
    pub not_found: Vec<String>,
}

/// Half-open key range `[start, end)`. `None` bounds are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }

    /// Every key starting with `prefix`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            start: Some(prefix.to_string()),
            end: prefix_successor(prefix),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.start.as_deref().is_none_or(|s| key >= s)
            && self.end.as_deref().is_none_or(|e| key < e)
    }

    /// A range whose start lies after its end contains nothing.
    fn is_inverted(&self) -> bool {
        matches!((&self.start, &self.end), (Some(s), Some(e)) if s > e)
    }

    fn bounds(&self) -> (Bound<&str>, Bound<&str>) {
        let start = match &self.start {
            Some(s) => Bound::Included(s.as_str()),
            None => Bound::Unbounded,
        };
        let end = match &self.end {
            Some(e) => Bound::Excluded(e.as_str()),
            None => Bound::Unbounded,
        };
        (start, end)
    }
}

/// Smallest string greater than every string starting with `prefix`.
pub(crate) fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last as u32 {
            0xD7FF => Some('\u{E000}'),
            n => char::from_u32(n + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// Contract of a keyed store of `T` values.
#[async_trait]
pub trait ObjectStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Store a new value. Fails with `Conflict` if the key is live or tombstoned.
    async fn create(&self, key: &str, value: T) -> Result<T>;

    async fn get(&self, key: &str) -> Result<T>;

    /// Read the value together with its current `update_count`.
    async fn get_mutable(&self, key: &str) -> Result<StorableObject<T>>;

    /// Compare-and-swap on `update_count`. Fails with `OutOfDate` on mismatch.
    async fn update(&self, key: &str, object: StorableObject<T>) -> Result<()>;

    /// Tombstone a live key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Live keys in `range`, in ascending order.
    async fn get_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>>;

    /// Tombstoned keys in `range`, in ascending order.
    async fn get_deleted_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>>;

    /// Permanently remove the tombstones in `range`, returning their keys.
    async fn sweep_range(&self, range: &KeyRange) -> Result<Vec<String>>;

    async fn get_multiple(&self, keys: &[String]) -> Result<GetMultipleResult<T>> {
        let mut result = GetMultipleResult {
            found: BTreeMap::new(),
            not_found: Vec::new(),
        };
        for key in keys {
            match self.get(key).await {
                Ok(value) => {
                    result.found.insert(key.clone(), value);
                }
                Err(e) if e.is_not_found() => result.not_found.push(key.clone()),
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    async fn get_deleted_keys(&self, page_token: Option<&str>) -> Result<Paginated<String>> {
        self.get_deleted_keys_in_range(&KeyRange::all(), page_token)
            .await
    }

    async fn sweep(&self) -> Result<Vec<String>> {
        self.sweep_range(&KeyRange::all()).await
    }
}

// Lets several views share one physical store.
#[async_trait]
impl<T, S> ObjectStore<T> for std::sync::Arc<S>
where
    T: Clone + Send + Sync + 'static,
    S: ObjectStore<T> + ?Sized,
{
    async fn create(&self, key: &str, value: T) -> Result<T> {
        (**self).create(key, value).await
    }

    async fn get(&self, key: &str) -> Result<T> {
        (**self).get(key).await
    }

    async fn get_mutable(&self, key: &str) -> Result<StorableObject<T>> {
        (**self).get_mutable(key).await
    }

    async fn update(&self, key: &str, object: StorableObject<T>) -> Result<()> {
        (**self).update(key, object).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn get_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>> {
        (**self).get_keys_in_range(range, page_token).await
    }

    async fn get_deleted_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>> {
        (**self).get_deleted_keys_in_range(range, page_token).await
    }

    async fn sweep_range(&self, range: &KeyRange) -> Result<Vec<String>> {
        (**self).sweep_range(range).await
    }

    async fn get_multiple(&self, keys: &[String]) -> Result<GetMultipleResult<T>> {
        (**self).get_multiple(keys).await
    }
}

/// Live values plus tombstones. The state shared by the concrete stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    rename_all = "camelCase",
    bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>")
)]
pub(crate) struct ObjectTable<T> {
    #[serde(default)]
    objects: BTreeMap<String, StorableObject<T>>,
    #[serde(default)]
    deleted: BTreeSet<String>,
}

impl<T> Default for ObjectTable<T> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            deleted: BTreeSet::new(),
        }
    }
}

impl<T: Clone> ObjectTable<T> {
    pub(crate) fn create(&mut self, key: &str, value: T) -> Result<T> {
        if self.objects.contains_key(key) || self.deleted.contains(key) {
            return Err(StoreError::Conflict(key.to_string()));
        }
        self.objects.insert(
            key.to_string(),
            StorableObject {
                value: value.clone(),
                update_count: 0,
            },
        );
        Ok(value)
    }

    pub(crate) fn get_mutable(&self, key: &str) -> Result<StorableObject<T>> {
        match self.objects.get(key) {
            Some(object) => Ok(object.clone()),
            None if self.deleted.contains(key) => Err(StoreError::Deleted(key.to_string())),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    pub(crate) fn update(&mut self, key: &str, object: StorableObject<T>) -> Result<()> {
        let current = match self.objects.get_mut(key) {
            Some(current) => current,
            None if self.deleted.contains(key) => {
                return Err(StoreError::Deleted(key.to_string()));
            }
            None => return Err(StoreError::NotFound(key.to_string())),
        };
        if current.update_count != object.update_count {
            return Err(StoreError::OutOfDate(key.to_string()));
        }
        current.value = object.value;
        current.update_count += 1;
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: &str) -> Result<()> {
        if self.objects.remove(key).is_some() {
            self.deleted.insert(key.to_string());
            Ok(())
        } else if self.deleted.contains(key) {
            Err(StoreError::Deleted(key.to_string()))
        } else {
            Err(StoreError::NotFound(key.to_string()))
        }
    }

    pub(crate) fn keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Paginated<String> {
        if range.is_inverted() {
            return paginate(std::iter::empty(), page_token, page_size);
        }
        paginate(
            self.objects.range::<str, _>(range.bounds()).map(|(k, _)| k),
            page_token,
            page_size,
        )
    }

    pub(crate) fn deleted_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Paginated<String> {
        if range.is_inverted() {
            return paginate(std::iter::empty(), page_token, page_size);
        }
        paginate(
            self.deleted.range::<str, _>(range.bounds()),
            page_token,
            page_size,
        )
    }

    pub(crate) fn sweep_range(&mut self, range: &KeyRange) -> Vec<String> {
        if range.is_inverted() {
            return Vec::new();
        }
        let swept: Vec<String> = self
            .deleted
            .range::<str, _>(range.bounds())
            .cloned()
            .collect();
        for key in &swept {
            self.deleted.remove(key);
        }
        swept
    }
}

/// Page tokens are the last key of the previous page.
fn paginate<'a>(
    keys: impl Iterator<Item = &'a String>,
    page_token: Option<&str>,
    page_size: usize,
) -> Paginated<String> {
    let page_size = page_size.max(1);
    let mut items: Vec<String> = keys
        .filter(|k| page_token.is_none_or(|t| k.as_str() > t))
        .take(page_size + 1)
        .cloned()
        .collect();
    let next_page_token = if items.len() > page_size {
        items.truncate(page_size);
        items.last().cloned()
    } else {
        None
    };
    Paginated {
        items,
        next_page_token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range() {
        let range = KeyRange::with_prefix("user/");
        assert!(range.contains("user/a"));
        assert!(range.contains("user/"));
        assert!(!range.contains("user0"));
        assert!(!range.contains("usea"));
        assert_eq!(range.end.as_deref(), Some("user0"));
    }

    #[test]
    fn test_empty_prefix_is_unbounded() {
        assert_eq!(prefix_successor(""), None);
        assert!(KeyRange::with_prefix("").contains("anything"));
    }

    #[test]
    fn test_tombstone_blocks_create_until_swept() {
        let mut table = ObjectTable::default();
        table.create("k", 1).unwrap();
        table.delete("k").unwrap();

        assert!(matches!(table.create("k", 2), Err(StoreError::Conflict(_))));
        assert!(matches!(table.get_mutable("k"), Err(StoreError::Deleted(_))));

        assert_eq!(table.sweep_range(&KeyRange::all()), vec!["k".to_string()]);
        assert_eq!(table.create("k", 3).unwrap(), 3);
    }

    #[test]
    fn test_pagination_walks_all_keys() {
        let mut table = ObjectTable::default();
        for i in 0..5 {
            table.create(&format!("k{}", i), i).unwrap();
        }

        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = table.keys_in_range(&KeyRange::all(), token.as_deref(), 2);
            assert!(page.items.len() <= 2);
            seen.extend(page.items);
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, vec!["k0", "k1", "k2", "k3", "k4"]);
    }
}
