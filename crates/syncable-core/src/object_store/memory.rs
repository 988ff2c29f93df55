use std::sync::RwLock;

use async_trait::async_trait;

use super::{KeyRange, ObjectStore, ObjectTable, Paginated, StorableObject};
use crate::error::Result;

/// Process-local object store.
pub struct InMemoryObjectStore<T> {
    table: RwLock<ObjectTable<T>>,
    page_size: usize,
}

impl<T> InMemoryObjectStore<T> {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            table: RwLock::new(ObjectTable::default()),
            page_size,
        }
    }
}

impl<T> Default for InMemoryObjectStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> ObjectStore<T> for InMemoryObjectStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn create(&self, key: &str, value: T) -> Result<T> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.create(key, value)
    }

    async fn get(&self, key: &str) -> Result<T> {
        self.get_mutable(key).await.map(|object| object.value)
    }

    async fn get_mutable(&self, key: &str) -> Result<StorableObject<T>> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.get_mutable(key)
    }

    async fn update(&self, key: &str, object: StorableObject<T>) -> Result<()> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.update(key, object)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.delete(key)
    }

    async fn get_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        Ok(table.keys_in_range(range, page_token, self.page_size))
    }

    async fn get_deleted_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        Ok(table.deleted_in_range(range, page_token, self.page_size))
    }

    async fn sweep_range(&self, range: &KeyRange) -> Result<Vec<String>> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        Ok(table.sweep_range(range))
    }
}
