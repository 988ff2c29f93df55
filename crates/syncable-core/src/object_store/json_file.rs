use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

use super::{KeyRange, ObjectStore, ObjectTable, Paginated, StorableObject};
use crate::error::{Result, StoreError};
use crate::fs::{FileSystem, FsError};

/// Object store persisted as a single JSON document.
///
/// Every mutation rewrites the whole document through [`FileSystem::write`],
/// so it suits low-volume keyed data such as credentials and salts.
pub struct JsonFileObjectStore<T, F> {
    fs: F,
    path: String,
    table: Mutex<ObjectTable<T>>,
    page_size: usize,
}

impl<T, F> JsonFileObjectStore<T, F>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    F: FileSystem,
{
    /// Load the document at `path`, starting empty if it does not exist.
    pub async fn open(fs: F, path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let table = match fs.read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::format(path.clone(), e))?,
            Err(FsError::NotFound(_)) => {
                debug!("No object store document at {}, starting empty", path);
                ObjectTable::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            fs,
            path,
            table: Mutex::new(table),
            page_size: 100,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Apply `mutate` to a copy of the table, persist it, then commit.
    async fn mutate<R>(
        &self,
        mutate: impl FnOnce(&mut ObjectTable<T>) -> Result<R> + Send,
    ) -> Result<R> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let result = mutate(&mut next)?;
        let bytes = serde_json::to_vec_pretty(&next)?;
        self.fs.write(&self.path, &bytes).await?;
        *table = next;
        Ok(result)
    }
}

#[async_trait]
impl<T, F> ObjectStore<T> for JsonFileObjectStore<T, F>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    F: FileSystem,
{
    async fn create(&self, key: &str, value: T) -> Result<T> {
        self.mutate(|table| table.create(key, value)).await
    }

    async fn get(&self, key: &str) -> Result<T> {
        self.get_mutable(key).await.map(|object| object.value)
    }

    async fn get_mutable(&self, key: &str) -> Result<StorableObject<T>> {
        self.table.lock().await.get_mutable(key)
    }

    async fn update(&self, key: &str, object: StorableObject<T>) -> Result<()> {
        self.mutate(|table| table.update(key, object)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.mutate(|table| table.delete(key)).await
    }

    async fn get_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>> {
        let table = self.table.lock().await;
        Ok(table.keys_in_range(range, page_token, self.page_size))
    }

    async fn get_deleted_keys_in_range(
        &self,
        range: &KeyRange,
        page_token: Option<&str>,
    ) -> Result<Paginated<String>> {
        let table = self.table.lock().await;
        Ok(table.deleted_in_range(range, page_token, self.page_size))
    }

    async fn sweep_range(&self, range: &KeyRange) -> Result<Vec<String>> {
        self.mutate(|table| Ok(table.sweep_range(range))).await
    }
}
