//! Hierarchical persistence of folders, bundles and files.
//!
//! A [`StorageBacking`] maps a [`SyncablePath`] to an item and its
//! [`Metadata`], and maintains the lazily cached subtree hashes that drive
//! synchronization. [`FsBacking`] is the file-system realization.

mod fs_backing;

pub use fs_backing::FsBacking;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crypto::CryptoService;
use crate::error::{Result, StoreError};
use crate::events::EventBus;
use crate::hash::ContentHash;
use crate::id::{ItemType, SyncableId, SyncablePath};
use crate::metadata::{LocalMetadataPatch, Metadata};

/// A folder or bundle as returned by [`StorageBacking::get_at_path`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerAccessor {
    pub path: SyncablePath,
    pub metadata: Metadata,
}

/// A file together with its stored (possibly encrypted) bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAccessor {
    pub path: SyncablePath,
    pub metadata: Metadata,
    pub data: Vec<u8>,
}

impl FileAccessor {
    /// The cached content hash, or one computed from the stored bytes.
    pub fn hash(&self) -> ContentHash {
        self.metadata
            .hash()
            .cloned()
            .unwrap_or_else(|| ContentHash::of_bytes(&self.data))
    }

    /// Decode a JSON-typed file, checking its recorded schema.
    pub fn decode_json<V: DeserializeOwned>(&self, schema: &str) -> Result<V> {
        if self.metadata.schema.as_deref() != Some(schema) {
            return Err(StoreError::format(
                self.path.to_string(),
                format!(
                    "expected schema {}, found {}",
                    schema,
                    self.metadata.schema.as_deref().unwrap_or("none")
                ),
            ));
        }
        serde_json::from_slice(&self.data).map_err(|e| StoreError::format(self.path.to_string(), e))
    }

    /// The file's content, decrypted if it is stored encrypted.
    pub async fn plaintext(&self, crypto: &dyn CryptoService) -> Result<Vec<u8>> {
        if self.metadata.encrypted {
            crypto.decrypt(&self.data).await
        } else {
            Ok(self.data.clone())
        }
    }
}

/// One item of any type.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemAccessor {
    Folder(ContainerAccessor),
    Bundle(ContainerAccessor),
    File(FileAccessor),
}

impl ItemAccessor {
    pub fn item_type(&self) -> ItemType {
        match self {
            ItemAccessor::Folder(_) => ItemType::Folder,
            ItemAccessor::Bundle(_) => ItemType::Bundle,
            ItemAccessor::File(_) => ItemType::File,
        }
    }

    pub fn path(&self) -> &SyncablePath {
        match self {
            ItemAccessor::Folder(c) | ItemAccessor::Bundle(c) => &c.path,
            ItemAccessor::File(f) => &f.path,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            ItemAccessor::Folder(c) | ItemAccessor::Bundle(c) => &c.metadata,
            ItemAccessor::File(f) => &f.metadata,
        }
    }

    pub fn into_file(self) -> Result<FileAccessor> {
        match self {
            ItemAccessor::File(f) => Ok(f),
            other => Err(StoreError::wrong_type(
                other.path(),
                other.item_type(),
                &[ItemType::File],
            )),
        }
    }

    pub fn into_container(self) -> Result<ContainerAccessor> {
        match self {
            ItemAccessor::Folder(c) | ItemAccessor::Bundle(c) => Ok(c),
            ItemAccessor::File(f) => Err(StoreError::wrong_type(
                &f.path,
                ItemType::File,
                crate::id::CONTAINER_TYPES,
            )),
        }
    }
}

/// Durable tree of items with hash-aware navigation.
///
/// Every operation fails with `NotFound` for absent items, `Deleted` for
/// tombstoned ones and `WrongType` when a path crosses a file or an item is
/// not of an expected type.
#[async_trait]
pub trait StorageBacking: Send + Sync {
    fn storage_root_id(&self) -> &str;

    /// Bus on which structural changes are published.
    fn events(&self) -> Arc<EventBus>;

    /// Whether a live item exists at `path`.
    async fn exists_at_path(&self, path: &SyncablePath) -> Result<bool>;

    async fn get_at_path(
        &self,
        path: &SyncablePath,
        expected: Option<&[ItemType]>,
    ) -> Result<ItemAccessor>;

    /// Live children of a folder or bundle, sorted, optionally filtered by type.
    async fn get_ids_in_path(
        &self,
        path: &SyncablePath,
        filter: Option<&[ItemType]>,
    ) -> Result<Vec<SyncableId>>;

    async fn get_metadata_at_path(&self, path: &SyncablePath) -> Result<Metadata>;

    /// Metadata of a container's live children, optionally limited to `ids`.
    /// Requested ids that are absent are left out of the result.
    async fn get_metadata_by_id_in_path(
        &self,
        path: &SyncablePath,
        ids: Option<&[SyncableId]>,
    ) -> Result<BTreeMap<SyncableId, Metadata>>;

    async fn create_binary_file_with_path(
        &self,
        path: &SyncablePath,
        data: Vec<u8>,
        metadata: Metadata,
    ) -> Result<FileAccessor>;

    /// Replace the content and metadata of an existing live file.
    async fn update_binary_file_at_path(
        &self,
        path: &SyncablePath,
        data: Vec<u8>,
        metadata: Metadata,
    ) -> Result<FileAccessor>;

    /// Create a folder. Creating the root path creates the store itself.
    async fn create_folder_with_path(
        &self,
        path: &SyncablePath,
        metadata: Metadata,
    ) -> Result<ContainerAccessor>;

    async fn create_bundle_with_path(
        &self,
        path: &SyncablePath,
        metadata: Metadata,
    ) -> Result<ContainerAccessor>;

    /// Soft-delete an item. Deleting the root removes the whole store.
    async fn delete_at_path(&self, path: &SyncablePath) -> Result<()>;

    /// Update locally cached fields only.
    async fn update_local_metadata_at_path(
        &self,
        path: &SyncablePath,
        patch: LocalMetadataPatch,
    ) -> Result<()>;

    /// The item's hash, computed and cached if necessary.
    async fn get_hash_at_path(&self, path: &SyncablePath) -> Result<ContentHash>;

    /// Permanently remove tombstoned children of a container, returning their ids.
    async fn sweep_deleted_in_path(&self, path: &SyncablePath) -> Result<Vec<SyncableId>>;
}

/// Create a file holding `value` encoded as JSON and tagged with `schema`.
pub async fn create_json_file_with_path<B, V>(
    backing: &B,
    path: &SyncablePath,
    schema: &str,
    value: &V,
    metadata: Metadata,
) -> Result<FileAccessor>
where
    B: StorageBacking + ?Sized,
    V: Serialize + Sync,
{
    let data = serde_json::to_vec(value)?;
    backing
        .create_binary_file_with_path(path, data, metadata.with_schema(schema))
        .await
}
