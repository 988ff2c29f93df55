//! File-system storage backing.
//!
//! Layout for a store with root id `store`:
//!
//! ```text
//! store/metadata.json              root folder metadata
//! store/metadata.<token>.json      metadata side-file of child <token>
//! store/<token>/                   folder or bundle data
//! store/<token>                    file data
//! ```
//!
//! Physical existence of a data entry is the create-time conflict check.
//! Side-files are replaced atomically, so a reader always sees a complete
//! metadata document. Writes to one path are serialized by [`PathLocks`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, info};

use super::{ContainerAccessor, FileAccessor, ItemAccessor, StorageBacking};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::events::{EventBus, StoreEvent};
use crate::fs::{FileSystem, FsError};
use crate::hash::ContentHash;
use crate::id::{CONTAINER_TYPES, ItemType, SyncableId, SyncablePath};
use crate::lock::PathLocks;
use crate::metadata::{LocalMetadata, LocalMetadataPatch, Metadata};

const ROOT_METADATA: &str = "metadata.json";
const METADATA_PREFIX: &str = "metadata.";
const METADATA_SUFFIX: &str = ".json";

/// Storage backing over any [`FileSystem`].
pub struct FsBacking<F> {
    fs: F,
    storage_root_id: String,
    root: SyncablePath,
    locks: PathLocks,
    /// Bumped on every hash invalidation; a hash computed across a bump is not cached.
    epoch: AtomicU64,
    events: Arc<EventBus>,
}

impl<F: FileSystem> FsBacking<F> {
    pub fn new(fs: F, storage_root_id: &str, config: &StoreConfig) -> Result<Self> {
        // Validates the root id as a file-system-safe token.
        let root = SyncablePath::root(storage_root_id)?;
        Ok(Self {
            fs,
            storage_root_id: storage_root_id.to_string(),
            root,
            locks: PathLocks::new(config.lock_timeout),
            epoch: AtomicU64::new(0),
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn root_path(&self) -> SyncablePath {
        self.root.clone()
    }

    fn data_path(&self, path: &SyncablePath) -> String {
        let mut out = self.storage_root_id.clone();
        for id in path.ids() {
            out.push('/');
            out.push_str(id.token());
        }
        out
    }

    fn metadata_path(&self, path: &SyncablePath) -> String {
        match (path.parent(), path.last_id()) {
            (Some(parent), Some(id)) => format!(
                "{}/{}{}{}",
                self.data_path(&parent),
                METADATA_PREFIX,
                id.token(),
                METADATA_SUFFIX
            ),
            _ => format!("{}/{}", self.storage_root_id, ROOT_METADATA),
        }
    }

    fn check_store(&self, path: &SyncablePath) -> Result<()> {
        if path.storage_root_id() != self.storage_root_id {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(())
    }

    /// Type an item at `path` must have, judging by its id.
    fn type_of(path: &SyncablePath) -> ItemType {
        path.last_id()
            .map(SyncableId::item_type)
            .unwrap_or(ItemType::Folder)
    }

    async fn read_metadata(&self, path: &SyncablePath) -> Result<Option<Metadata>> {
        let file = self.metadata_path(path);
        match self.fs.read(&file).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::format(file, e)),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_metadata(&self, path: &SyncablePath, metadata: &Metadata) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(metadata)?;
        self.fs.write(&self.metadata_path(path), &bytes).await?;
        Ok(())
    }

    /// Walk from the root to `path`, returning the live item's metadata.
    async fn resolve(
        &self,
        path: &SyncablePath,
        expected: Option<&[ItemType]>,
    ) -> Result<Metadata> {
        self.check_store(path)?;
        let mut current = None;
        for prefix in path.self_and_ancestors().collect::<Vec<_>>().into_iter().rev() {
            let metadata = self
                .read_metadata(&prefix)
                .await?
                .ok_or_else(|| StoreError::NotFound(prefix.to_string()))?;
            if metadata.is_deleted() {
                return Err(StoreError::Deleted(prefix.to_string()));
            }
            let recorded = Self::type_of(&prefix);
            if metadata.item_type != recorded {
                return Err(StoreError::wrong_type(&prefix, metadata.item_type, &[recorded]));
            }
            if prefix != *path && !metadata.item_type.is_container() {
                return Err(StoreError::wrong_type(&prefix, metadata.item_type, CONTAINER_TYPES));
            }
            current = Some(metadata);
        }
        let metadata = current.ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        if let Some(expected) = expected {
            if !expected.contains(&metadata.item_type) {
                return Err(StoreError::wrong_type(path, metadata.item_type, expected));
            }
        }

        // A concurrent delete may have removed the data after the side-file was read.
        if !self.fs.exists(&self.data_path(path)).await? {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(metadata)
    }

    /// All children of a container with their metadata, tombstones included.
    async fn read_children(&self, path: &SyncablePath) -> Result<Vec<(SyncableId, Metadata)>> {
        let mut children = Vec::new();
        for entry in self.fs.list(&self.data_path(path)).await? {
            if entry.is_dir || entry.name.starts_with('.') {
                continue;
            }
            let Some(token) = entry
                .name
                .strip_prefix(METADATA_PREFIX)
                .and_then(|rest| rest.strip_suffix(METADATA_SUFFIX))
            else {
                continue;
            };
            if token.is_empty() {
                continue;
            }
            let file = format!("{}/{}", self.data_path(path), entry.name);
            let bytes = match self.fs.read(&file).await {
                Ok(bytes) => bytes,
                // Swept between listing and reading
                Err(FsError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let metadata: Metadata =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::format(file, e))?;
            let id = SyncableId::from_parts(metadata.item_type, token)?;
            children.push((id, metadata));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    /// Clear the cached hash of every ancestor of `path`, nearest first.
    async fn invalidate_ancestors(&self, path: &SyncablePath) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        for ancestor in parent.self_and_ancestors() {
            let _guard = self.locks.acquire(&ancestor.to_string()).await?;
            if let Some(mut metadata) = self.read_metadata(&ancestor).await? {
                if metadata.local.hash.take().is_some() {
                    self.write_metadata(&ancestor, &metadata).await?;
                }
            }
        }
        Ok(())
    }

    fn check_create(path: &SyncablePath, item_type: ItemType, metadata: &Metadata) -> Result<()> {
        let id_type = Self::type_of(path);
        if id_type != item_type {
            return Err(StoreError::wrong_type(path, id_type, &[item_type]));
        }
        if metadata.item_type != item_type {
            return Err(StoreError::wrong_type(path, metadata.item_type, &[item_type]));
        }
        Ok(())
    }

    async fn create_root(&self, path: &SyncablePath, mut metadata: Metadata) -> Result<ContainerAccessor> {
        self.fs.mkdir("").await?;
        let _guard = self.locks.acquire(&path.to_string()).await?;
        self.fs.create_dir(&self.storage_root_id).await?;
        metadata.local = LocalMetadata::default();
        self.write_metadata(path, &metadata).await?;
        info!("Created store {}", self.storage_root_id);
        self.events.emit(StoreEvent::added(path.clone(), ItemType::Folder));
        Ok(ContainerAccessor {
            path: path.clone(),
            metadata,
        })
    }

    /// Shared create path for all three item types.
    async fn create_item(
        &self,
        path: &SyncablePath,
        data: Option<Vec<u8>>,
        mut metadata: Metadata,
    ) -> Result<ItemAccessor> {
        let item_type = metadata.item_type;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Conflict(path.to_string()))?;
        self.resolve(&parent, Some(CONTAINER_TYPES)).await?;

        {
            let _guard = self.locks.acquire(&path.to_string()).await?;
            if self.fs.exists(&self.metadata_path(path)).await? {
                return Err(StoreError::Conflict(path.to_string()));
            }
            let data_path = self.data_path(path);
            let conflict = |e: FsError| match e {
                FsError::AlreadyExists(_) => StoreError::Conflict(path.to_string()),
                other => other.into(),
            };
            match &data {
                Some(bytes) => self.fs.create_new(&data_path, bytes).await.map_err(conflict)?,
                None => self.fs.create_dir(&data_path).await.map_err(conflict)?,
            }
            metadata.local = LocalMetadata {
                hash: data.as_deref().map(ContentHash::of_bytes),
                deleted: false,
            };
            self.write_metadata(path, &metadata).await?;
        }

        self.invalidate_ancestors(path).await?;
        debug!("Created {} at {}", item_type, path);
        self.events.emit(StoreEvent::added(path.clone(), item_type));

        Ok(match data {
            Some(data) => ItemAccessor::File(FileAccessor {
                path: path.clone(),
                metadata,
                data,
            }),
            None => {
                let container = ContainerAccessor {
                    path: path.clone(),
                    metadata,
                };
                if item_type == ItemType::Folder {
                    ItemAccessor::Folder(container)
                } else {
                    ItemAccessor::Bundle(container)
                }
            }
        })
    }

    async fn create_container(
        &self,
        path: &SyncablePath,
        item_type: ItemType,
        metadata: Metadata,
    ) -> Result<ContainerAccessor> {
        self.check_store(path)?;
        Self::check_create(path, item_type, &metadata)?;
        if path.is_root() {
            return self.create_root(path, metadata).await;
        }
        self.create_item(path, None, metadata)
            .await?
            .into_container()
    }

    /// Compute (or read the cached) hash of a live item.
    fn compute_hash<'a>(
        &'a self,
        path: &'a SyncablePath,
        metadata: Metadata,
    ) -> BoxFuture<'a, Result<ContentHash>> {
        Box::pin(async move {
            if let Some(hash) = metadata.hash() {
                debug!("Hash cache hit for {}", path);
                return Ok(hash.clone());
            }

            let epoch = self.epoch.load(Ordering::SeqCst);
            let hash = if metadata.item_type.is_container() {
                let mut children = BTreeMap::new();
                for (id, child_metadata) in self.read_children(path).await? {
                    if child_metadata.is_deleted() {
                        continue;
                    }
                    let child_path = path.child(id.clone());
                    let child_hash = match self.compute_hash(&child_path, child_metadata).await {
                        Ok(hash) => hash,
                        // Deleted while we were walking; the epoch check below discards the result.
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    };
                    children.insert(id, child_hash);
                }
                let identity = path
                    .last_id()
                    .map(SyncableId::token)
                    .unwrap_or(self.storage_root_id.as_str());
                ContentHash::of_container(metadata.item_type, identity, &children)
            } else {
                let data = self.fs.read(&self.data_path(path)).await?;
                ContentHash::of_bytes(&data)
            };

            let _guard = self.locks.acquire(&path.to_string()).await?;
            if self.epoch.load(Ordering::SeqCst) == epoch {
                if let Some(mut current) = self.read_metadata(path).await? {
                    if !current.is_deleted() && current.local.hash.is_none() {
                        current.local.hash = Some(hash.clone());
                        self.write_metadata(path, &current).await?;
                    }
                }
            } else {
                debug!("Hash of {} invalidated during computation, not caching", path);
            }
            Ok(hash)
        })
    }
}

#[async_trait]
impl<F: FileSystem> StorageBacking for FsBacking<F> {
    fn storage_root_id(&self) -> &str {
        &self.storage_root_id
    }

    fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    async fn exists_at_path(&self, path: &SyncablePath) -> Result<bool> {
        match self.resolve(path, None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_at_path(
        &self,
        path: &SyncablePath,
        expected: Option<&[ItemType]>,
    ) -> Result<ItemAccessor> {
        let metadata = self.resolve(path, expected).await?;
        Ok(match metadata.item_type {
            ItemType::File => {
                let data = self.fs.read(&self.data_path(path)).await?;
                ItemAccessor::File(FileAccessor {
                    path: path.clone(),
                    metadata,
                    data,
                })
            }
            ItemType::Folder => ItemAccessor::Folder(ContainerAccessor {
                path: path.clone(),
                metadata,
            }),
            ItemType::Bundle => ItemAccessor::Bundle(ContainerAccessor {
                path: path.clone(),
                metadata,
            }),
        })
    }

    async fn get_ids_in_path(
        &self,
        path: &SyncablePath,
        filter: Option<&[ItemType]>,
    ) -> Result<Vec<SyncableId>> {
        self.resolve(path, Some(CONTAINER_TYPES)).await?;
        Ok(self
            .read_children(path)
            .await?
            .into_iter()
            .filter(|(id, metadata)| {
                !metadata.is_deleted() && filter.is_none_or(|f| f.contains(&id.item_type()))
            })
            .map(|(id, _)| id)
            .collect())
    }

    async fn get_metadata_at_path(&self, path: &SyncablePath) -> Result<Metadata> {
        self.resolve(path, None).await
    }

    async fn get_metadata_by_id_in_path(
        &self,
        path: &SyncablePath,
        ids: Option<&[SyncableId]>,
    ) -> Result<BTreeMap<SyncableId, Metadata>> {
        self.resolve(path, Some(CONTAINER_TYPES)).await?;
        let mut result = BTreeMap::new();
        match ids {
            Some(ids) => {
                for id in ids {
                    if let Some(metadata) = self.read_metadata(&path.child(id.clone())).await? {
                        if !metadata.is_deleted() && metadata.item_type == id.item_type() {
                            result.insert(id.clone(), metadata);
                        }
                    }
                }
            }
            None => {
                for (id, metadata) in self.read_children(path).await? {
                    if !metadata.is_deleted() {
                        result.insert(id, metadata);
                    }
                }
            }
        }
        Ok(result)
    }

    async fn create_binary_file_with_path(
        &self,
        path: &SyncablePath,
        data: Vec<u8>,
        metadata: Metadata,
    ) -> Result<FileAccessor> {
        self.check_store(path)?;
        Self::check_create(path, ItemType::File, &metadata)?;
        if path.is_root() {
            return Err(StoreError::wrong_type(path, ItemType::Folder, &[ItemType::File]));
        }
        self.create_item(path, Some(data), metadata)
            .await?
            .into_file()
    }

    async fn update_binary_file_at_path(
        &self,
        path: &SyncablePath,
        data: Vec<u8>,
        mut metadata: Metadata,
    ) -> Result<FileAccessor> {
        self.resolve(path, Some(&[ItemType::File])).await?;
        if metadata.item_type != ItemType::File {
            return Err(StoreError::wrong_type(path, metadata.item_type, &[ItemType::File]));
        }
        {
            let _guard = self.locks.acquire(&path.to_string()).await?;
            // Re-check under the lock; a delete may have won the race.
            match self.read_metadata(path).await? {
                Some(current) if current.is_deleted() => {
                    return Err(StoreError::Deleted(path.to_string()));
                }
                Some(_) => {}
                None => return Err(StoreError::NotFound(path.to_string())),
            }
            self.fs.write(&self.data_path(path), &data).await?;
            metadata.local = LocalMetadata {
                hash: Some(ContentHash::of_bytes(&data)),
                deleted: false,
            };
            self.write_metadata(path, &metadata).await?;
        }
        self.invalidate_ancestors(path).await?;
        debug!("Updated file at {}", path);
        self.events.emit(StoreEvent::ItemUpdated { path: path.clone() });
        Ok(FileAccessor {
            path: path.clone(),
            metadata,
            data,
        })
    }

    async fn create_folder_with_path(
        &self,
        path: &SyncablePath,
        metadata: Metadata,
    ) -> Result<ContainerAccessor> {
        self.create_container(path, ItemType::Folder, metadata).await
    }

    async fn create_bundle_with_path(
        &self,
        path: &SyncablePath,
        metadata: Metadata,
    ) -> Result<ContainerAccessor> {
        self.create_container(path, ItemType::Bundle, metadata).await
    }

    async fn delete_at_path(&self, path: &SyncablePath) -> Result<()> {
        let metadata = self.resolve(path, None).await?;
        let data_path = self.data_path(path);

        if path.is_root() {
            let _guard = self.locks.acquire(&path.to_string()).await?;
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.fs.remove_dir_all(&data_path).await?;
            info!("Removed store {}", self.storage_root_id);
            self.events.emit(StoreEvent::removed(path.clone(), ItemType::Folder));
            return Ok(());
        }

        {
            let _guard = self.locks.acquire(&path.to_string()).await?;
            let result = if metadata.item_type.is_container() {
                self.fs.remove_dir_all(&data_path).await
            } else {
                self.fs.delete(&data_path).await
            };
            match result {
                Ok(()) => {}
                Err(FsError::NotFound(_)) => return Err(StoreError::NotFound(path.to_string())),
                Err(e) => return Err(e.into()),
            }
            let mut tombstone = metadata;
            tombstone.local = LocalMetadata {
                hash: None,
                deleted: true,
            };
            self.write_metadata(path, &tombstone).await?;
        }

        self.invalidate_ancestors(path).await?;
        debug!("Deleted {}", path);
        self.events
            .emit(StoreEvent::removed(path.clone(), Self::type_of(path)));
        Ok(())
    }

    async fn update_local_metadata_at_path(
        &self,
        path: &SyncablePath,
        patch: LocalMetadataPatch,
    ) -> Result<()> {
        self.resolve(path, None).await?;
        let invalidating = matches!(patch.hash, Some(None));
        {
            let _guard = self.locks.acquire(&path.to_string()).await?;
            let mut metadata = self
                .read_metadata(path)
                .await?
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            if let Some(hash) = patch.hash {
                metadata.local.hash = hash;
            }
            self.write_metadata(path, &metadata).await?;
        }
        if invalidating {
            self.invalidate_ancestors(path).await?;
        }
        Ok(())
    }

    async fn get_hash_at_path(&self, path: &SyncablePath) -> Result<ContentHash> {
        let metadata = self.resolve(path, None).await?;
        self.compute_hash(path, metadata).await
    }

    async fn sweep_deleted_in_path(&self, path: &SyncablePath) -> Result<Vec<SyncableId>> {
        self.resolve(path, Some(CONTAINER_TYPES)).await?;
        let mut swept = Vec::new();
        for (id, metadata) in self.read_children(path).await? {
            if !metadata.is_deleted() {
                continue;
            }
            let child = path.child(id.clone());
            let _guard = self.locks.acquire(&child.to_string()).await?;
            match self.fs.delete(&self.metadata_path(&child)).await {
                Ok(()) | Err(FsError::NotFound(_)) => swept.push(id),
                Err(e) => return Err(e.into()),
            }
        }
        if !swept.is_empty() {
            debug!("Swept {} tombstones in {}", swept.len(), path);
        }
        Ok(swept)
    }
}
