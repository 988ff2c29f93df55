//! Hash-tree walk driving pull and push between a local backing and a remote.
//!
//! Both directions proceed breadth-first, one level per round trip: compare
//! the hash of a path on both sides, and only descend into children whose
//! hashes differ. A failure at one path is recorded in the [`SyncReport`] and
//! does not stop its siblings; the next cycle retries it.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backing::{ItemAccessor, StorageBacking};
use crate::error::{ErrorKind, Result, StoreError};
use crate::hash::ContentHash;
use crate::id::{ItemType, SyncablePath};
use crate::metadata::Metadata;
use crate::notifier::ChangeNotification;

use super::messages::{PullRequest, PullResponse, PushOutcome, PushRequest};
use super::remote::Remote;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub path: SyncablePath,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one pull, push or sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Items created or updated locally.
    pub pulled: usize,
    /// Items sent to the remote.
    pub pushed: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: SyncReport) {
        self.pulled += other.pulled;
        self.pushed += other.pushed;
        self.failures.extend(other.failures);
    }

    fn record(&mut self, path: &SyncablePath, error: StoreError) {
        warn!("Sync failed at {}: {}", path, error);
        self.failures.push(SyncFailure {
            path: path.clone(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

pub struct Synchronizer {
    local: Arc<dyn StorageBacking>,
    remote: Arc<dyn Remote>,
    remote_id: Option<String>,
}

impl Synchronizer {
    pub fn new(local: Arc<dyn StorageBacking>, remote: Arc<dyn Remote>) -> Self {
        Self {
            local,
            remote,
            remote_id: None,
        }
    }

    /// Identify this replica in every request.
    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    fn pull_request(&self, path: &SyncablePath, hash: Option<ContentHash>) -> PullRequest {
        PullRequest {
            remote_id: self.remote_id.clone(),
            ..PullRequest::new(path.clone(), hash)
        }
    }

    /// The local hash of `path`, or `None` if the item is absent.
    /// Locally deleted items fail with `Deleted`.
    async fn local_hash(&self, path: &SyncablePath) -> Result<Option<ContentHash>> {
        match self.local.get_hash_at_path(path).await {
            Ok(hash) => Ok(Some(hash)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bring the subtree at `path` up to date with the remote.
    ///
    /// Local-only children are left alone.
    pub async fn pull(&self, path: &SyncablePath) -> SyncReport {
        let mut report = SyncReport::default();
        let mut queue = VecDeque::from([path.clone()]);
        while let Some(path) = queue.pop_front() {
            match self.pull_one(&path, &mut report).await {
                Ok(children) => queue.extend(children),
                Err(e) => report.record(&path, e),
            }
        }
        info!(
            "Pulled {}: {} updated, {} failed",
            path,
            report.pulled,
            report.failures.len()
        );
        report
    }

    /// Pull a single item, returning the children that still differ.
    async fn pull_one(
        &self,
        path: &SyncablePath,
        report: &mut SyncReport,
    ) -> Result<Vec<SyncablePath>> {
        let local_hash = match self.local_hash(path).await {
            Ok(hash) => hash,
            Err(StoreError::Deleted(_)) => {
                debug!("Pull {}: deleted locally, skipping", path);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let exists = local_hash.is_some();

        let response = self
            .remote
            .pull(self.pull_request(path, local_hash.clone()))
            .await?;
        match response {
            PullResponse::InSync { .. } => Ok(Vec::new()),
            PullResponse::Container {
                item_type,
                metadata,
                hashes_by_id,
            } => {
                if !exists {
                    let created = match item_type {
                        ItemType::Bundle => self.local.create_bundle_with_path(path, metadata).await,
                        _ => self.local.create_folder_with_path(path, metadata).await,
                    };
                    match created {
                        Ok(_) => report.pulled += 1,
                        Err(StoreError::Conflict(_)) => {}
                        Err(e) => return Err(e),
                    }
                }

                let mut differing = Vec::new();
                for (id, remote_hash) in hashes_by_id {
                    let child = path.child(id);
                    match self.local_hash(&child).await {
                        Ok(Some(hash)) if hash == remote_hash => {}
                        Ok(_) => differing.push(child),
                        Err(StoreError::Deleted(_)) => {
                            debug!("Pull {}: deleted locally, skipping", child);
                        }
                        Err(e) => report.record(&child, e),
                    }
                }
                Ok(differing)
            }
            PullResponse::File { metadata, data } => {
                let (metadata, data) = match data {
                    Some(data) => (metadata, data),
                    None => self.fetch_file(path, local_hash).await?,
                };
                if exists {
                    self.local
                        .update_binary_file_at_path(path, data, metadata)
                        .await?;
                } else {
                    self.local
                        .create_binary_file_with_path(path, data, metadata)
                        .await?;
                }
                report.pulled += 1;
                Ok(Vec::new())
            }
        }
    }

    /// Follow-up pull for a file's content.
    async fn fetch_file(
        &self,
        path: &SyncablePath,
        local_hash: Option<ContentHash>,
    ) -> Result<(Metadata, Vec<u8>)> {
        let request = self.pull_request(path, local_hash).with_data();
        match self.remote.pull(request).await? {
            PullResponse::File {
                metadata,
                data: Some(data),
            } => Ok((metadata, data)),
            other => Err(StoreError::format(
                path.to_string(),
                format!("expected file content, got {:?}", other.item_type()),
            )),
        }
    }

    /// Send local content under `path` that the remote lacks or has different.
    pub async fn push(&self, path: &SyncablePath) -> SyncReport {
        let mut report = SyncReport::default();
        let mut queue = VecDeque::from([path.clone()]);
        while let Some(path) = queue.pop_front() {
            match self.push_one(&path, &mut report).await {
                Ok(children) => queue.extend(children),
                Err(e) => report.record(&path, e),
            }
        }
        info!(
            "Pushed {}: {} sent, {} failed",
            path,
            report.pushed,
            report.failures.len()
        );
        report
    }

    async fn push_one(
        &self,
        path: &SyncablePath,
        report: &mut SyncReport,
    ) -> Result<Vec<SyncablePath>> {
        let item = self.local.get_at_path(path, None).await?;
        let hash = self.local.get_hash_at_path(path).await?;

        let remote_children = match self
            .remote
            .pull(self.pull_request(path, Some(hash)))
            .await
        {
            Ok(PullResponse::InSync { .. }) => return Ok(Vec::new()),
            Ok(PullResponse::Container { hashes_by_id, .. }) => Some(hashes_by_id),
            Ok(PullResponse::File { .. }) => None,
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let container = match item {
            ItemAccessor::File(file) => {
                let outcome = self
                    .remote
                    .push(PushRequest {
                        remote_id: self.remote_id.clone(),
                        path: path.clone(),
                        item_type: ItemType::File,
                        metadata: file.metadata,
                        data: Some(file.data),
                    })
                    .await?;
                if outcome == PushOutcome::Stored {
                    report.pushed += 1;
                }
                return Ok(Vec::new());
            }
            ItemAccessor::Folder(container) | ItemAccessor::Bundle(container) => container,
        };

        if remote_children.is_none() {
            let outcome = self
                .remote
                .push(PushRequest {
                    remote_id: self.remote_id.clone(),
                    path: path.clone(),
                    item_type: container.metadata.item_type,
                    metadata: container.metadata,
                    data: None,
                })
                .await?;
            if outcome == PushOutcome::Ignored {
                debug!("Push {}: deleted on the remote, not descending", path);
                return Ok(Vec::new());
            }
            report.pushed += 1;
        }

        let mut differing = Vec::new();
        for id in self.local.get_ids_in_path(path, None).await? {
            let child = path.child(id.clone());
            let remote_hash = remote_children.as_ref().and_then(|hashes| hashes.get(&id));
            let Some(remote_hash) = remote_hash else {
                differing.push(child);
                continue;
            };
            match self.local.get_hash_at_path(&child).await {
                Ok(hash) if &hash == remote_hash => {}
                Ok(_) => differing.push(child),
                // Removed since listing
                Err(e) if e.is_not_found() => {}
                Err(e) => report.record(&child, e),
            }
        }
        Ok(differing)
    }

    /// Pull, then push.
    pub async fn sync(&self, path: &SyncablePath) -> SyncReport {
        let mut report = self.pull(path).await;
        report.merge(self.push(path).await);
        report
    }

    /// React to a change announced by the remote.
    pub async fn handle_notification(&self, notification: &ChangeNotification) -> SyncReport {
        let path = &notification.path;
        if path.storage_root_id() != self.local.storage_root_id() {
            debug!("Ignoring notification for foreign store {}", path);
            return SyncReport::default();
        }
        match self.local.get_hash_at_path(path).await {
            Ok(hash) if hash == notification.hash => {
                debug!("Notification for {} already applied", path);
                SyncReport::default()
            }
            _ => self.pull(path).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::fs::InMemoryFs;
    use crate::id::SyncableId;
    use crate::registry::StoreRegistry;
    use crate::sync::{LocalRemote, SyncServer};
    use crate::testkit::{memory_store, unsigned};

    struct Pair {
        local: Arc<dyn StorageBacking>,
        remote: Arc<dyn StorageBacking>,
        sync: Synchronizer,
    }

    async fn pair() -> Pair {
        let local: Arc<dyn StorageBacking> = memory_store("store").await.unwrap();
        let remote: Arc<dyn StorageBacking> = memory_store("store").await.unwrap();
        let registry = StoreRegistry::for_filesystem(Arc::new(InMemoryFs::new()), StoreConfig::default());
        registry.insert(remote.clone());
        let server = Arc::new(SyncServer::new(Arc::new(registry)));
        let sync = Synchronizer::new(local.clone(), Arc::new(LocalRemote::encoded(server)))
            .with_remote_id("laptop");
        Pair {
            local,
            remote,
            sync,
        }
    }

    fn child(parent: &SyncablePath, item_type: ItemType, name: &str) -> SyncablePath {
        parent.child(SyncableId::plain(item_type, name).unwrap())
    }

    async fn populate(store: &dyn StorageBacking) -> SyncablePath {
        let root = SyncablePath::root("store").unwrap();
        let folder = child(&root, ItemType::Folder, "F");
        let bundle = child(&folder, ItemType::Bundle, "B");
        store
            .create_folder_with_path(&folder, unsigned(ItemType::Folder))
            .await
            .unwrap();
        store
            .create_bundle_with_path(&bundle, unsigned(ItemType::Bundle))
            .await
            .unwrap();
        for (parent, name) in [(&folder, "a"), (&bundle, "b")] {
            store
                .create_binary_file_with_path(
                    &child(parent, ItemType::File, name),
                    name.as_bytes().to_vec(),
                    unsigned(ItemType::File),
                )
                .await
                .unwrap();
        }
        root
    }

    async fn root_hash(store: &dyn StorageBacking) -> ContentHash {
        store
            .get_hash_at_path(&SyncablePath::root("store").unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pull_copies_remote_tree() {
        let p = pair().await;
        let root = populate(p.remote.as_ref()).await;

        let report = p.sync.pull(&root).await;
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(report.pulled, 4);
        assert_eq!(root_hash(p.local.as_ref()).await, root_hash(p.remote.as_ref()).await);

        let again = p.sync.pull(&root).await;
        assert_eq!(again, SyncReport::default());
    }

    #[tokio::test]
    async fn test_push_copies_local_tree() {
        let p = pair().await;
        let root = populate(p.local.as_ref()).await;

        let report = p.sync.push(&root).await;
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(report.pushed, 4);
        assert_eq!(root_hash(p.local.as_ref()).await, root_hash(p.remote.as_ref()).await);

        assert_eq!(p.sync.push(&root).await.pushed, 0);
    }

    #[tokio::test]
    async fn test_pull_updates_changed_file_only() {
        let p = pair().await;
        let root = populate(p.remote.as_ref()).await;
        p.sync.pull(&root).await;

        let a = child(&child(&root, ItemType::Folder, "F"), ItemType::File, "a");
        p.remote
            .update_binary_file_at_path(&a, b"changed".to_vec(), unsigned(ItemType::File))
            .await
            .unwrap();

        let report = p.sync.pull(&root).await;
        assert_eq!(report.pulled, 1);
        let file = p.local.get_at_path(&a, None).await.unwrap().into_file().unwrap();
        assert_eq!(file.data, b"changed");
    }

    #[tokio::test]
    async fn test_pull_keeps_local_only_children() {
        let p = pair().await;
        let root = populate(p.remote.as_ref()).await;
        let extra = child(&root, ItemType::File, "local-only");
        p.local
            .create_binary_file_with_path(&extra, b"mine".to_vec(), unsigned(ItemType::File))
            .await
            .unwrap();

        let report = p.sync.pull(&root).await;
        assert!(report.is_complete());
        assert!(p.local.exists_at_path(&extra).await.unwrap());
        assert_ne!(root_hash(p.local.as_ref()).await, root_hash(p.remote.as_ref()).await);

        let report = p.sync.sync(&root).await;
        assert!(report.is_complete());
        assert_eq!(report.pushed, 1);
        assert_eq!(root_hash(p.local.as_ref()).await, root_hash(p.remote.as_ref()).await);
    }

    #[tokio::test]
    async fn test_push_stops_at_subtree_deleted_on_remote() {
        let p = pair().await;
        let root = populate(p.local.as_ref()).await;
        let folder = child(&root, ItemType::Folder, "F");
        assert_eq!(p.sync.push(&root).await.pushed, 4);

        p.remote.delete_at_path(&folder).await.unwrap();
        for _ in 0..2 {
            let report = p.sync.push(&root).await;
            assert!(report.is_complete(), "{:?}", report.failures);
            assert_eq!(report.pushed, 0);
        }
        assert!(!p.remote.exists_at_path(&folder).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_tombstone_is_not_resurrected() {
        let p = pair().await;
        let root = populate(p.remote.as_ref()).await;
        let folder = child(&root, ItemType::Folder, "F");
        let g = child(&root, ItemType::Folder, "G");
        p.remote
            .create_folder_with_path(&g, unsigned(ItemType::Folder))
            .await
            .unwrap();
        p.local
            .create_folder_with_path(&folder, unsigned(ItemType::Folder))
            .await
            .unwrap();
        p.local.delete_at_path(&folder).await.unwrap();

        let report = p.sync.pull(&root).await;
        assert!(report.is_complete());
        assert!(p.local.exists_at_path(&g).await.unwrap());
        assert!(!p.local.exists_at_path(&folder).await.unwrap());
    }

    /// Fails every pull of one path.
    struct FailingAt {
        inner: Arc<dyn Remote>,
        path: SyncablePath,
    }

    #[async_trait::async_trait]
    impl Remote for FailingAt {
        async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
            if request.path == self.path {
                return Err(StoreError::Io("connection reset".into()));
            }
            self.inner.pull(request).await
        }

        async fn push(&self, request: PushRequest) -> Result<PushOutcome> {
            self.inner.push(request).await
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let p = pair().await;
        let root = populate(p.remote.as_ref()).await;
        let g = child(&root, ItemType::Folder, "G");
        p.remote
            .create_folder_with_path(&g, unsigned(ItemType::Folder))
            .await
            .unwrap();

        let folder = child(&root, ItemType::Folder, "F");
        let registry = StoreRegistry::for_filesystem(Arc::new(InMemoryFs::new()), StoreConfig::default());
        registry.insert(p.remote.clone());
        let inner: Arc<dyn Remote> = Arc::new(LocalRemote::new(Arc::new(SyncServer::new(Arc::new(registry)))));
        let sync = Synchronizer::new(
            p.local.clone(),
            Arc::new(FailingAt {
                inner,
                path: folder.clone(),
            }),
        );

        let report = sync.pull(&root).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, folder);
        assert_eq!(report.failures[0].kind, ErrorKind::Io);
        assert!(p.local.exists_at_path(&g).await.unwrap());

        // The next cycle picks up what failed.
        let report = p.sync.pull(&root).await;
        assert!(report.is_complete());
        assert_eq!(root_hash(p.local.as_ref()).await, root_hash(p.remote.as_ref()).await);
    }

    #[tokio::test]
    async fn test_missing_remote_subtree_is_recorded() {
        let p = pair().await;
        let root = SyncablePath::root("store").unwrap();
        let report = p.sync.pull(&child(&root, ItemType::Folder, "nope")).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_notification_triggers_pull_unless_applied() {
        let p = pair().await;
        let root = populate(p.remote.as_ref()).await;
        let folder = child(&root, ItemType::Folder, "F");
        p.sync.pull(&root).await;

        let current = p.remote.get_hash_at_path(&folder).await.unwrap();
        let applied = ChangeNotification::new(folder.clone(), current);
        assert_eq!(p.sync.handle_notification(&applied).await, SyncReport::default());

        let c = child(&folder, ItemType::File, "c");
        p.remote
            .create_binary_file_with_path(&c, b"c".to_vec(), unsigned(ItemType::File))
            .await
            .unwrap();
        let fresh = ChangeNotification::new(folder.clone(), p.remote.get_hash_at_path(&folder).await.unwrap());
        let report = p.sync.handle_notification(&fresh).await;
        assert_eq!(report.pulled, 1);
        assert!(p.local.exists_at_path(&c).await.unwrap());

        let foreign = ChangeNotification::new(
            SyncablePath::root("other").unwrap(),
            ContentHash::of_bytes(b"x"),
        );
        assert_eq!(p.sync.handle_notification(&foreign).await, SyncReport::default());
    }
}
