//! The answering side of pull/push.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backing::{ItemAccessor, StorageBacking};
use crate::crypto::{CryptoService, verify_provenance};
use crate::error::{ErrorKind, Result, StoreError};
use crate::hash::ContentHash;
use crate::id::{ItemType, SyncablePath};
use crate::metadata::LocalMetadata;
use crate::registry::StoreRegistry;

use super::messages::{PullRequest, PullResponse, PushOutcome, PushRequest, SyncMessage, SyncReply};

/// Serves pull and push requests against the stores of a registry.
///
/// Every request is handled on its own; there is no per-remote session state.
pub struct SyncServer {
    registry: Arc<StoreRegistry>,
    crypto: Option<Arc<dyn CryptoService>>,
}

impl SyncServer {
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        Self {
            registry,
            crypto: None,
        }
    }

    /// Verify the provenance of every pushed item with `crypto`.
    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoService>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    fn store(&self, path: &SyncablePath) -> Result<Arc<dyn StorageBacking>> {
        self.registry.get_or_open(path.storage_root_id())
    }

    pub async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        let store = self.store(&request.path)?;
        let path = &request.path;
        let item = store.get_at_path(path, None).await.map_err(|e| match e {
            // Callers never need to tell a tombstone from a missing item.
            StoreError::Deleted(p) => StoreError::NotFound(p),
            other => other,
        })?;

        let hash = store.get_hash_at_path(path).await?;
        if request.hash.as_ref() == Some(&hash) {
            debug!("Pull {}: in sync", path);
            return Ok(PullResponse::InSync {
                item_type: item.item_type(),
            });
        }

        // Report the hash just computed, whatever the side-file had cached.
        let mut metadata = item.metadata().clone();
        metadata.local = LocalMetadata {
            hash: Some(hash),
            deleted: false,
        };

        match item {
            ItemAccessor::Folder(_) | ItemAccessor::Bundle(_) => {
                let item_type = metadata.item_type;
                let children = store.get_metadata_by_id_in_path(path, None).await?;
                let mut hashes_by_id = BTreeMap::new();
                for id in children.into_keys() {
                    match store.get_hash_at_path(&path.child(id.clone())).await {
                        Ok(child_hash) => {
                            hashes_by_id.insert(id, child_hash);
                        }
                        // Removed while we were listing
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    }
                }
                debug!("Pull {}: {} children", path, hashes_by_id.len());
                Ok(PullResponse::Container {
                    item_type,
                    metadata,
                    hashes_by_id,
                })
            }
            ItemAccessor::File(file) => Ok(PullResponse::File {
                metadata,
                data: request.send_data.then_some(file.data),
            }),
        }
    }

    /// Idempotently assert the existence of the pushed item.
    ///
    /// A tombstone at (or above) the target means this replica chose to drop
    /// the content; that succeeds as [`PushOutcome::Ignored`].
    pub async fn push(&self, request: PushRequest) -> Result<PushOutcome> {
        let store = self.store(&request.path)?;
        let path = request.path.clone();

        if let Some(crypto) = &self.crypto {
            verify_provenance(crypto.as_ref(), &path, &request.metadata, request.data.as_deref())
                .await?;
        }

        if path.is_root() {
            self.push_root(store.as_ref(), request).await?;
            return Ok(PushOutcome::Stored);
        }

        let item_type = request.item_type;
        let result = match item_type {
            ItemType::Folder | ItemType::Bundle => push_container(store.as_ref(), request).await,
            ItemType::File => push_file(store.as_ref(), request).await,
        };
        match result {
            Ok(()) => Ok(PushOutcome::Stored),
            Err(StoreError::Deleted(at)) => {
                debug!("Push {}: {} is deleted here, ignoring", path, at);
                Ok(PushOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    async fn push_root(&self, store: &dyn StorageBacking, request: PushRequest) -> Result<()> {
        let path = &request.path;
        if store.exists_at_path(path).await? {
            return Ok(());
        }
        if let Some(crypto) = &self.crypto {
            let creator = &request.metadata.provenance.creator;
            if crypto.public_keys(creator).await?.is_none() {
                return Err(StoreError::Untrusted(format!(
                    "{}: no public keys for creator {}",
                    path, creator
                )));
            }
        }
        match store.create_folder_with_path(path, request.metadata).await {
            Ok(_) => {
                info!("Store {} created by push", store.storage_root_id());
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Decode `message`, dispatch it and encode the reply.
    ///
    /// Always answers; failures travel back as [`SyncReply::Failed`].
    pub async fn handle_message(&self, message: &[u8]) -> Vec<u8> {
        let reply = match SyncMessage::from_bytes(message) {
            Ok(SyncMessage::Pull(request)) => match self.pull(request).await {
                Ok(response) => SyncReply::Pulled(response),
                Err(e) => SyncReply::failed(&e),
            },
            Ok(SyncMessage::Push(request)) => match self.push(request).await {
                Ok(outcome) => SyncReply::Pushed(outcome),
                Err(e) => SyncReply::failed(&e),
            },
            Err(e) => {
                warn!("Rejecting undecodable sync message: {}", e);
                SyncReply::failed(&e)
            }
        };
        reply.to_bytes().unwrap_or_else(|e| {
            // A reply that fails to encode is reported as a format failure,
            // which always encodes.
            SyncReply::Failed {
                kind: ErrorKind::Format,
                message: e.to_string(),
            }
            .to_bytes()
            .unwrap_or_default()
        })
    }
}

async fn push_container(store: &dyn StorageBacking, request: PushRequest) -> Result<()> {
    let path = &request.path;
    let item_type = request.item_type;
    let created = match item_type {
        ItemType::Folder => store.create_folder_with_path(path, request.metadata).await,
        _ => store.create_bundle_with_path(path, request.metadata).await,
    };
    match created {
        Ok(_) => {
            debug!("Push {}: created {}", path, item_type);
            Ok(())
        }
        // Already there: only the type has to agree.
        Err(StoreError::Conflict(_)) => store
            .get_at_path(path, Some(&[item_type]))
            .await
            .map(|_| ()),
        Err(e) => Err(e),
    }
}

async fn push_file(store: &dyn StorageBacking, request: PushRequest) -> Result<()> {
    let path = &request.path;
    let data = request
        .data
        .ok_or_else(|| StoreError::format(path.to_string(), "file push without data"))?;

    match store.get_at_path(path, Some(&[ItemType::File])).await {
        Ok(ItemAccessor::File(existing)) => {
            if existing.hash() == ContentHash::of_bytes(&data) {
                debug!("Push {}: unchanged", path);
                return Ok(());
            }
            store
                .update_binary_file_at_path(path, data, request.metadata)
                .await?;
            debug!("Push {}: updated", path);
            Ok(())
        }
        Ok(other) => Err(StoreError::wrong_type(path, other.item_type(), &[ItemType::File])),
        Err(StoreError::NotFound(_)) => {
            match store
                .create_binary_file_with_path(path, data, request.metadata)
                .await
            {
                Ok(_) => {
                    debug!("Push {}: created file", path);
                    Ok(())
                }
                // Created concurrently by another push; the next cycle reconciles content.
                Err(StoreError::Conflict(_)) => Ok(()),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::crypto::sign_metadata;
    use crate::fs::InMemoryFs;
    use crate::id::SyncableId;
    use crate::metadata::Metadata;
    use crate::testkit::{InsecureTestCrypto, unsigned};

    fn server() -> SyncServer {
        let registry = StoreRegistry::for_filesystem(Arc::new(InMemoryFs::new()), StoreConfig::default());
        SyncServer::new(Arc::new(registry))
    }

    fn push(path: &SyncablePath, item_type: ItemType, data: Option<&[u8]>) -> PushRequest {
        PushRequest {
            remote_id: None,
            path: path.clone(),
            item_type,
            metadata: unsigned(item_type),
            data: data.map(<[u8]>::to_vec),
        }
    }

    fn child(parent: &SyncablePath, item_type: ItemType, name: &str) -> SyncablePath {
        parent.child(SyncableId::plain(item_type, name).unwrap())
    }

    #[tokio::test]
    async fn test_pull_missing_store_is_not_found() {
        let server = server();
        let root = SyncablePath::root("store").unwrap();
        let err = server.pull(PullRequest::new(root, None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_push_then_pull_file() {
        let server = server();
        let root = SyncablePath::root("store").unwrap();
        let folder = child(&root, ItemType::Folder, "F");
        let file = child(&folder, ItemType::File, "a");

        server.push(push(&root, ItemType::Folder, None)).await.unwrap();
        server.push(push(&folder, ItemType::Folder, None)).await.unwrap();
        server.push(push(&file, ItemType::File, Some(b"hello"))).await.unwrap();

        let without = server.pull(PullRequest::new(file.clone(), None)).await.unwrap();
        assert!(matches!(without, PullResponse::File { data: None, .. }));

        let with = server
            .pull(PullRequest::new(file.clone(), None).with_data())
            .await
            .unwrap();
        match with {
            PullResponse::File { data, metadata } => {
                assert_eq!(data.as_deref(), Some(&b"hello"[..]));
                assert_eq!(metadata.item_type, ItemType::File);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pull_with_current_hash_is_in_sync() {
        let server = server();
        let root = SyncablePath::root("store").unwrap();
        server.push(push(&root, ItemType::Folder, None)).await.unwrap();

        let first = server.pull(PullRequest::new(root.clone(), None)).await.unwrap();
        assert!(first.is_out_of_sync());

        let store = server.registry().get_or_open("store").unwrap();
        let hash = store.get_hash_at_path(&root).await.unwrap();
        let second = server.pull(PullRequest::new(root, Some(hash))).await.unwrap();
        assert_eq!(second, PullResponse::InSync { item_type: ItemType::Folder });
    }

    #[tokio::test]
    async fn test_pushes_are_idempotent() {
        let server = server();
        let root = SyncablePath::root("store").unwrap();
        let bundle = child(&root, ItemType::Bundle, "B");
        let file = child(&bundle, ItemType::File, "a");

        for _ in 0..2 {
            server.push(push(&root, ItemType::Folder, None)).await.unwrap();
            server.push(push(&bundle, ItemType::Bundle, None)).await.unwrap();
            server.push(push(&file, ItemType::File, Some(b"x"))).await.unwrap();
        }

        let store = server.registry().get_or_open("store").unwrap();
        let before = store.get_hash_at_path(&root).await.unwrap();
        server.push(push(&file, ItemType::File, Some(b"x"))).await.unwrap();
        assert_eq!(store.get_hash_at_path(&root).await.unwrap(), before);

        server.push(push(&file, ItemType::File, Some(b"y"))).await.unwrap();
        assert_ne!(store.get_hash_at_path(&root).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_push_into_deleted_subtree_is_ignored() {
        let server = server();
        let root = SyncablePath::root("store").unwrap();
        let folder = child(&root, ItemType::Folder, "F");
        server.push(push(&root, ItemType::Folder, None)).await.unwrap();
        server.push(push(&folder, ItemType::Folder, None)).await.unwrap();

        let store = server.registry().get_or_open("store").unwrap();
        store.delete_at_path(&folder).await.unwrap();

        assert_eq!(
            server.push(push(&folder, ItemType::Folder, None)).await.unwrap(),
            PushOutcome::Ignored
        );
        assert_eq!(
            server
                .push(push(&child(&folder, ItemType::File, "a"), ItemType::File, Some(b"x")))
                .await
                .unwrap(),
            PushOutcome::Ignored
        );
        assert!(!store.exists_at_path(&folder).await.unwrap());

        let err = server.pull(PullRequest::new(folder, None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_push_with_mismatched_type_fails() {
        let server = server();
        let root = SyncablePath::root("store").unwrap();
        server.push(push(&root, ItemType::Folder, None)).await.unwrap();

        let folder = child(&root, ItemType::Folder, "F");
        let mut request = push(&folder, ItemType::Folder, None);
        request.metadata = unsigned(ItemType::Bundle);
        let err = server.push(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongType);

        let file = child(&root, ItemType::File, "a");
        let err = server.push(push(&file, ItemType::File, None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[tokio::test]
    async fn test_verifying_server_rejects_unsigned_and_unknown_creators() {
        let alice = InsecureTestCrypto::new("alice");
        let verifier = Arc::new(InsecureTestCrypto::new("server"));
        let server = server().with_crypto(verifier.clone());
        let root = SyncablePath::root("store").unwrap();

        let err = server.push(push(&root, ItemType::Folder, None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Untrusted);

        let signed = sign_metadata(&alice, &root, unsigned(ItemType::Folder), None)
            .await
            .unwrap();
        let request = PushRequest {
            metadata: signed,
            ..push(&root, ItemType::Folder, None)
        };
        let err = server.push(request.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Untrusted);

        verifier.trust(alice.public_key_set());
        server.push(request).await.unwrap();

        let file = child(&root, ItemType::File, "a");
        let metadata: Metadata = sign_metadata(&alice, &file, unsigned(ItemType::File), Some(b"x"))
            .await
            .unwrap();
        let mut request = push(&file, ItemType::File, Some(b"tampered"));
        request.metadata = metadata;
        let err = server.push(request.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Untrusted);

        request.data = Some(b"x".to_vec());
        server.push(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_message_always_replies() {
        let server = server();
        let reply = SyncReply::from_bytes(&server.handle_message(b"not bincode").await).unwrap();
        assert!(matches!(reply, SyncReply::Failed { kind: ErrorKind::Format, .. }));

        let root = SyncablePath::root("store").unwrap();
        let message = SyncMessage::Push(push(&root, ItemType::Folder, None));
        let reply = SyncReply::from_bytes(&server.handle_message(&message.to_bytes().unwrap()).await)
            .unwrap();
        assert_eq!(reply, SyncReply::Pushed(PushOutcome::Stored));

        let message = SyncMessage::Pull(PullRequest::new(child(&root, ItemType::Folder, "nope"), None));
        let reply = SyncReply::from_bytes(&server.handle_message(&message.to_bytes().unwrap()).await)
            .unwrap();
        assert!(matches!(reply, SyncReply::Failed { kind: ErrorKind::NotFound, .. }));
    }
}
