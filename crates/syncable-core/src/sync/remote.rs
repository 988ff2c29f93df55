//! The calling side's view of a replica it synchronizes with.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, StoreError};

use super::messages::{PullRequest, PullResponse, PushOutcome, PushRequest, SyncMessage, SyncReply};
use super::server::SyncServer;

/// A replica that answers pull and push requests.
///
/// Implementations carry requests over whatever transport connects the
/// replicas. Both operations are safe to abandon and retry.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse>;

    async fn push(&self, request: PushRequest) -> Result<PushOutcome>;
}

/// A [`SyncServer`] in the same process.
pub struct LocalRemote {
    server: Arc<SyncServer>,
    encode: bool,
}

impl LocalRemote {
    /// Call the server directly.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            encode: false,
        }
    }

    /// Send every request and reply through the byte codec, as a network
    /// transport would.
    pub fn encoded(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            encode: true,
        }
    }

    async fn round_trip(&self, message: SyncMessage) -> Result<SyncReply> {
        let reply = self.server.handle_message(&message.to_bytes()?).await;
        SyncReply::from_bytes(&reply)
    }
}

fn unexpected(reply: SyncReply) -> StoreError {
    StoreError::format("sync reply", format!("unexpected reply {:?}", reply))
}

#[async_trait]
impl Remote for LocalRemote {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        if !self.encode {
            return self.server.pull(request).await;
        }
        match self.round_trip(SyncMessage::Pull(request)).await? {
            SyncReply::Pulled(response) => Ok(response),
            SyncReply::Failed { kind, message } => Err(StoreError::from_kind(kind, message)),
            other => Err(unexpected(other)),
        }
    }

    async fn push(&self, request: PushRequest) -> Result<PushOutcome> {
        if !self.encode {
            return self.server.push(request).await;
        }
        match self.round_trip(SyncMessage::Push(request)).await? {
            SyncReply::Pushed(outcome) => Ok(outcome),
            SyncReply::Failed { kind, message } => Err(StoreError::from_kind(kind, message)),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::ErrorKind;
    use crate::fs::InMemoryFs;
    use crate::id::{ItemType, SyncablePath};
    use crate::registry::StoreRegistry;
    use crate::testkit::unsigned;

    fn server() -> Arc<SyncServer> {
        let registry = StoreRegistry::for_filesystem(Arc::new(InMemoryFs::new()), StoreConfig::default());
        Arc::new(SyncServer::new(Arc::new(registry)))
    }

    #[tokio::test]
    async fn test_encoded_remote_matches_direct_calls() {
        let server = server();
        let direct = LocalRemote::new(server.clone());
        let encoded = LocalRemote::encoded(server);
        let root = SyncablePath::root("store").unwrap();

        encoded
            .push(PushRequest {
                remote_id: Some("laptop".into()),
                path: root.clone(),
                item_type: ItemType::Folder,
                metadata: unsigned(ItemType::Folder),
                data: None,
            })
            .await
            .unwrap();

        let a = direct.pull(PullRequest::new(root.clone(), None)).await.unwrap();
        let b = encoded.pull(PullRequest::new(root, None)).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_encoded_remote_rebuilds_error_kind() {
        let encoded = LocalRemote::encoded(server());
        let root = SyncablePath::root("store").unwrap();
        let err = encoded.pull(PullRequest::new(root, None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
