//! Pull/push request and reply types, and their bincode framing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, StoreError};
use crate::hash::ContentHash;
use crate::id::{ItemType, SyncableId, SyncablePath};
use crate::metadata::Metadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Identity of the asking replica, if it has one.
    pub remote_id: Option<String>,
    pub path: SyncablePath,
    /// The caller's last known hash for `path`.
    pub hash: Option<ContentHash>,
    /// For files: include the content in an out-of-sync reply.
    pub send_data: bool,
}

impl PullRequest {
    pub fn new(path: SyncablePath, hash: Option<ContentHash>) -> Self {
        Self {
            remote_id: None,
            path,
            hash,
            send_data: false,
        }
    }

    pub fn with_data(mut self) -> Self {
        self.send_data = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub remote_id: Option<String>,
    pub path: SyncablePath,
    pub item_type: ItemType,
    pub metadata: Metadata,
    /// File content; `None` for folders and bundles.
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PullResponse {
    /// The caller's hash matches.
    InSync { item_type: ItemType },
    /// A folder or bundle changed: its metadata and the current hash of every
    /// live child. Children's content is never included.
    Container {
        item_type: ItemType,
        metadata: Metadata,
        hashes_by_id: BTreeMap<SyncableId, ContentHash>,
    },
    /// A file changed. `data` is present only if it was asked for.
    File {
        metadata: Metadata,
        data: Option<Vec<u8>>,
    },
}

impl PullResponse {
    pub fn item_type(&self) -> ItemType {
        match self {
            PullResponse::InSync { item_type } | PullResponse::Container { item_type, .. } => {
                *item_type
            }
            PullResponse::File { .. } => ItemType::File,
        }
    }

    pub fn is_out_of_sync(&self) -> bool {
        !matches!(self, PullResponse::InSync { .. })
    }
}

/// What the receiving replica did with a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushOutcome {
    /// The item now exists as pushed.
    Stored,
    /// The receiver deleted the item (or an ancestor) and drops the content.
    /// Nothing below it needs to be sent.
    Ignored,
}

/// A request as it travels to a [`SyncServer`](super::SyncServer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    Pull(PullRequest),
    Push(PushRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncReply {
    Pulled(PullResponse),
    Pushed(PushOutcome),
    Failed { kind: ErrorKind, message: String },
}

impl SyncReply {
    pub fn failed(error: &StoreError) -> Self {
        SyncReply::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl SyncMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::format("sync message", e))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| StoreError::format("sync message", e))
    }
}

impl SyncReply {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::format("sync reply", e))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| StoreError::format("sync reply", e))
    }
}
