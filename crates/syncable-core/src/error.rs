//! Error taxonomy shared by every layer of the store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fs::FsError;
use crate::id::{IdError, ItemType};

/// The kind of a [`StoreError`], independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    WrongType,
    OutOfDate,
    Deleted,
    LockTimeout,
    Untrusted,
    Format,
    RetriesExhausted,
    Io,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0} already exists")]
    Conflict(String),

    #[error("Wrong type at {path}: {detail}")]
    WrongType { path: String, detail: String },

    #[error("Out of date: {0} was modified concurrently")]
    OutOfDate(String),

    #[error("Deleted: {0}")]
    Deleted(String),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Untrusted: {0}")]
    Untrusted(String),

    #[error("Format error in {context}: {message}")]
    Format { context: String, message: String },

    #[error("Gave up updating {key} after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: u32 },

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::WrongType { .. } => ErrorKind::WrongType,
            StoreError::OutOfDate(_) => ErrorKind::OutOfDate,
            StoreError::Deleted(_) => ErrorKind::Deleted,
            StoreError::LockTimeout(_) => ErrorKind::LockTimeout,
            StoreError::Untrusted(_) => ErrorKind::Untrusted,
            StoreError::Format { .. } => ErrorKind::Format,
            StoreError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            StoreError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::OutOfDate | ErrorKind::LockTimeout)
    }

    /// True for both `NotFound` and `Deleted`, for callers that do not care
    /// whether an item never existed or was removed.
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::Deleted)
    }

    pub fn wrong_type(path: impl ToString, found: ItemType, expected: &[ItemType]) -> Self {
        let expected: Vec<&str> = expected.iter().map(ItemType::as_str).collect();
        StoreError::WrongType {
            path: path.to_string(),
            detail: format!("found {}, expected {}", found, expected.join(" or ")),
        }
    }

    pub fn format(context: impl Into<String>, message: impl ToString) -> Self {
        StoreError::Format {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Rebuild an error from a kind and message received over the wire.
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotFound => StoreError::NotFound(message),
            ErrorKind::Conflict => StoreError::Conflict(message),
            ErrorKind::WrongType => StoreError::WrongType {
                path: message,
                detail: "reported by remote".to_string(),
            },
            ErrorKind::OutOfDate => StoreError::OutOfDate(message),
            ErrorKind::Deleted => StoreError::Deleted(message),
            ErrorKind::LockTimeout => StoreError::LockTimeout(message),
            ErrorKind::Untrusted => StoreError::Untrusted(message),
            ErrorKind::Format => StoreError::format("remote", message),
            ErrorKind::RetriesExhausted => StoreError::RetriesExhausted {
                key: message,
                attempts: 0,
            },
            ErrorKind::Io => StoreError::Io(message),
        }
    }
}

impl From<FsError> for StoreError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound(path) => StoreError::NotFound(path),
            FsError::AlreadyExists(path) => StoreError::Conflict(path),
            other => StoreError::Io(other.to_string()),
        }
    }
}

impl From<IdError> for StoreError {
    fn from(e: IdError) -> Self {
        StoreError::format("id", e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::format("json", e)
    }
}
