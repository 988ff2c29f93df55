//! Typed identifiers and paths addressing items in a store.
//!
//! A [`SyncableId`] names one item (folder, bundle or file) inside its parent.
//! A [`SyncablePath`] is a storage-root id plus the ordered ids leading to an item.
//!
//! Ids render as `type:token` (e.g. `folder:inbox`, `file:fi_9b1d...`) and paths
//! as `root/type:token/...`. Both parse back with [`FromStr`].

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("Invalid item type: {0}")]
    InvalidType(String),
    #[error("Invalid id token '{token}': {reason}")]
    InvalidToken { token: String, reason: &'static str },
    #[error("Invalid id format '{0}': expected type:token")]
    InvalidFormat(String),
    #[error("Invalid path '{0}'")]
    InvalidPath(String),
}

/// The three kinds of item a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    /// Access-control boundary with its own trust domain.
    Folder,
    /// Ordered sub-tree sharing its parent's trust domain.
    Bundle,
    /// Opaque binary content.
    File,
}

/// Types that can hold children.
pub const CONTAINER_TYPES: &[ItemType] = &[ItemType::Folder, ItemType::Bundle];

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Folder => "folder",
            ItemType::Bundle => "bundle",
            ItemType::File => "file",
        }
    }

    /// Whether items of this type can hold children.
    pub fn is_container(&self) -> bool {
        matches!(self, ItemType::Folder | ItemType::Bundle)
    }

    fn token_prefix(&self) -> &'static str {
        match self {
            ItemType::Folder => "fo",
            ItemType::Bundle => "bu",
            ItemType::File => "fi",
        }
    }
}

impl Display for ItemType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "folder" => Ok(ItemType::Folder),
            "bundle" => Ok(ItemType::Bundle),
            "file" => Ok(ItemType::File),
            other => Err(IdError::InvalidType(other.to_string())),
        }
    }
}

/// An immutable identifier for one item within its parent.
///
/// The token doubles as the item's file-system entry name, so it is restricted
/// to `[A-Za-z0-9._@+-]`, must not start with `.` and must not start with
/// `metadata.` (reserved for metadata side-files).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncableId {
    item_type: ItemType,
    token: String,
}

impl SyncableId {
    /// A deterministic, application-chosen id.
    pub fn plain(item_type: ItemType, name: &str) -> Result<Self, IdError> {
        validate_token(name)?;
        Ok(Self {
            item_type,
            token: name.to_string(),
        })
    }

    /// A globally unique, type-prefixed id.
    pub fn unique(item_type: ItemType) -> Self {
        Self {
            item_type,
            token: format!(
                "{}_{}",
                item_type.token_prefix(),
                uuid::Uuid::new_v4().simple()
            ),
        }
    }

    /// An id derived from a salt and a logical name.
    ///
    /// The logical name cannot be recovered from the token, which keeps the
    /// tree's structure opaque to an untrusted backing.
    pub fn salted(item_type: ItemType, salt: &[u8], name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(name.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self {
            item_type,
            token: format!("{}s_{}", item_type.token_prefix(), &digest[..32]),
        }
    }

    /// Rebuild an id from a stored token and its recorded type.
    pub fn from_parts(item_type: ItemType, token: &str) -> Result<Self, IdError> {
        Self::plain(item_type, token)
    }

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    /// The file-system-safe token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

fn validate_token(token: &str) -> Result<(), IdError> {
    let invalid = |reason| IdError::InvalidToken {
        token: token.to_string(),
        reason,
    };
    if token.is_empty() {
        return Err(invalid("empty"));
    }
    if token.starts_with('.') {
        return Err(invalid("starts with '.'"));
    }
    if token == "metadata" || token.starts_with("metadata.") {
        return Err(invalid("reserved name"));
    }
    if !token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@' | '+'))
    {
        return Err(invalid("unsupported character"));
    }
    Ok(())
}

impl Display for SyncableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.item_type, self.token)
    }
}

impl FromStr for SyncableId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (item_type, token) = s
            .split_once(':')
            .ok_or_else(|| IdError::InvalidFormat(s.to_string()))?;
        Self::plain(item_type.parse()?, token)
    }
}

impl Ord for SyncableId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item_type
            .as_str()
            .cmp(other.item_type.as_str())
            .then_with(|| self.token.cmp(&other.token))
    }
}

impl PartialOrd for SyncableId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Serialized as the `type:token` string so ids can key JSON maps.
impl Serialize for SyncableId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SyncableId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A storage root plus the ordered ids leading to an item.
///
/// The path with no ids addresses the store's root folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncablePath {
    storage_root_id: String,
    ids: Vec<SyncableId>,
}

impl SyncablePath {
    /// The root path of a store.
    pub fn root(storage_root_id: &str) -> Result<Self, IdError> {
        validate_token(storage_root_id)?;
        Ok(Self {
            storage_root_id: storage_root_id.to_string(),
            ids: Vec::new(),
        })
    }

    pub fn new(storage_root_id: &str, ids: Vec<SyncableId>) -> Result<Self, IdError> {
        let mut path = Self::root(storage_root_id)?;
        path.ids = ids;
        Ok(path)
    }

    pub fn storage_root_id(&self) -> &str {
        &self.storage_root_id
    }

    pub fn ids(&self) -> &[SyncableId] {
        &self.ids
    }

    pub fn is_root(&self) -> bool {
        self.ids.is_empty()
    }

    /// The last id, or `None` for the root.
    pub fn last_id(&self) -> Option<&SyncableId> {
        self.ids.last()
    }

    /// The path with the last id removed, or `None` for the root.
    pub fn parent(&self) -> Option<SyncablePath> {
        if self.ids.is_empty() {
            return None;
        }
        Some(Self {
            storage_root_id: self.storage_root_id.clone(),
            ids: self.ids[..self.ids.len() - 1].to_vec(),
        })
    }

    /// This path extended by one id.
    pub fn child(&self, id: SyncableId) -> SyncablePath {
        let mut ids = self.ids.clone();
        ids.push(id);
        Self {
            storage_root_id: self.storage_root_id.clone(),
            ids,
        }
    }

    /// This path followed by each ancestor up to and including the root.
    pub fn self_and_ancestors(&self) -> impl Iterator<Item = SyncablePath> + '_ {
        (0..=self.ids.len()).rev().map(move |len| Self {
            storage_root_id: self.storage_root_id.clone(),
            ids: self.ids[..len].to_vec(),
        })
    }

    /// Whether `self` equals `other` or lies beneath it.
    pub fn starts_with(&self, other: &SyncablePath) -> bool {
        self.storage_root_id == other.storage_root_id && self.ids.starts_with(&other.ids)
    }

    /// Opaque notification stream identifier derived from this path.
    pub fn stream_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        format!(
            "{}:{}",
            self.storage_root_id,
            &hex::encode(hasher.finalize())[..32]
        )
    }
}

impl Display for SyncablePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_root_id)?;
        for id in &self.ids {
            write!(f, "/{}", id)?;
        }
        Ok(())
    }
}

impl FromStr for SyncablePath {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim_matches('/').split('/');
        let root = parts
            .next()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| IdError::InvalidPath(s.to_string()))?;
        let ids = parts.map(str::parse).collect::<Result<Vec<_>, _>>()?;
        Self::new(root, ids)
    }
}

// Paths order by their string representation for stable diffing.
impl Ord for SyncablePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for SyncablePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
