//! Content hashes for files and folder/bundle subtrees.
//!
//! Files hash their stored bytes (post-encryption). Folders and bundles hash
//! their own identity together with the hashes of their live children, which
//! makes the whole store a Merkle tree: equal root hashes mean equal trees.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::{ItemType, SyncableId};

/// A hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw file content.
    pub fn of_bytes(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"file\0");
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Hash a folder or bundle from its identity and its children's hashes.
    ///
    /// `identity` is the container's own id token, or the storage root id for
    /// the root. Children are visited in id order so the result does not depend
    /// on listing order.
    pub fn of_container(
        item_type: ItemType,
        identity: &str,
        children: &BTreeMap<SyncableId, ContentHash>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(item_type.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(identity.as_bytes());
        hasher.update([0]);
        for (id, hash) in children {
            hasher.update(id.to_string().as_bytes());
            hasher.update([0]);
            hasher.update(hash.0.as_bytes());
            hasher.update([0]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a previously computed hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> SyncableId {
        SyncableId::plain(ItemType::File, name).unwrap()
    }

    #[test]
    fn test_content_hash_deterministic() {
        assert_eq!(ContentHash::of_bytes(b"hello"), ContentHash::of_bytes(b"hello"));
        assert_ne!(ContentHash::of_bytes(b"hello"), ContentHash::of_bytes(b"world"));
        // SHA-256 hex is 64 characters
        assert_eq!(ContentHash::of_bytes(b"x").as_str().len(), 64);
    }

    #[test]
    fn test_container_hash_tracks_children() {
        let mut children = BTreeMap::new();
        let empty = ContentHash::of_container(ItemType::Folder, "F", &children);

        children.insert(id("a"), ContentHash::of_bytes(b"a"));
        let one = ContentHash::of_container(ItemType::Folder, "F", &children);
        assert_ne!(empty, one);

        children.insert(id("a"), ContentHash::of_bytes(b"changed"));
        let changed = ContentHash::of_container(ItemType::Folder, "F", &children);
        assert_ne!(one, changed);
    }

    #[test]
    fn test_container_hash_depends_on_identity_and_type() {
        let children = BTreeMap::new();
        let f = ContentHash::of_container(ItemType::Folder, "F", &children);
        let g = ContentHash::of_container(ItemType::Folder, "G", &children);
        let b = ContentHash::of_container(ItemType::Bundle, "F", &children);
        assert_ne!(f, g);
        assert_ne!(f, b);
    }
}
