//! Per-item metadata stored alongside every folder, bundle and file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::id::{ItemType, SyncablePath};

/// Unforgeable record of where an item came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Key-set identity of the creator.
    pub creator: String,
    /// Signature over [`Metadata::signing_payload`], produced by the crypto service.
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    /// Optional trusted timestamp of creation.
    pub trusted_timestamp: Option<DateTime<Utc>>,
}

impl Provenance {
    /// Provenance with no signature, for stores that do not verify.
    pub fn unsigned(creator: &str) -> Self {
        Self {
            creator: creator.to_string(),
            signature: Vec::new(),
            trusted_timestamp: None,
        }
    }
}

/// Fields cached or tracked locally by a backing. Never part of the signed record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMetadata {
    /// Content hash for files; lazily computed subtree hash for folders/bundles.
    #[serde(default)]
    pub hash: Option<ContentHash>,
    /// Tombstone marker set by a soft delete.
    #[serde(default)]
    pub deleted: bool,
}

/// Partial update of [`LocalMetadata`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct LocalMetadataPatch {
    /// `Some(None)` clears the cached hash.
    pub hash: Option<Option<ContentHash>>,
}

impl LocalMetadataPatch {
    pub fn invalidate_hash() -> Self {
        Self { hash: Some(None) }
    }
}

/// Metadata of one item.
///
/// Everything except `local` is immutable once the item is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub provenance: Provenance,
    pub encrypted: bool,
    /// Application-visible name, possibly salted or obfuscated.
    pub name: Option<String>,
    /// Schema name of a JSON-encoded file; `None` for binary files and containers.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub local: LocalMetadata,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningRecord<'a> {
    path: String,
    #[serde(rename = "type")]
    item_type: ItemType,
    creator: &'a str,
    encrypted: bool,
    name: Option<&'a str>,
    schema: Option<&'a str>,
    content_hash: Option<&'a ContentHash>,
    trusted_timestamp: Option<&'a DateTime<Utc>>,
}

impl Metadata {
    pub fn new(item_type: ItemType, provenance: Provenance) -> Self {
        Self {
            item_type,
            provenance,
            encrypted: false,
            name: None,
            schema: None,
            local: LocalMetadata::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// The cached hash, if one is present.
    pub fn hash(&self) -> Option<&ContentHash> {
        self.local.hash.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.local.deleted
    }

    /// Canonical bytes covered by the provenance signature.
    ///
    /// Binds the item's location, type, immutable fields and (for files) the
    /// content hash. Local fields are excluded.
    pub fn signing_payload(
        &self,
        path: &SyncablePath,
        content_hash: Option<&ContentHash>,
    ) -> Vec<u8> {
        let record = SigningRecord {
            path: path.to_string(),
            item_type: self.item_type,
            creator: &self.provenance.creator,
            encrypted: self.encrypted,
            name: self.name.as_deref(),
            schema: self.schema.as_deref(),
            content_hash,
            trusted_timestamp: self.provenance.trusted_timestamp.as_ref(),
        };
        // Serializing a struct of plain fields cannot fail.
        serde_json::to_vec(&record).unwrap_or_default()
    }
}

/// Serde helper encoding byte vectors as hex strings.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
