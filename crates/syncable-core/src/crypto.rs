//! Contract of the crypto collaborator and provenance helpers.
//!
//! The store never implements primitives itself. Signatures and ciphertexts
//! are opaque bytes produced and checked by a [`CryptoService`].

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::hash::ContentHash;
use crate::id::SyncablePath;
use crate::metadata::{Metadata, Provenance};

/// Public half of a creator's key set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeySet {
    /// Key-set identity, as recorded in [`Provenance::creator`].
    pub id: String,
    #[serde(with = "crate::metadata::hex_bytes")]
    pub signing_key: Vec<u8>,
    #[serde(with = "crate::metadata::hex_bytes")]
    pub encryption_key: Vec<u8>,
}

#[async_trait]
pub trait CryptoService: Send + Sync {
    /// Identity of the local key set.
    fn creator_id(&self) -> &str;

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;

    /// Check `signature` over `payload` by `creator`. Unknown creators verify as false.
    async fn verify(&self, creator: &str, payload: &[u8], signature: &[u8]) -> Result<bool>;

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Look up a creator's public keys.
    async fn public_keys(&self, creator: &str) -> Result<Option<PublicKeySet>>;
}

/// Attach a signed provenance for the local creator to `metadata`.
///
/// `content` is the stored (post-encryption) file content, or `None` for folders
/// and bundles.
pub async fn sign_metadata(
    crypto: &dyn CryptoService,
    path: &SyncablePath,
    mut metadata: Metadata,
    content: Option<&[u8]>,
) -> Result<Metadata> {
    metadata.provenance = Provenance {
        creator: crypto.creator_id().to_string(),
        signature: Vec::new(),
        trusted_timestamp: Some(Utc::now()),
    };
    let content_hash = content.map(ContentHash::of_bytes);
    let payload = metadata.signing_payload(path, content_hash.as_ref());
    metadata.provenance.signature = crypto.sign(&payload).await?;
    Ok(metadata)
}

/// Fail with `Untrusted` unless `metadata`'s provenance signature checks out.
pub async fn verify_provenance(
    crypto: &dyn CryptoService,
    path: &SyncablePath,
    metadata: &Metadata,
    content: Option<&[u8]>,
) -> Result<()> {
    let content_hash = content.map(ContentHash::of_bytes);
    let payload = metadata.signing_payload(path, content_hash.as_ref());
    let provenance = &metadata.provenance;
    if crypto
        .verify(&provenance.creator, &payload, &provenance.signature)
        .await?
    {
        Ok(())
    } else {
        Err(StoreError::Untrusted(format!(
            "{} (creator {})",
            path, provenance.creator
        )))
    }
}
