//! Lightweight helpers for tests of code built on the store.
//!
//! [`InsecureTestCrypto`] satisfies the [`CryptoService`] contract with
//! deliberately weak primitives: its "public" signing key is the secret. It
//! must never protect real data.
//!
//! # Example
//!
//! ```rust,ignore
//! use syncable_core::testkit::{memory_store, unsigned};
//!
//! let store = memory_store("store").await?;
//! let root = store.root_path();
//! store.create_folder_with_path(&root.child(folder_id), unsigned(ItemType::Folder)).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::backing::{FsBacking, StorageBacking};
use crate::config::StoreConfig;
use crate::crypto::{CryptoService, PublicKeySet};
use crate::error::{Result, StoreError};
use crate::fs::InMemoryFs;
use crate::id::ItemType;
use crate::metadata::{Metadata, Provenance};

/// Test crypto keyed by a per-creator secret derived from the creator id.
pub struct InsecureTestCrypto {
    creator: String,
    secret: Vec<u8>,
    known: RwLock<HashMap<String, PublicKeySet>>,
}

impl InsecureTestCrypto {
    pub fn new(creator: &str) -> Self {
        let secret = Sha256::digest(format!("secret:{}", creator).as_bytes()).to_vec();
        let crypto = Self {
            creator: creator.to_string(),
            secret,
            known: RwLock::new(HashMap::new()),
        };
        crypto.trust(crypto.public_key_set());
        crypto
    }

    pub fn public_key_set(&self) -> PublicKeySet {
        PublicKeySet {
            id: self.creator.clone(),
            signing_key: self.secret.clone(),
            encryption_key: self.secret.clone(),
        }
    }

    /// Make another creator's keys known, so their signatures verify.
    pub fn trust(&self, keys: PublicKeySet) {
        self.known
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(keys.id.clone(), keys);
    }

    fn mac(key: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(payload);
        hasher.finalize().to_vec()
    }

    fn keystream_xor(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for (block, chunk) in input.chunks(32).enumerate() {
            let pad = Self::mac(&self.secret, &(block as u64).to_be_bytes());
            out.extend(chunk.iter().zip(pad).map(|(b, k)| b ^ k));
        }
        out
    }
}

#[async_trait]
impl CryptoService for InsecureTestCrypto {
    fn creator_id(&self) -> &str {
        &self.creator
    }

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(Self::mac(&self.secret, payload))
    }

    async fn verify(&self, creator: &str, payload: &[u8], signature: &[u8]) -> Result<bool> {
        let known = self.known.read().unwrap_or_else(|e| e.into_inner());
        Ok(known
            .get(creator)
            .is_some_and(|keys| Self::mac(&keys.signing_key, payload) == signature))
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.keystream_xor(plaintext))
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.keystream_xor(ciphertext))
    }

    async fn public_keys(&self, creator: &str) -> Result<Option<PublicKeySet>> {
        let known = self.known.read().unwrap_or_else(|e| e.into_inner());
        Ok(known.get(creator).cloned())
    }
}

/// Metadata with an unsigned provenance from creator `test`.
pub fn unsigned(item_type: ItemType) -> Metadata {
    Metadata::new(item_type, Provenance::unsigned("test"))
}

/// An in-memory store whose root folder already exists.
pub async fn memory_store(storage_root_id: &str) -> Result<Arc<FsBacking<InMemoryFs>>> {
    memory_store_with_config(storage_root_id, &StoreConfig::default()).await
}

pub async fn memory_store_with_config(
    storage_root_id: &str,
    config: &StoreConfig,
) -> Result<Arc<FsBacking<InMemoryFs>>> {
    let backing = Arc::new(FsBacking::new(InMemoryFs::new(), storage_root_id, config)?);
    let root = backing.root_path();
    match backing
        .create_folder_with_path(&root, unsigned(ItemType::Folder))
        .await
    {
        Ok(_) => Ok(backing),
        Err(StoreError::Conflict(_)) => Ok(backing),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_encrypt_round_trip_changes_bytes() {
        let crypto = InsecureTestCrypto::new("alice");
        let plaintext = b"a message longer than one keystream block of 32 bytes".to_vec();
        let ciphertext = crypto.encrypt(&plaintext).await.unwrap();
        assert_ne!(ciphertext, plaintext);
        assert_eq!(crypto.decrypt(&ciphertext).await.unwrap(), plaintext);
    }

    #[tokio::test]
    async fn test_only_own_keys_known_initially() {
        let crypto = InsecureTestCrypto::new("alice");
        assert!(crypto.public_keys("alice").await.unwrap().is_some());
        assert!(crypto.public_keys("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_has_root() {
        let store = memory_store("store").await.unwrap();
        assert!(store.exists_at_path(&store.root_path()).await.unwrap());
    }
}
