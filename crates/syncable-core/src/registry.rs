//! Explicit registry of open stores.
//!
//! Maps storage-root ids to backings, opening each on first use through an
//! injected factory. Owned by whoever serves the stores; dropping the
//! registry closes them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::backing::{FsBacking, StorageBacking};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::fs::FileSystem;

type Factory = Box<dyn Fn(&str) -> Result<Arc<dyn StorageBacking>> + Send + Sync>;

pub struct StoreRegistry {
    factory: Factory,
    stores: RwLock<HashMap<String, Arc<dyn StorageBacking>>>,
}

impl StoreRegistry {
    pub fn new(
        factory: impl Fn(&str) -> Result<Arc<dyn StorageBacking>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// A registry opening every store as an [`FsBacking`] over one shared file system.
    pub fn for_filesystem<F>(fs: Arc<F>, config: StoreConfig) -> Self
    where
        F: FileSystem + 'static,
    {
        Self::new(move |root_id| {
            let backing: Arc<dyn StorageBacking> =
                Arc::new(FsBacking::new(fs.clone(), root_id, &config)?);
            Ok(backing)
        })
    }

    /// The backing for `storage_root_id`, opening it if necessary.
    pub fn get_or_open(&self, storage_root_id: &str) -> Result<Arc<dyn StorageBacking>> {
        if let Some(store) = self
            .stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(storage_root_id)
        {
            return Ok(store.clone());
        }

        let mut stores = self.stores.write().unwrap_or_else(|e| e.into_inner());
        // Another caller may have opened it between the two locks.
        if let Some(store) = stores.get(storage_root_id) {
            return Ok(store.clone());
        }
        let store = (self.factory)(storage_root_id)?;
        debug!("Opened store {}", storage_root_id);
        stores.insert(storage_root_id.to_string(), store.clone());
        Ok(store)
    }

    /// Register an already open backing under its own root id.
    pub fn insert(&self, store: Arc<dyn StorageBacking>) {
        self.stores
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(store.storage_root_id().to_string(), store);
    }

    /// Forget a store; later lookups reopen it.
    pub fn remove(&self, storage_root_id: &str) -> Option<Arc<dyn StorageBacking>> {
        self.stores
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(storage_root_id)
    }

    pub fn open_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
