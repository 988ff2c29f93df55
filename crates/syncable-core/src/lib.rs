//! syncable-core: hierarchical, content-addressed object store with hash-tree
//! synchronization between replicas.
//!
//! This crate provides:
//! - Typed ids and paths addressing folders, bundles and files
//! - A keyed object store with optimistic concurrency (memory, JSON file, prefixed view)
//! - A storage backing over a [`FileSystem`] with metadata side-files and cached subtree hashes
//! - Pull/push synchronization driven by hash comparison
//! - Debounced change notifications for remote subscribers

pub mod backing;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod fs;
pub mod hash;
pub mod id;
pub mod lock;
pub mod metadata;
pub mod notifier;
pub mod object_store;
pub mod registry;
pub mod sync;
pub mod task_queue;
pub mod testkit;

pub use backing::{ContainerAccessor, FileAccessor, FsBacking, ItemAccessor, StorageBacking};
pub use config::{RetryPolicy, StoreConfig};
pub use crypto::{CryptoService, PublicKeySet};
pub use error::{ErrorKind, Result, StoreError};
pub use events::{EventBus, StoreEvent, Subscription};
pub use fs::{FileEntry, FileSystem, InMemoryFs, NativeFs};
pub use hash::ContentHash;
pub use id::{ItemType, SyncableId, SyncablePath};
pub use metadata::{LocalMetadata, LocalMetadataPatch, Metadata, Provenance};
pub use notifier::{ChangeNotification, ChangeNotifier, ChannelTransport, NotificationTransport};
pub use object_store::{ObjectStore, StorableObject};
pub use registry::StoreRegistry;
pub use sync::{LocalRemote, PushOutcome, Remote, SyncReport, SyncServer, Synchronizer};
