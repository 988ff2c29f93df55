//! Structural change events published by a storage backing.
//!
//! `EventBus` is wrapped in `Arc` and hands out `Subscription`s that
//! unsubscribe when dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;

use crate::id::{ItemType, SyncablePath};

/// A mutation of the tree, emitted after it is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreEvent {
    /// A folder was created (including the store root).
    FolderAdded { path: SyncablePath },
    /// A folder was deleted.
    FolderRemoved { path: SyncablePath },
    /// A bundle or file was created.
    ItemAdded {
        path: SyncablePath,
        #[serde(rename = "itemType")]
        item_type: ItemType,
    },
    /// A bundle or file was deleted.
    ItemRemoved {
        path: SyncablePath,
        #[serde(rename = "itemType")]
        item_type: ItemType,
    },
    /// A file's content was replaced.
    ItemUpdated { path: SyncablePath },
}

impl StoreEvent {
    pub fn added(path: SyncablePath, item_type: ItemType) -> Self {
        match item_type {
            ItemType::Folder => StoreEvent::FolderAdded { path },
            _ => StoreEvent::ItemAdded { path, item_type },
        }
    }

    pub fn removed(path: SyncablePath, item_type: ItemType) -> Self {
        match item_type {
            ItemType::Folder => StoreEvent::FolderRemoved { path },
            _ => StoreEvent::ItemRemoved { path, item_type },
        }
    }

    /// Path of the item that changed.
    pub fn path(&self) -> &SyncablePath {
        match self {
            StoreEvent::FolderAdded { path }
            | StoreEvent::FolderRemoved { path }
            | StoreEvent::ItemAdded { path, .. }
            | StoreEvent::ItemRemoved { path, .. }
            | StoreEvent::ItemUpdated { path } => path,
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events; drop it to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(StoreEvent) + Send + Sync>;

/// Event bus for publishing store events to subscribers.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(StoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: StoreEvent) {
        // Snapshot so callbacks may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder_event(name: &str) -> StoreEvent {
        let path: SyncablePath = format!("store/folder:{}", name).parse().unwrap();
        StoreEvent::added(path, ItemType::Folder)
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(folder_event("a"));
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(folder_event("b"));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_partial_unsubscribe() {
        let bus = Arc::new(EventBus::new());
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&count1);
        let c2 = Arc::clone(&count2);

        let sub1 = bus.subscribe(move |_| {
            c1.fetch_add(1, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |_| {
            c2.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(folder_event("a"));
        drop(sub1);
        bus.emit(folder_event("b"));

        assert_eq!(count1.load(Ordering::Relaxed), 1);
        assert_eq!(count2.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_added_and_removed_pick_variant_by_type() {
        let path: SyncablePath = "store/file:a".parse().unwrap();
        assert!(matches!(
            StoreEvent::added(path.clone(), ItemType::File),
            StoreEvent::ItemAdded { .. }
        ));
        assert!(matches!(
            StoreEvent::removed(path.clone(), ItemType::Folder),
            StoreEvent::FolderRemoved { .. }
        ));
        assert_eq!(StoreEvent::ItemUpdated { path: path.clone() }.path(), &path);
    }

    #[test]
    fn test_event_serialization() {
        let path: SyncablePath = "store/bundle:b".parse().unwrap();
        let json = serde_json::to_string(&StoreEvent::added(path, ItemType::Bundle)).unwrap();
        assert!(json.contains("\"type\":\"itemAdded\""));
        assert!(json.contains("\"itemType\":\"bundle\""));
    }
}
