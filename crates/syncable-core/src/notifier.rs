//! Debounced change notifications for remote subscribers.
//!
//! [`ChangeNotifier`] listens to a backing's [`EventBus`](crate::events::EventBus).
//! For each change it finds the nearest folder containing the changed item,
//! reads that folder's fresh hash and enqueues one task per subscriber keyed
//! by `(subscriber, folder)`. Bursts of writes into the same folder therefore
//! reach each subscriber as a single notification carrying the latest hash.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backing::StorageBacking;
use crate::error::Result;
use crate::events::{StoreEvent, Subscription};
use crate::hash::ContentHash;
use crate::id::{ItemType, SyncablePath};
use crate::task_queue::DebouncedQueue;

/// "Content under `path` changed; its hash is now `hash`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    /// Opaque stream identifier derived from `path`.
    pub stream_id: String,
    pub path: SyncablePath,
    pub hash: ContentHash,
}

impl ChangeNotification {
    pub fn new(path: SyncablePath, hash: ContentHash) -> Self {
        Self {
            stream_id: path.stream_id(),
            path,
            hash,
        }
    }
}

/// Publish side of the channel carrying notifications between replicas.
///
/// Delivery is at-least-once; receivers must tolerate duplicates.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn publish(&self, subscriber_id: &str, notification: ChangeNotification) -> Result<()>;
}

/// In-process transport backed by tokio channels, one per subscriber.
#[derive(Default)]
pub struct ChannelTransport {
    senders: RwLock<HashMap<String, mpsc::UnboundedSender<ChangeNotification>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the receiving end for `subscriber_id`.
    pub fn subscribe(&self, subscriber_id: &str) -> mpsc::UnboundedReceiver<ChangeNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subscriber_id.to_string(), tx);
        rx
    }
}

#[async_trait]
impl NotificationTransport for ChannelTransport {
    async fn publish(&self, subscriber_id: &str, notification: ChangeNotification) -> Result<()> {
        let mut senders = self.senders.write().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = senders.get(subscriber_id) {
            if tx.send(notification).is_err() {
                debug!("Subscriber {} went away, dropping its channel", subscriber_id);
                senders.remove(subscriber_id);
            }
        }
        Ok(())
    }
}

type NotifyKey = (String, SyncablePath);

/// Turns backing events into debounced per-subscriber notifications.
pub struct ChangeNotifier {
    subscribers: Arc<RwLock<BTreeSet<String>>>,
    removals: mpsc::UnboundedSender<String>,
    _subscription: Subscription,
    shutdown: oneshot::Sender<()>,
    forwarder: JoinHandle<()>,
}

impl ChangeNotifier {
    pub fn start(
        backing: Arc<dyn StorageBacking>,
        transport: Arc<dyn NotificationTransport>,
        debounce: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subscription = backing.events().subscribe(move |event| {
            let _ = events_tx.send(event);
        });

        let queue = DebouncedQueue::spawn(debounce, move |(subscriber, path): NotifyKey, hash| {
            let transport = transport.clone();
            async move {
                let notification = ChangeNotification::new(path, hash);
                if let Err(e) = transport.publish(&subscriber, notification).await {
                    warn!("Failed to notify {}: {}", subscriber, e);
                }
            }
        });

        let subscribers = Arc::new(RwLock::new(BTreeSet::new()));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (removals, removals_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(
            backing,
            events_rx,
            removals_rx,
            shutdown_rx,
            queue,
            subscribers.clone(),
        ));

        Self {
            subscribers,
            removals,
            _subscription: subscription,
            shutdown,
            forwarder,
        }
    }

    pub fn add_subscriber(&self, subscriber_id: &str) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subscriber_id.to_string());
    }

    /// Stop notifying `subscriber_id` and drop everything queued for it.
    pub fn remove_subscriber(&self, subscriber_id: &str) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(subscriber_id);
        if removed {
            let _ = self.removals.send(subscriber_id.to_string());
        }
    }

    /// Stop listening, deliver what is pending and wait for the drain to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.forwarder.await;
    }
}

/// The folder whose hash a subscriber should re-check after `event`.
fn notification_target(event: &StoreEvent) -> Option<SyncablePath> {
    event.path().parent().and_then(|parent| {
        parent.self_and_ancestors().find(|candidate| {
            candidate
                .last_id()
                .is_none_or(|id| id.item_type() == ItemType::Folder)
        })
    })
}

async fn forward(
    backing: Arc<dyn StorageBacking>,
    mut events: mpsc::UnboundedReceiver<StoreEvent>,
    mut removals: mpsc::UnboundedReceiver<String>,
    mut shutdown: oneshot::Receiver<()>,
    queue: DebouncedQueue<NotifyKey, ContentHash>,
    subscribers: Arc<RwLock<BTreeSet<String>>>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            Some(removed) = removals.recv() => {
                debug!("Releasing queued notifications for {}", removed);
                queue.forget(move |(subscriber, _)| *subscriber == removed);
                continue;
            }
            _ = &mut shutdown => {
                // Handle whatever was emitted before shutdown.
                while let Ok(event) = events.try_recv() {
                    enqueue(&*backing, &queue, &subscribers, &event).await;
                }
                break;
            }
        };
        enqueue(&*backing, &queue, &subscribers, &event).await;
    }
    queue.close().await;
}

async fn enqueue(
    backing: &dyn StorageBacking,
    queue: &DebouncedQueue<NotifyKey, ContentHash>,
    subscribers: &RwLock<BTreeSet<String>>,
    event: &StoreEvent,
) {
    let Some(target) = notification_target(event) else {
        return;
    };
    let hash = match backing.get_hash_at_path(&target).await {
        Ok(hash) => hash,
        Err(e) => {
            debug!("No notification for {}: {}", target, e);
            return;
        }
    };
    let subscribers: Vec<String> = subscribers
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    for subscriber in subscribers {
        queue.enqueue((subscriber, target.clone()), hash.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SyncableId;
    use crate::testkit::{memory_store, unsigned};

    fn child(parent: &SyncablePath, item_type: ItemType, name: &str) -> SyncablePath {
        parent.child(SyncableId::plain(item_type, name).unwrap())
    }

    #[test]
    fn test_target_is_nearest_folder_above_change() {
        let path: SyncablePath = "store/folder:F/bundle:B/file:a".parse().unwrap();
        let event = StoreEvent::added(path, ItemType::File);
        assert_eq!(
            notification_target(&event).unwrap().to_string(),
            "store/folder:F"
        );

        let top: SyncablePath = "store/folder:F".parse().unwrap();
        let event = StoreEvent::added(top, ItemType::Folder);
        assert_eq!(notification_target(&event).unwrap().to_string(), "store");

        let root = SyncablePath::root("store").unwrap();
        assert!(notification_target(&StoreEvent::removed(root, ItemType::Folder)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_produces_one_notification_with_latest_hash() {
        let store = memory_store("store").await.unwrap();
        let root = store.root_path();
        let folder = child(&root, ItemType::Folder, "F");
        store
            .create_folder_with_path(&folder, unsigned(ItemType::Folder))
            .await
            .unwrap();

        let transport = Arc::new(ChannelTransport::new());
        let mut rx = transport.subscribe("remote-1");
        let notifier = ChangeNotifier::start(
            store.clone(),
            transport.clone(),
            Duration::from_millis(250),
        );
        notifier.add_subscriber("remote-1");

        for name in ["a", "b", "c"] {
            store
                .create_binary_file_with_path(
                    &child(&folder, ItemType::File, name),
                    name.as_bytes().to_vec(),
                    unsigned(ItemType::File),
                )
                .await
                .unwrap();
        }

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.path, folder);
        assert_eq!(notification.stream_id, folder.stream_id());
        assert_eq!(notification.hash, store.get_hash_at_path(&folder).await.unwrap());

        notifier.shutdown().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_subscriber_gets_nothing() {
        let store = memory_store("store").await.unwrap();
        let root = store.root_path();

        let transport = Arc::new(ChannelTransport::new());
        let mut rx = transport.subscribe("remote-1");
        let notifier = ChangeNotifier::start(store.clone(), transport.clone(), Duration::from_millis(10));
        notifier.add_subscriber("remote-1");
        notifier.remove_subscriber("remote-1");

        store
            .create_folder_with_path(&child(&root, ItemType::Folder, "F"), unsigned(ItemType::Folder))
            .await
            .unwrap();
        notifier.shutdown().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribed_subscriber_is_notified_again() {
        let store = memory_store("store").await.unwrap();
        let root = store.root_path();
        let folder = child(&root, ItemType::Folder, "F");
        store
            .create_folder_with_path(&folder, unsigned(ItemType::Folder))
            .await
            .unwrap();

        let transport = Arc::new(ChannelTransport::new());
        let mut rx = transport.subscribe("remote-1");
        let notifier = ChangeNotifier::start(store.clone(), transport.clone(), Duration::from_millis(10));
        notifier.add_subscriber("remote-1");

        store
            .create_binary_file_with_path(&child(&folder, ItemType::File, "a"), b"a".to_vec(), unsigned(ItemType::File))
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();

        notifier.remove_subscriber("remote-1");
        notifier.add_subscriber("remote-1");
        tokio::time::sleep(Duration::from_millis(1)).await;

        // Back to the hash already delivered before the subscriber left.
        let b = child(&folder, ItemType::File, "b");
        store
            .create_binary_file_with_path(&b, b"b".to_vec(), unsigned(ItemType::File))
            .await
            .unwrap();
        store.delete_at_path(&b).await.unwrap();

        let again = rx.recv().await.unwrap();
        assert_eq!(again.path, folder);
        assert_eq!(again.hash, first.hash);
        notifier.shutdown().await;
    }
}
