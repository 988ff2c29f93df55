//! Keyed, debounced task queue with a single consumer.
//!
//! The first enqueue for a key opens a debounce window; later enqueues within
//! the window only replace the pending version. When the window closes the
//! handler runs once with the latest version, unless that version was
//! already handled for the key. Keys that will not come back are released
//! with [`DebouncedQueue::forget`].

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

type KeyFilter<K> = Box<dyn Fn(&K) -> bool + Send>;

enum Message<K, V> {
    Schedule(K, V),
    Forget(KeyFilter<K>),
}

pub struct DebouncedQueue<K, V> {
    tx: mpsc::UnboundedSender<Message<K, V>>,
    handle: JoinHandle<()>,
}

impl<K, V> DebouncedQueue<K, V>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
    V: PartialEq + Clone + Send + 'static,
{
    /// Start the consumer task.
    pub fn spawn<H, Fut>(window: Duration, handler: H) -> Self
    where
        H: Fn(K, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drain(rx, window, handler));
        Self { tx, handle }
    }

    /// Schedule `key` with `version`. Returns false once the queue is closed.
    pub fn enqueue(&self, key: K, version: V) -> bool {
        self.tx.send(Message::Schedule(key, version)).is_ok()
    }

    /// Drop pending work and handled-version records for every key matching
    /// `matches`. A later enqueue of such a key starts from scratch.
    pub fn forget(&self, matches: impl Fn(&K) -> bool + Send + 'static) -> bool {
        self.tx.send(Message::Forget(Box::new(matches))).is_ok()
    }

    /// Stop accepting work, run everything still pending, then return.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}

async fn drain<K, V, H, Fut>(
    mut rx: mpsc::UnboundedReceiver<Message<K, V>>,
    window: Duration,
    handler: H,
) where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: PartialEq + Clone,
    H: Fn(K, V) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut pending: HashMap<K, (V, Instant)> = HashMap::new();
    let mut fired: HashMap<K, V> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|(_, deadline)| *deadline).min();
        let wait = async {
            match next_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            message = rx.recv() => match message {
                Some(Message::Schedule(key, version)) => match pending.get_mut(&key) {
                    Some(entry) => entry.0 = version,
                    None => {
                        pending.insert(key, (version, Instant::now() + window));
                    }
                },
                Some(Message::Forget(matches)) => {
                    pending.retain(|key, _| !matches(key));
                    fired.retain(|key, _| !matches(key));
                    debug!("Forgot keys; {} still tracked", fired.len());
                }
                None => break,
            },
            _ = wait => {
                let now = Instant::now();
                let due: Vec<K> = pending
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in due {
                    if let Some((version, _)) = pending.remove(&key) {
                        fire(&handler, &mut fired, key, version).await;
                    }
                }
            }
        }
    }

    // Closed: flush whatever is still waiting.
    for (key, (version, _)) in pending.drain() {
        fire(&handler, &mut fired, key, version).await;
    }
}

async fn fire<K, V, H, Fut>(handler: &H, fired: &mut HashMap<K, V>, key: K, version: V)
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: PartialEq + Clone,
    H: Fn(K, V) -> Fut,
    Fut: Future<Output = ()>,
{
    if fired.get(&key) == Some(&version) {
        debug!("Skipping {:?}: version already handled", key);
        return;
    }
    fired.insert(key.clone(), version.clone());
    handler(key, version).await;
}
