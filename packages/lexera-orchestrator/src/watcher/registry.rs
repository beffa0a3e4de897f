/// Shared, reference-counted file watch registry.
///
/// One OS watch per absolute path, no matter how many files subscribe to it.
/// `acquire` hands out a `WatchTicket`; dropping the ticket unsubscribes and
/// decrements the count. The OS watch is disposed when the count reaches zero.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use tokio::sync::mpsc;

use super::types::{FileChangeType, FileWatchEvent, WatchError};

/// Callback a backend invokes for every change on its path.
pub type WatchSink = Arc<dyn Fn(FileChangeType) + Send + Sync>;

/// An active OS watch. Dropping it stops watching.
pub trait WatchHandle: Send {}

/// Creates OS-level watches.
pub trait WatchBackend: Send + Sync {
    fn watch(&self, path: &Path, sink: WatchSink) -> Result<Box<dyn WatchHandle>, WatchError>;
}

struct Subscriber {
    relative_path: String,
    tx: mpsc::UnboundedSender<FileWatchEvent>,
}

struct WatchEntry {
    _handle: Box<dyn WatchHandle>,
    subscribers: HashMap<u64, Subscriber>,
    suspended: usize,
}

struct RegistryInner {
    backend: Arc<dyn WatchBackend>,
    entries: Mutex<HashMap<PathBuf, WatchEntry>>,
    next_subscription: AtomicU64,
}

impl RegistryInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, WatchEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, path: &Path, change_type: FileChangeType) {
        let entries = self.entries();
        let Some(entry) = entries.get(path) else {
            return;
        };
        if entry.suspended > 0 {
            log::debug!(
                "[lexera.watch.registry] Suppressed {:?} on {} (suspended)",
                change_type,
                path.display()
            );
            return;
        }
        let timestamp = Utc::now();
        for subscriber in entry.subscribers.values() {
            let event = FileWatchEvent {
                relative_path: subscriber.relative_path.clone(),
                absolute_path: path.to_path_buf(),
                change_type,
                timestamp,
            };
            if subscriber.tx.send(event).is_err() {
                log::debug!(
                    "[lexera.watch.registry] Subscriber for {} is gone",
                    subscriber.relative_path
                );
            }
        }
    }

    fn release(&self, path: &Path, subscription: u64) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(path) else {
            return;
        };
        entry.subscribers.remove(&subscription);
        if !entry.subscribers.is_empty() {
            return;
        }
        let removed = entries.remove(path);
        drop(entries);
        // Handle dropped outside the lock: backend threads may be waiting on it.
        drop(removed);
        log::info!(
            "[lexera.watch.registry] Disposed watcher for {}",
            path.display()
        );
    }
}

/// Proof of one subscription. Dropping it releases the subscription exactly once.
pub struct WatchTicket {
    registry: Weak<RegistryInner>,
    path: PathBuf,
    subscription: u64,
}

impl WatchTicket {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly; equivalent to dropping the ticket.
    pub fn release(self) {}
}

impl Drop for WatchTicket {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.path, self.subscription);
        }
    }
}

impl std::fmt::Debug for WatchTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchTicket")
            .field("path", &self.path)
            .field("subscription", &self.subscription)
            .finish()
    }
}

/// Silences delivery for a path while alive (used around our own writes).
pub struct WatchSuspension {
    registry: Weak<RegistryInner>,
    path: PathBuf,
}

impl Drop for WatchSuspension {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Some(entry) = registry.entries().get_mut(&self.path) {
                entry.suspended = entry.suspended.saturating_sub(1);
            }
        }
    }
}

#[derive(Clone)]
pub struct FileWatchRegistry {
    inner: Arc<RegistryInner>,
}

impl FileWatchRegistry {
    pub fn new(backend: Arc<dyn WatchBackend>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                backend,
                entries: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe `relative_path` to changes of `path`, creating the OS watch on first use.
    pub fn acquire(
        &self,
        path: &Path,
        relative_path: &str,
        tx: mpsc::UnboundedSender<FileWatchEvent>,
    ) -> Result<WatchTicket, WatchError> {
        let subscription = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            relative_path: relative_path.to_string(),
            tx,
        };

        let mut entries = self.inner.entries();
        if let Some(entry) = entries.get_mut(path) {
            entry.subscribers.insert(subscription, subscriber);
            log::debug!(
                "[lexera.watch.registry] Reusing watcher for {} (refs: {})",
                path.display(),
                entry.subscribers.len()
            );
        } else {
            let weak = Arc::downgrade(&self.inner);
            let sink_path = path.to_path_buf();
            let sink: WatchSink = Arc::new(move |change_type| {
                if let Some(registry) = weak.upgrade() {
                    registry.dispatch(&sink_path, change_type);
                }
            });
            let handle = self.inner.backend.watch(path, sink)?;
            let mut subscribers = HashMap::new();
            subscribers.insert(subscription, subscriber);
            entries.insert(
                path.to_path_buf(),
                WatchEntry {
                    _handle: handle,
                    subscribers,
                    suspended: 0,
                },
            );
            log::info!("[lexera.watch.registry] Watching {}", path.display());
        }

        Ok(WatchTicket {
            registry: Arc::downgrade(&self.inner),
            path: path.to_path_buf(),
            subscription,
        })
    }

    /// Suppress delivery for `path` until the returned guard is dropped.
    pub fn suspend(&self, path: &Path) -> WatchSuspension {
        if let Some(entry) = self.inner.entries().get_mut(path) {
            entry.suspended += 1;
        }
        WatchSuspension {
            registry: Arc::downgrade(&self.inner),
            path: path.to_path_buf(),
        }
    }

    /// Deliver a change as if the backend had reported it.
    pub fn emit(&self, path: &Path, change_type: FileChangeType) {
        self.inner.dispatch(path, change_type);
    }

    /// Number of live OS watches.
    pub fn watcher_count(&self) -> usize {
        self.inner.entries().len()
    }

    /// Number of subscriptions sharing the watch on `path`.
    pub fn ref_count(&self, path: &Path) -> usize {
        self.inner
            .entries()
            .get(path)
            .map_or(0, |e| e.subscribers.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Backend that creates no OS resources and counts live handles.
    #[derive(Default)]
    pub(crate) struct CountingBackend {
        pub created: Arc<AtomicUsize>,
        pub live: Arc<AtomicUsize>,
    }

    struct CountingHandle {
        live: Arc<AtomicUsize>,
    }

    impl WatchHandle for CountingHandle {}

    impl Drop for CountingHandle {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl WatchBackend for CountingBackend {
        fn watch(&self, _path: &Path, _sink: WatchSink) -> Result<Box<dyn WatchHandle>, WatchError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingHandle {
                live: self.live.clone(),
            }))
        }
    }

    #[test]
    fn test_shared_watch_is_reference_counted() {
        let backend = CountingBackend::default();
        let created = backend.created.clone();
        let live = backend.live.clone();
        let registry = FileWatchRegistry::new(Arc::new(backend));
        let (tx, _rx) = mpsc::unbounded_channel();
        let path = Path::new("/boards/shared.md");

        let first = registry.acquire(path, "shared.md", tx.clone()).unwrap();
        let second = registry.acquire(path, "./shared.md", tx).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count(path), 2);

        first.release();
        assert_eq!(registry.ref_count(path), 1);
        assert_eq!(live.load(Ordering::SeqCst), 1);

        drop(second);
        assert_eq!(registry.ref_count(path), 0);
        assert_eq!(registry.watcher_count(), 0);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_each_subscriber_receives_events() {
        let registry = FileWatchRegistry::new(Arc::new(CountingBackend::default()));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let path = Path::new("/boards/notes.md");

        let _a = registry.acquire(path, "notes.md", tx_a).unwrap();
        let _b = registry.acquire(path, "Notes.md", tx_b).unwrap();
        registry.emit(path, FileChangeType::Modified);

        let event_a = rx_a.try_recv().unwrap();
        let event_b = rx_b.try_recv().unwrap();
        assert_eq!(event_a.relative_path, "notes.md");
        assert_eq!(event_b.relative_path, "Notes.md");
        assert_eq!(event_b.change_type, FileChangeType::Modified);
    }

    #[test]
    fn test_suspension_drops_events() {
        let registry = FileWatchRegistry::new(Arc::new(CountingBackend::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let path = Path::new("/boards/board.md");
        let _ticket = registry.acquire(path, "board.md", tx).unwrap();

        {
            let _quiet = registry.suspend(path);
            registry.emit(path, FileChangeType::Modified);
        }
        assert!(rx.try_recv().is_err());

        registry.emit(path, FileChangeType::Deleted);
        assert_eq!(rx.try_recv().unwrap().change_type, FileChangeType::Deleted);
    }
}
