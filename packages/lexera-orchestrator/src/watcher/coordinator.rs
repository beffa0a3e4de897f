/// Per-path operation mutex.
///
/// A reload and a save on the same file must never interleave, even when they
/// come from different sources (watcher callback vs. explicit save). Each
/// normalized path has at most one active operation; later callers wait in
/// FIFO order. An operation older than the timeout is force-released so a
/// stuck task cannot block the path forever.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::paths::normalize_path;

struct ActiveOperation {
    id: u64,
    label: String,
    started_at: Instant,
}

struct Waiter {
    id: u64,
    label: String,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct PathSlot {
    active: Option<ActiveOperation>,
    queue: VecDeque<Waiter>,
}

struct CoordinatorInner {
    slots: Mutex<HashMap<String, PathSlot>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl CoordinatorInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, PathSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release `id` on `key` and hand the slot to the next live waiter.
    fn end_operation(&self, key: &str, id: u64) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        if slot.active.as_ref().map(|a| a.id) != Some(id) {
            // Already force-released; the slot belongs to someone else now.
            return;
        }
        slot.active = None;

        while let Some(waiter) = slot.queue.pop_front() {
            slot.active = Some(ActiveOperation {
                id: waiter.id,
                label: waiter.label.clone(),
                started_at: Instant::now(),
            });
            if waiter.tx.send(()).is_ok() {
                return;
            }
            slot.active = None;
        }
        slots.remove(key);
    }
}

/// Held while an operation owns its path. Dropping it ends the operation.
pub struct OperationGuard {
    coordinator: Arc<CoordinatorInner>,
    key: String,
    id: u64,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.coordinator.end_operation(&self.key, self.id);
    }
}

#[derive(Clone)]
pub struct WatcherCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl WatcherCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                timeout,
            }),
        }
    }

    /// Wait until `path` is free, then own it until the guard is dropped.
    pub async fn start_operation(&self, path: &str, label: &str) -> OperationGuard {
        let key = normalize_path(path);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut rx = {
            let mut slots = self.inner.slots();
            let slot = slots.entry(key.clone()).or_default();
            if slot.active.is_none() {
                slot.active = Some(ActiveOperation {
                    id,
                    label: label.to_string(),
                    started_at: Instant::now(),
                });
                return self.guard(key, id);
            }
            let (tx, rx) = oneshot::channel();
            log::debug!(
                "[lexera.coordinator] {} on {} queued behind {:?}",
                label,
                key,
                slot.active.as_ref().map(|a| a.label.as_str())
            );
            slot.queue.push_back(Waiter {
                id,
                label: label.to_string(),
                tx,
            });
            rx
        };

        loop {
            match tokio::time::timeout(self.inner.timeout, &mut rx).await {
                Ok(_) => return self.guard(key, id),
                Err(_) => {
                    if self.try_force_acquire(&key, id, label) {
                        return self.guard(key, id);
                    }
                }
            }
        }
    }

    /// Take the slot from a stuck operation. Returns false if the active
    /// operation is still within its time budget.
    fn try_force_acquire(&self, key: &str, id: u64, label: &str) -> bool {
        let mut slots = self.inner.slots();
        let slot = slots.entry(key.to_string()).or_default();

        if slot.active.as_ref().map(|a| a.id) == Some(id) {
            // Granted between the timeout and taking the lock
            return true;
        }
        let stuck = slot
            .active
            .as_ref()
            .map_or(true, |a| a.started_at.elapsed() >= self.inner.timeout);
        if !stuck {
            return false;
        }

        if let Some(previous) = slot.active.take() {
            log::warn!(
                "[lexera.coordinator] Force-releasing {} on {} after {:?}",
                previous.label,
                key,
                previous.started_at.elapsed()
            );
        }
        slot.queue.retain(|w| w.id != id);
        slot.active = Some(ActiveOperation {
            id,
            label: label.to_string(),
            started_at: Instant::now(),
        });
        true
    }

    fn guard(&self, key: String, id: u64) -> OperationGuard {
        OperationGuard {
            coordinator: self.inner.clone(),
            key,
            id,
        }
    }

    /// Label of the operation currently owning `path`, if any.
    pub fn active_operation(&self, path: &str) -> Option<String> {
        self.inner
            .slots()
            .get(&normalize_path(path))
            .and_then(|s| s.active.as_ref().map(|a| a.label.clone()))
    }

    /// Number of operations waiting on `path`.
    pub fn queued_count(&self, path: &str) -> usize {
        self.inner
            .slots()
            .get(&normalize_path(path))
            .map_or(0, |s| s.queue.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_free_path_is_granted_immediately() {
        let coordinator = WatcherCoordinator::new(Duration::from_secs(30));
        let guard = coordinator.start_operation("a.md", "reload").await;
        assert_eq!(coordinator.active_operation("A.md").as_deref(), Some("reload"));
        drop(guard);
        assert!(coordinator.active_operation("a.md").is_none());
    }

    #[tokio::test]
    async fn test_waiters_are_served_fifo() {
        let coordinator = WatcherCoordinator::new(Duration::from_secs(30));
        let first = coordinator.start_operation("a.md", "save").await;

        let c2 = coordinator.clone();
        let second = tokio::spawn(async move {
            let _g = c2.start_operation("a.md", "reload-1").await;
            "reload-1"
        });
        let c3 = coordinator.clone();
        let third = tokio::spawn(async move {
            let _g = c3.start_operation("./A.md", "reload-2").await;
            "reload-2"
        });

        while coordinator.queued_count("a.md") < 2 {
            tokio::task::yield_now().await;
        }
        drop(first);

        assert_eq!(second.await.unwrap(), "reload-1");
        assert_eq!(third.await.unwrap(), "reload-2");
        assert!(coordinator.active_operation("a.md").is_none());
    }

    #[tokio::test]
    async fn test_different_paths_do_not_block() {
        let coordinator = WatcherCoordinator::new(Duration::from_secs(30));
        let _a = coordinator.start_operation("a.md", "save").await;
        let _b = coordinator.start_operation("b.md", "save").await;
        assert_eq!(coordinator.active_operation("b.md").as_deref(), Some("save"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_operation_is_force_released() {
        let coordinator = WatcherCoordinator::new(Duration::from_secs(5));
        let stuck = coordinator.start_operation("a.md", "save").await;

        let next = coordinator.start_operation("a.md", "reload").await;
        assert_eq!(coordinator.active_operation("a.md").as_deref(), Some("reload"));

        // The stale guard must not release the new owner
        drop(stuck);
        assert_eq!(coordinator.active_operation("a.md").as_deref(), Some("reload"));
        drop(next);
        assert!(coordinator.active_operation("a.md").is_none());
    }
}
