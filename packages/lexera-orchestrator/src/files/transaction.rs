/// Save transactions: snapshot before a write, restore it if the write fails.
///
/// At most one transaction per normalized path is open at a time. A transaction that is
/// neither committed nor rolled back within the timeout is rolled back by a
/// timer task (when a tokio runtime is available) or lazily on the next
/// `begin` for the same path.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use super::FileError;
use crate::paths::normalize_path;

/// The in-memory fields a save may touch.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSnapshot {
    pub content: String,
    pub baseline: String,
    pub has_file_system_changes: bool,
    pub last_modified: Option<SystemTime>,
}

/// Implemented by whatever owns the snapshotted state.
pub trait Snapshotable: Send + Sync {
    fn snapshot(&self) -> FileSnapshot;
    fn restore(&self, snapshot: &FileSnapshot);
}

struct OpenTransaction {
    id: u64,
    snapshot: FileSnapshot,
    target: Weak<dyn Snapshotable>,
    started_at: Instant,
}

struct ManagerInner {
    open: Mutex<HashMap<String, OpenTransaction>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl ManagerInner {
    fn open(&self) -> MutexGuard<'_, HashMap<String, OpenTransaction>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the transaction `id` on `key` and restore its snapshot.
    fn rollback(&self, key: &str, id: u64) -> bool {
        let removed = {
            let mut open = self.open();
            match open.get(key) {
                Some(tx) if tx.id == id => open.remove(key),
                _ => None,
            }
        };
        let Some(tx) = removed else {
            return false;
        };
        if let Some(target) = tx.target.upgrade() {
            target.restore(&tx.snapshot);
        }
        true
    }
}

/// Handle for one open transaction. Consumed by commit or rollback.
#[derive(Debug)]
pub struct SaveTransaction {
    key: String,
    id: u64,
}

impl SaveTransaction {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Clone)]
pub struct SaveTransactionManager {
    inner: Arc<ManagerInner>,
}

impl SaveTransactionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                open: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                timeout,
            }),
        }
    }

    /// Snapshot `target` and open a transaction for `key`.
    pub fn begin(
        &self,
        key: &str,
        target: &Arc<dyn Snapshotable>,
    ) -> Result<SaveTransaction, FileError> {
        let normalized = normalize_path(key);
        let key = normalized.as_str();
        self.reap_expired(key);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut open = self.inner.open();
            if open.contains_key(key) {
                return Err(FileError::TransactionInProgress(key.to_string()));
            }
            open.insert(
                key.to_string(),
                OpenTransaction {
                    id,
                    snapshot: target.snapshot(),
                    target: Arc::downgrade(target),
                    started_at: Instant::now(),
                },
            );
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&self.inner);
            let timer_key = key.to_string();
            let timeout = self.inner.timeout;
            handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    if inner.rollback(&timer_key, id) {
                        log::warn!(
                            "[lexera.files.transaction] Save of {} timed out after {:?}, rolled back",
                            timer_key,
                            timeout
                        );
                    }
                }
            });
        }

        Ok(SaveTransaction {
            key: key.to_string(),
            id,
        })
    }

    /// Close the transaction, keeping the new state.
    pub fn commit(&self, tx: SaveTransaction) {
        let mut open = self.inner.open();
        if open.get(&tx.key).map(|t| t.id) == Some(tx.id) {
            open.remove(&tx.key);
        }
    }

    /// Restore the snapshot taken at `begin`. Returns false if the
    /// transaction had already been closed (e.g. by the timeout).
    pub fn rollback(&self, tx: SaveTransaction) -> bool {
        self.inner.rollback(&tx.key, tx.id)
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.inner.open().contains_key(&normalize_path(key))
    }

    fn reap_expired(&self, key: &str) {
        let expired = {
            let open = self.inner.open();
            open.get(key)
                .filter(|tx| tx.started_at.elapsed() >= self.inner.timeout)
                .map(|tx| tx.id)
        };
        if let Some(id) = expired {
            if self.inner.rollback(key, id) {
                log::warn!(
                    "[lexera.files.transaction] Reaped expired save transaction for {}",
                    key
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        state: Mutex<FileSnapshot>,
    }

    impl Fake {
        fn new(content: &str) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(FileSnapshot {
                    content: content.to_string(),
                    baseline: content.to_string(),
                    has_file_system_changes: false,
                    last_modified: None,
                }),
            })
        }

        fn set_content(&self, content: &str) {
            self.state.lock().unwrap().content = content.to_string();
        }
    }

    impl Snapshotable for Fake {
        fn snapshot(&self) -> FileSnapshot {
            self.state.lock().unwrap().clone()
        }

        fn restore(&self, snapshot: &FileSnapshot) {
            *self.state.lock().unwrap() = snapshot.clone();
        }
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let manager = SaveTransactionManager::new(Duration::from_secs(30));
        let fake = Fake::new("before");
        let target: Arc<dyn Snapshotable> = fake.clone();

        let tx = manager.begin("a.md", &target).unwrap();
        fake.set_content("during");
        assert!(manager.rollback(tx));
        assert_eq!(fake.snapshot().content, "before");
        assert!(!manager.is_open("a.md"));
    }

    #[tokio::test]
    async fn test_second_begin_is_rejected_while_open() {
        let manager = SaveTransactionManager::new(Duration::from_secs(30));
        let target: Arc<dyn Snapshotable> = Fake::new("x");

        let tx = manager.begin("a.md", &target).unwrap();
        assert!(matches!(
            manager.begin("a.md", &target),
            Err(FileError::TransactionInProgress(_))
        ));
        manager.commit(tx);
        assert!(manager.begin("a.md", &target).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfinished_transaction_rolls_back_after_timeout() {
        let manager = SaveTransactionManager::new(Duration::from_secs(2));
        let fake = Fake::new("before");
        let target: Arc<dyn Snapshotable> = fake.clone();

        let tx = manager.begin("a.md", &target).unwrap();
        fake.set_content("abandoned");
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!manager.is_open("a.md"));
        assert_eq!(fake.snapshot().content, "before");
        // Late rollback is a no-op
        assert!(!manager.rollback(tx));
    }

    #[tokio::test]
    async fn test_spellings_of_one_path_share_a_transaction() {
        let manager = SaveTransactionManager::new(Duration::from_secs(30));
        let target: Arc<dyn Snapshotable> = Fake::new("x");

        let tx = manager.begin("Boards\\Todo.md", &target).unwrap();
        assert_eq!(tx.key(), "boards/todo.md");
        assert!(manager.is_open("boards/TODO.md"));
        assert!(matches!(
            manager.begin("./boards/todo.md", &target),
            Err(FileError::TransactionInProgress(_))
        ));
        manager.commit(tx);
        assert!(!manager.is_open("Boards\\Todo.md"));
    }

    #[test]
    fn test_expired_transaction_reaped_without_runtime() {
        let manager = SaveTransactionManager::new(Duration::ZERO);
        let fake = Fake::new("before");
        let target: Arc<dyn Snapshotable> = fake.clone();

        let _stale = manager.begin("a.md", &target).unwrap();
        fake.set_content("abandoned");
        let fresh = manager.begin("a.md", &target).unwrap();

        assert_eq!(fake.snapshot().content, "before");
        manager.commit(fresh);
        assert!(!manager.is_open("a.md"));
    }
}
