/// Tracked markdown files.
///
/// A `MarkdownFile` holds the in-memory `content` of one file next to its
/// `baseline`, the last text known to match disk. Unsaved changes are always
/// computed from the two, never stored. Reloads are verified and cancellable;
/// saves are transactional and serialized per path with reloads.
pub mod factory;
pub mod registry;
pub mod transaction;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::Board;
use crate::watcher::coordinator::WatcherCoordinator;
use crate::watcher::registry::{FileWatchRegistry, WatchTicket};
use crate::watcher::types::{ContentFingerprint, FileChangeType, FileWatchEvent, WatchError};
use transaction::{FileSnapshot, SaveTransactionManager, Snapshotable};

/// Header marker every board file must carry.
pub const BOARD_MARKER: &str = "kanban-plugin: board";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileKind {
    Main,
    IncludeColumn,
    IncludeTask,
    IncludeRegular,
}

impl FileKind {
    pub fn is_include(self) -> bool {
        !matches!(self, FileKind::Main)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("Refusing to save {path}: {reason}")]
    Validation { path: PathBuf, reason: String },
    #[error("A save is already in progress for {0}")]
    TransactionInProgress(String),
    #[error("Save of {path} failed and was rolled back: {source}")]
    SaveRolledBack {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Watch(#[from] WatchError),
}

impl FileError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            FileError::NotFound(path.to_path_buf())
        } else {
            FileError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// What a call to [`MarkdownFile::reload`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Disk differed from the baseline; content and baseline now match disk.
    Reloaded,
    /// Disk matched the baseline. Nothing was touched.
    Unchanged,
    /// The file is gone.
    Missing,
    /// A newer reload started; this one stopped without touching state.
    Superseded,
}

/// Cancellation token for one reload. Stale once a newer reload has begun.
#[derive(Debug, Clone)]
pub struct ReloadToken {
    sequence: u64,
    current: Arc<AtomicU64>,
}

impl ReloadToken {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_stale(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.sequence
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Skip the board-marker and empty-overwrite checks.
    pub skip_validation: bool,
}

/// Per-file timings taken from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct ReloadTimings {
    pub verify_retries: u32,
    pub verify_backoff: Duration,
}

/// Services shared by every file of one session.
#[derive(Clone)]
pub struct FileServices {
    pub coordinator: WatcherCoordinator,
    pub transactions: SaveTransactionManager,
    pub watch: Option<FileWatchRegistry>,
    pub events: Option<mpsc::UnboundedSender<FileWatchEvent>>,
    pub timings: ReloadTimings,
}

#[derive(Debug, Clone, Default)]
struct FileState {
    content: String,
    baseline: String,
    exists: bool,
    has_file_system_changes: bool,
    is_in_edit_mode: bool,
    last_modified: Option<SystemTime>,
    skip_next_reload_detection: bool,
    saved_fingerprint: Option<ContentFingerprint>,
    cached_board: Option<Board>,
}

struct StateCell(Mutex<FileState>);

impl StateCell {
    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Snapshotable for StateCell {
    fn snapshot(&self) -> FileSnapshot {
        let state = self.lock();
        FileSnapshot {
            content: state.content.clone(),
            baseline: state.baseline.clone(),
            has_file_system_changes: state.has_file_system_changes,
            last_modified: state.last_modified,
        }
    }

    fn restore(&self, snapshot: &FileSnapshot) {
        let mut state = self.lock();
        state.content = snapshot.content.clone();
        state.baseline = snapshot.baseline.clone();
        state.has_file_system_changes = snapshot.has_file_system_changes;
        state.last_modified = snapshot.last_modified;
    }
}

pub struct MarkdownFile {
    kind: FileKind,
    path: PathBuf,
    relative_path: String,
    normalized_path: String,
    state: Arc<StateCell>,
    reload_sequence: Arc<AtomicU64>,
    services: FileServices,
    watch_ticket: Mutex<Option<WatchTicket>>,
}

impl std::fmt::Debug for MarkdownFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkdownFile")
            .field("kind", &self.kind)
            .field("relative_path", &self.relative_path)
            .field("path", &self.path)
            .finish()
    }
}

impl MarkdownFile {
    pub(crate) fn new(
        kind: FileKind,
        path: PathBuf,
        relative_path: &str,
        services: FileServices,
    ) -> Self {
        Self {
            kind,
            path,
            relative_path: relative_path.to_string(),
            normalized_path: crate::paths::normalize_path(relative_path),
            state: Arc::new(StateCell(Mutex::new(FileState {
                exists: true,
                ..FileState::default()
            }))),
            reload_sequence: Arc::new(AtomicU64::new(0)),
            services,
            watch_ticket: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn normalized_path(&self) -> &str {
        &self.normalized_path
    }

    fn coordinator_key(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    pub fn content(&self) -> String {
        self.state.lock().content.clone()
    }

    pub fn baseline(&self) -> String {
        self.state.lock().baseline.clone()
    }

    /// Replace the in-memory text. With `update_baseline` the text is also
    /// taken as matching disk.
    pub fn set_content(&self, text: &str, update_baseline: bool) {
        let mut state = self.state.lock();
        state.content = text.to_string();
        if update_baseline {
            state.baseline = text.to_string();
        }
        state.cached_board = None;
    }

    pub fn has_unsaved_changes(&self) -> bool {
        let state = self.state.lock();
        state.content != state.baseline
    }

    pub fn exists(&self) -> bool {
        self.state.lock().exists
    }

    pub fn has_file_system_changes(&self) -> bool {
        self.state.lock().has_file_system_changes
    }

    pub fn is_in_edit_mode(&self) -> bool {
        self.state.lock().is_in_edit_mode
    }

    pub fn set_edit_mode(&self, editing: bool) {
        self.state.lock().is_in_edit_mode = editing;
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.state.lock().last_modified
    }

    /// Local work and an external change collide.
    pub fn has_conflict(&self) -> bool {
        let state = self.state.lock();
        (state.content != state.baseline || state.is_in_edit_mode) && state.has_file_system_changes
    }

    /// An external change can be taken without losing anything.
    pub fn needs_reload(&self) -> bool {
        let state = self.state.lock();
        state.has_file_system_changes && !state.is_in_edit_mode && state.content == state.baseline
    }

    /// Record a change reported by the watcher.
    pub fn mark_file_system_change(&self, change_type: FileChangeType) {
        let mut state = self.state.lock();
        state.has_file_system_changes = true;
        match change_type {
            FileChangeType::Deleted => state.exists = false,
            FileChangeType::Created => state.exists = true,
            FileChangeType::Modified => {}
        }
    }

    /// Drop the external-change flag without reloading.
    pub fn ignore_file_system_change(&self) {
        self.state.lock().has_file_system_changes = false;
    }

    /// Returns true if a `modified` event was caused by our own last save.
    /// Consumes the one-shot skip flag either way.
    pub async fn consume_self_write(&self, change_type: FileChangeType) -> bool {
        let expected = {
            let mut state = self.state.lock();
            if change_type != FileChangeType::Modified || !state.skip_next_reload_detection {
                return false;
            }
            state.skip_next_reload_detection = false;
            state.saved_fingerprint.clone()
        };
        let Some(expected) = expected else {
            return false;
        };
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => ContentFingerprint::from_content(&text) == expected,
            Err(_) => false,
        }
    }

    /// Throw away local changes.
    pub fn discard_changes(&self) {
        let mut state = self.state.lock();
        state.content = state.baseline.clone();
        state.cached_board = None;
    }

    /// Keep a captured in-progress edit as local work and leave edit mode.
    /// The baseline is untouched so a pending external change still
    /// registers as a conflict.
    pub fn apply_captured_edit(&self, text: &str) {
        let mut state = self.state.lock();
        state.content = text.to_string();
        state.is_in_edit_mode = false;
        state.cached_board = None;
    }

    pub fn cached_board(&self) -> Option<Board> {
        self.state.lock().cached_board.clone()
    }

    pub fn set_cached_board(&self, board: Board) {
        self.state.lock().cached_board = Some(board);
    }

    pub fn invalidate_board_cache(&self) {
        self.state.lock().cached_board = None;
    }

    /// Start a new reload generation, making every older token stale.
    pub fn begin_reload(&self) -> ReloadToken {
        let sequence = self.reload_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        ReloadToken {
            sequence,
            current: self.reload_sequence.clone(),
        }
    }

    /// Fresh existence check against disk.
    pub async fn exists_on_disk(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Re-read the file from disk.
    ///
    /// Text equal to the baseline is a false alarm and changes nothing.
    /// Otherwise the file is re-read until two reads agree (bounded retries
    /// with backoff) so a half-written file is not taken.
    pub async fn reload(&self) -> Result<ReloadOutcome, FileError> {
        let token = self.begin_reload();
        let _op = self
            .services
            .coordinator
            .start_operation(&self.coordinator_key(), "reload")
            .await;
        self.reload_with(&token).await
    }

    async fn reload_with(&self, token: &ReloadToken) -> Result<ReloadOutcome, FileError> {
        if token.is_stale() {
            return Ok(ReloadOutcome::Superseded);
        }

        let first = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if token.is_stale() {
                    return Ok(ReloadOutcome::Superseded);
                }
                let mut state = self.state.lock();
                state.exists = false;
                state.has_file_system_changes = false;
                log::warn!("[lexera.files.reload] {} is missing", self.relative_path);
                return Ok(ReloadOutcome::Missing);
            }
            Err(e) => return Err(FileError::io(&self.path, e)),
        };
        if token.is_stale() {
            return Ok(ReloadOutcome::Superseded);
        }

        {
            let mut state = self.state.lock();
            if first == state.baseline {
                state.exists = true;
                state.has_file_system_changes = false;
                log::debug!(
                    "[lexera.files.reload] {} unchanged on disk, ignoring",
                    self.relative_path
                );
                return Ok(ReloadOutcome::Unchanged);
            }
        }

        let timings = self.services.timings;
        let mut text = first;
        for attempt in 0..timings.verify_retries {
            tokio::time::sleep(timings.verify_backoff * 2u32.saturating_pow(attempt)).await;
            if token.is_stale() {
                return Ok(ReloadOutcome::Superseded);
            }
            match tokio::fs::read_to_string(&self.path).await {
                Ok(again) if again == text => break,
                Ok(again) => {
                    log::debug!(
                        "[lexera.files.reload] {} still changing (attempt {})",
                        self.relative_path,
                        attempt + 1
                    );
                    text = again;
                }
                Err(e) => {
                    log::warn!(
                        "[lexera.files.reload] Verify read of {} failed: {}",
                        self.relative_path,
                        e
                    );
                    break;
                }
            }
        }
        if token.is_stale() {
            return Ok(ReloadOutcome::Superseded);
        }

        let modified = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok();
        let mut state = self.state.lock();
        state.content = text.clone();
        state.baseline = text;
        state.exists = true;
        state.has_file_system_changes = false;
        state.last_modified = modified;
        state.cached_board = None;
        log::info!("[lexera.files.reload] Reloaded {}", self.relative_path);
        Ok(ReloadOutcome::Reloaded)
    }

    /// Write the current content to disk.
    ///
    /// Runs inside a save transaction with the path's watch suspended. On a
    /// failed write the in-memory state is restored exactly.
    pub async fn save(&self, options: SaveOptions) -> Result<(), FileError> {
        let _op = self
            .services
            .coordinator
            .start_operation(&self.coordinator_key(), "save")
            .await;

        let content = self.content();
        if !options.skip_validation {
            self.validate_for_save(&content).await?;
        }

        let target: Arc<dyn Snapshotable> = self.state.clone();
        let tx = self
            .services
            .transactions
            .begin(&self.coordinator_key(), &target)?;
        let _quiet = self.services.watch.as_ref().map(|w| w.suspend(&self.path));

        match atomic_write(&self.path, &content).await {
            Ok(()) => {
                let modified = tokio::fs::metadata(&self.path)
                    .await
                    .and_then(|m| m.modified())
                    .ok();
                {
                    let mut state = self.state.lock();
                    state.baseline = content.clone();
                    state.exists = true;
                    state.has_file_system_changes = false;
                    state.last_modified = modified;
                    state.skip_next_reload_detection = true;
                    state.saved_fingerprint = Some(ContentFingerprint::from_content(&content));
                }
                self.services.transactions.commit(tx);
                log::info!(
                    "[lexera.files.save] Saved {} ({} bytes)",
                    self.relative_path,
                    content.len()
                );
                Ok(())
            }
            Err(e) => {
                self.services.transactions.rollback(tx);
                log::error!(
                    "[lexera.files.save] Write to {} failed, rolled back: {}",
                    self.relative_path,
                    e
                );
                Err(FileError::SaveRolledBack {
                    path: self.path.clone(),
                    source: e,
                })
            }
        }
    }

    async fn validate_for_save(&self, content: &str) -> Result<(), FileError> {
        if self.kind == FileKind::Main && !content.contains(BOARD_MARKER) {
            return Err(FileError::Validation {
                path: self.path.clone(),
                reason: format!("missing '{}' header", BOARD_MARKER),
            });
        }
        if content.trim().is_empty() {
            let on_disk = tokio::fs::metadata(&self.path).await.map(|m| m.len()).unwrap_or(0);
            if on_disk > 0 {
                return Err(FileError::Validation {
                    path: self.path.clone(),
                    reason: "refusing to overwrite non-empty file with empty content".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Write the local text next to the file as `<stem>.conflict-<unix>.md`.
    pub async fn write_conflict_backup(&self) -> Result<PathBuf, FileError> {
        let ts = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let backup = self.path.with_extension(format!("conflict-{}.md", ts));
        tokio::fs::write(&backup, self.content())
            .await
            .map_err(|e| FileError::io(&backup, e))?;
        log::info!(
            "[lexera.files.conflict] Wrote local copy of {} to {}",
            self.relative_path,
            backup.display()
        );
        Ok(backup)
    }

    /// Subscribe to OS changes of this file. A second call is a no-op.
    pub fn start_watching(&self) -> Result<(), FileError> {
        let (Some(watch), Some(events)) = (&self.services.watch, &self.services.events) else {
            return Ok(());
        };
        let mut ticket = self.watch_ticket.lock().unwrap_or_else(PoisonError::into_inner);
        if ticket.is_none() {
            *ticket = Some(watch.acquire(&self.path, &self.relative_path, events.clone())?);
        }
        Ok(())
    }

    pub fn stop_watching(&self) {
        let ticket = self
            .watch_ticket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticket) = ticket {
            ticket.release();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watch_ticket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop watching and cancel any reload still in flight.
    pub fn dispose(&self) {
        self.stop_watching();
        self.reload_sequence.fetch_add(1, Ordering::SeqCst);
        log::debug!("[lexera.files] Disposed {}", self.relative_path);
    }
}

/// Write to a temp file, fsync, then rename over the target.
async fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("lexera-sync.tmp");
    let result = async {
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::File::open(&tmp_path).await?.sync_all().await?;
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::watcher::registry::tests::CountingBackend;

    pub(crate) fn test_services() -> FileServices {
        FileServices {
            coordinator: WatcherCoordinator::new(Duration::from_secs(30)),
            transactions: SaveTransactionManager::new(Duration::from_secs(30)),
            watch: None,
            events: None,
            timings: ReloadTimings {
                verify_retries: 2,
                verify_backoff: Duration::from_millis(1),
            },
        }
    }

    fn file_at(dir: &Path, name: &str, kind: FileKind) -> MarkdownFile {
        MarkdownFile::new(kind, dir.join(name), name, test_services())
    }

    #[test]
    fn test_unsaved_is_computed() {
        let tmp = tempfile::tempdir().unwrap();
        let file = file_at(tmp.path(), "notes.md", FileKind::IncludeTask);
        file.set_content("a", true);
        assert!(!file.has_unsaved_changes());
        file.set_content("b", false);
        assert!(file.has_unsaved_changes());
        file.set_content("a", false);
        assert!(!file.has_unsaved_changes());
    }

    #[test]
    fn test_conflict_and_needs_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let file = file_at(tmp.path(), "notes.md", FileKind::IncludeTask);
        file.set_content("a", true);
        file.mark_file_system_change(FileChangeType::Modified);
        assert!(file.needs_reload());
        assert!(!file.has_conflict());

        file.set_edit_mode(true);
        assert!(file.has_conflict());
        assert!(!file.needs_reload());

        file.set_edit_mode(false);
        file.set_content("local", false);
        assert!(file.has_conflict());
    }

    #[tokio::test]
    async fn test_reload_equal_to_baseline_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "same").unwrap();
        let file = file_at(tmp.path(), "a.md", FileKind::IncludeColumn);
        file.set_content("same", true);
        file.set_content("local edit", false);
        file.mark_file_system_change(FileChangeType::Modified);

        assert_eq!(file.reload().await.unwrap(), ReloadOutcome::Unchanged);
        assert_eq!(file.content(), "local edit");
        assert_eq!(file.baseline(), "same");
        assert!(!file.has_file_system_changes());
    }

    #[tokio::test]
    async fn test_reload_takes_new_disk_text() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "new text").unwrap();
        let file = file_at(tmp.path(), "a.md", FileKind::IncludeColumn);
        file.set_content("old", true);

        assert_eq!(file.reload().await.unwrap(), ReloadOutcome::Reloaded);
        assert_eq!(file.content(), "new text");
        assert!(!file.has_unsaved_changes());
        assert!(file.last_modified().is_some());
    }

    #[tokio::test]
    async fn test_reload_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = file_at(tmp.path(), "gone.md", FileKind::IncludeTask);
        assert_eq!(file.reload().await.unwrap(), ReloadOutcome::Missing);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_stale_token_does_not_touch_state() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "disk").unwrap();
        let file = file_at(tmp.path(), "a.md", FileKind::IncludeTask);
        file.set_content("old", true);

        let older = file.begin_reload();
        let _newer = file.begin_reload();
        assert!(older.is_stale());
        assert_eq!(
            file.reload_with(&older).await.unwrap(),
            ReloadOutcome::Superseded
        );
        assert_eq!(file.content(), "old");
    }

    #[tokio::test]
    async fn test_save_writes_and_marks_self_write() {
        let tmp = tempfile::tempdir().unwrap();
        let file = file_at(tmp.path(), "a.md", FileKind::IncludeColumn);
        file.set_content("slide", false);

        file.save(SaveOptions::default()).await.unwrap();
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.md")).unwrap(), "slide");
        assert!(!file.has_unsaved_changes());
        assert!(!tmp.path().join("a.lexera-sync.tmp").exists());

        assert!(file.consume_self_write(FileChangeType::Modified).await);
        // One-shot
        assert!(!file.consume_self_write(FileChangeType::Modified).await);
    }

    #[tokio::test]
    async fn test_failed_save_restores_state() {
        let tmp = tempfile::tempdir().unwrap();
        let file = MarkdownFile::new(
            FileKind::IncludeTask,
            tmp.path().join("missing-dir").join("a.md"),
            "missing-dir/a.md",
            test_services(),
        );
        file.set_content("base", true);
        file.set_content("edited", false);
        file.mark_file_system_change(FileChangeType::Modified);
        let before = file.state.snapshot();

        let err = file.save(SaveOptions::default()).await.unwrap_err();
        assert!(matches!(err, FileError::SaveRolledBack { .. }));
        assert_eq!(file.state.snapshot(), before);
        assert!(!file.services.transactions.is_open(&file.coordinator_key()));
    }

    #[tokio::test]
    async fn test_main_file_requires_board_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let file = file_at(tmp.path(), "board.md", FileKind::Main);
        file.set_content("## just a column\n", false);
        assert!(matches!(
            file.save(SaveOptions::default()).await,
            Err(FileError::Validation { .. })
        ));
        assert!(!tmp.path().join("board.md").exists());
    }

    #[tokio::test]
    async fn test_empty_content_does_not_clobber_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "keep me").unwrap();
        let file = file_at(tmp.path(), "a.md", FileKind::IncludeTask);
        file.set_content("", false);
        assert!(file.save(SaveOptions::default()).await.is_err());
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.md")).unwrap(), "keep me");
    }

    #[tokio::test]
    async fn test_conflict_backup_next_to_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = file_at(tmp.path(), "notes.md", FileKind::IncludeTask);
        file.set_content("mine", false);
        let backup = file.write_conflict_backup().await.unwrap();
        let name = backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("notes.conflict-"));
        assert!(name.ends_with(".md"));
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "mine");
    }

    #[test]
    fn test_watch_lifecycle_shares_registry() {
        let backend = CountingBackend::default();
        let live = backend.live.clone();
        let registry = FileWatchRegistry::new(Arc::new(backend));
        let (tx, _rx) = mpsc::unbounded_channel();
        let services = FileServices {
            watch: Some(registry.clone()),
            events: Some(tx),
            ..test_services()
        };
        let path = PathBuf::from("/boards/shared.md");
        let a = MarkdownFile::new(FileKind::IncludeTask, path.clone(), "shared.md", services.clone());
        let b = MarkdownFile::new(FileKind::IncludeTask, path.clone(), "shared.md", services);

        a.start_watching().unwrap();
        a.start_watching().unwrap();
        b.start_watching().unwrap();
        assert_eq!(registry.ref_count(&path), 2);
        assert_eq!(live.load(Ordering::SeqCst), 1);

        a.dispose();
        assert_eq!(registry.ref_count(&path), 1);
        b.stop_watching();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
