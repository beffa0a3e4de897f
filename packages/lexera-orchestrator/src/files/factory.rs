use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::transaction::SaveTransactionManager;
use super::{FileKind, FileServices, MarkdownFile, ReloadTimings};
use crate::config::EngineConfig;
use crate::include::resolver::resolve_include_path;
use crate::watcher::coordinator::WatcherCoordinator;
use crate::watcher::registry::FileWatchRegistry;
use crate::watcher::types::FileWatchEvent;

/// Creates files bound to one session's coordinator, transaction manager
/// and watch registry. Include paths resolve against the board directory.
#[derive(Clone)]
pub struct MarkdownFileFactory {
    board_dir: PathBuf,
    services: FileServices,
}

impl MarkdownFileFactory {
    pub fn new(
        board_dir: &Path,
        config: &EngineConfig,
        watch: Option<FileWatchRegistry>,
        events: Option<mpsc::UnboundedSender<FileWatchEvent>>,
    ) -> Self {
        Self {
            board_dir: board_dir.to_path_buf(),
            services: FileServices {
                coordinator: WatcherCoordinator::new(config.operation_timeout()),
                transactions: SaveTransactionManager::new(config.save_transaction_timeout()),
                watch,
                events,
                timings: ReloadTimings {
                    verify_retries: config.reload_verify_retries,
                    verify_backoff: config.reload_verify_backoff(),
                },
            },
        }
    }

    pub fn board_dir(&self) -> &Path {
        &self.board_dir
    }

    pub fn coordinator(&self) -> &WatcherCoordinator {
        &self.services.coordinator
    }

    pub fn create_main(&self, path: &Path) -> Arc<MarkdownFile> {
        let relative = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Arc::new(MarkdownFile::new(
            FileKind::Main,
            path.to_path_buf(),
            &relative,
            self.services.clone(),
        ))
    }

    /// Create an include file for `relative_path` as written in the board.
    pub fn create_include(&self, kind: FileKind, relative_path: &str) -> Arc<MarkdownFile> {
        let absolute = resolve_include_path(relative_path, &self.board_dir);
        Arc::new(MarkdownFile::new(
            kind,
            absolute,
            relative_path,
            self.services.clone(),
        ))
    }
}
