/// OS watch backend using notify-debouncer-full.
///
/// Each handle watches the parent directory of one file (non-recursive) and
/// forwards debounced events for that file only. Debounce window comes from
/// the engine config (500ms default, for macOS FSEvents and cloud sync stability).
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebouncedEvent, Debouncer, RecommendedCache};

use super::registry::{WatchBackend, WatchHandle, WatchSink};
use super::types::{FileChangeType, WatchError};

pub struct NotifyBackend {
    debounce: Duration,
}

impl NotifyBackend {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce }
    }
}

struct NotifyHandle {
    _debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
}

impl WatchHandle for NotifyHandle {}

impl WatchBackend for NotifyBackend {
    fn watch(&self, path: &Path, sink: WatchSink) -> Result<Box<dyn WatchHandle>, WatchError> {
        let to_watch_error = |e: notify::Error| WatchError::Backend {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let target = path.to_path_buf();
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut debouncer = new_debouncer(
            self.debounce,
            None,
            move |result: Result<Vec<DebouncedEvent>, Vec<notify::Error>>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(change) = classify(&event, &target, &canonical) {
                            sink(change);
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        log::error!("[lexera.watcher.error] Watch error: {}", e);
                    }
                }
            },
        )
        .map_err(to_watch_error)?;

        debouncer
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(to_watch_error)?;
        log::info!("[lexera.watcher] Watching {:?} via {:?}", path, parent);

        Ok(Box::new(NotifyHandle {
            _debouncer: debouncer,
        }))
    }
}

/// Map a debounced event onto a change of `target`, if it concerns it.
fn classify(event: &DebouncedEvent, target: &Path, canonical: &Path) -> Option<FileChangeType> {
    let concerns_target = event
        .paths
        .iter()
        .any(|p| !is_editor_artifact(p) && (p == target || p == canonical));
    if !concerns_target {
        return None;
    }

    match event.kind {
        EventKind::Remove(_) => Some(FileChangeType::Deleted),
        EventKind::Create(_) => Some(FileChangeType::Created),
        EventKind::Modify(_) => Some(FileChangeType::Modified),
        _ => None,
    }
}

/// Swap and backup files written by editors next to the real file.
fn is_editor_artifact(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".swp") || name.ends_with('~') || name.ends_with(".lexera-sync.tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_editor_artifacts() {
        assert!(is_editor_artifact(Path::new("/b/.board.md.swp")));
        assert!(is_editor_artifact(Path::new("/b/board.md~")));
        assert!(is_editor_artifact(Path::new("/b/board.lexera-sync.tmp")));
        assert!(!is_editor_artifact(Path::new("/b/board.md")));
    }
}
