/// Path → file lookup used by the change state machine.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{FileKind, MarkdownFile};
use crate::paths::normalize_path;
use crate::types::CapturedEdit;

/// Files the state machine can reach, plus the hook that stops an
/// in-progress UI edit.
#[async_trait]
pub trait FileRegistry: Send + Sync {
    fn get_by_relative_path(&self, path: &str) -> Option<Arc<MarkdownFile>>;
    fn main_file(&self) -> Option<Arc<MarkdownFile>>;
    /// Register a file, starting its watch. Replaces any file already
    /// registered under the same normalized path.
    fn register(&self, file: Arc<MarkdownFile>);
    /// Remove and dispose the file registered under `path`.
    fn unregister(&self, path: &str) -> Option<Arc<MarkdownFile>>;
    fn include_files(&self) -> Vec<Arc<MarkdownFile>>;
    /// Ask the editor to commit whatever is being typed and hand it over.
    async fn request_stop_editing(&self) -> Option<CapturedEdit>;
}

/// The editor integration that owns in-progress edits.
#[async_trait]
pub trait EditCaptureSource: Send + Sync {
    async fn stop_editing(&self) -> Option<CapturedEdit>;
}

/// Capture source for hosts without an editor.
pub struct NoEditCapture;

#[async_trait]
impl EditCaptureSource for NoEditCapture {
    async fn stop_editing(&self) -> Option<CapturedEdit> {
        None
    }
}

#[derive(Default)]
struct Entries {
    main: Option<Arc<MarkdownFile>>,
    includes: HashMap<String, Arc<MarkdownFile>>,
}

pub struct MarkdownFileRegistry {
    entries: Mutex<Entries>,
    edit_source: Arc<dyn EditCaptureSource>,
}

impl MarkdownFileRegistry {
    pub fn new(edit_source: Arc<dyn EditCaptureSource>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            edit_source,
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unregister and dispose every file.
    pub fn clear(&self) {
        let (main, includes) = {
            let mut entries = self.entries();
            (entries.main.take(), std::mem::take(&mut entries.includes))
        };
        for file in main.into_iter().chain(includes.into_values()) {
            file.dispose();
        }
    }
}

#[async_trait]
impl FileRegistry for MarkdownFileRegistry {
    fn get_by_relative_path(&self, path: &str) -> Option<Arc<MarkdownFile>> {
        let key = normalize_path(path);
        let entries = self.entries();
        if let Some(main) = entries.main.as_ref().filter(|m| m.normalized_path() == key) {
            return Some(main.clone());
        }
        entries.includes.get(&key).cloned()
    }

    fn main_file(&self) -> Option<Arc<MarkdownFile>> {
        self.entries().main.clone()
    }

    fn register(&self, file: Arc<MarkdownFile>) {
        if let Err(e) = file.start_watching() {
            log::warn!(
                "[lexera.files.registry] Could not watch {}: {}",
                file.relative_path(),
                e
            );
        }
        let replaced = {
            let mut entries = self.entries();
            if file.kind() == FileKind::Main {
                entries.main.replace(file.clone())
            } else {
                entries
                    .includes
                    .insert(file.normalized_path().to_string(), file.clone())
            }
        };
        if let Some(old) = replaced.filter(|old| !Arc::ptr_eq(old, &file)) {
            old.dispose();
        }
        log::debug!(
            "[lexera.files.registry] Registered {:?} {}",
            file.kind(),
            file.relative_path()
        );
    }

    fn unregister(&self, path: &str) -> Option<Arc<MarkdownFile>> {
        let removed = self.entries().includes.remove(&normalize_path(path));
        if let Some(file) = &removed {
            file.dispose();
            log::debug!(
                "[lexera.files.registry] Unregistered {}",
                file.relative_path()
            );
        }
        removed
    }

    fn include_files(&self) -> Vec<Arc<MarkdownFile>> {
        self.entries().includes.values().cloned().collect()
    }

    async fn request_stop_editing(&self) -> Option<CapturedEdit> {
        self.edit_source.stop_editing().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::files::factory::MarkdownFileFactory;
    use std::path::Path;

    fn factory() -> MarkdownFileFactory {
        MarkdownFileFactory::new(Path::new("/boards"), &EngineConfig::default(), None, None)
    }

    #[test]
    fn test_lookup_is_normalized() {
        let registry = MarkdownFileRegistry::new(Arc::new(NoEditCapture));
        let factory = factory();
        registry.register(factory.create_include(FileKind::IncludeTask, "Notes/Idea.md"));

        assert!(registry.get_by_relative_path("notes\\idea.md").is_some());
        assert!(registry.get_by_relative_path("./notes/IDEA.md").is_some());
        assert!(registry.get_by_relative_path("other.md").is_none());
    }

    #[test]
    fn test_main_file_is_separate() {
        let registry = MarkdownFileRegistry::new(Arc::new(NoEditCapture));
        let factory = factory();
        registry.register(factory.create_main(Path::new("/boards/board.md")));
        registry.register(factory.create_include(FileKind::IncludeColumn, "a.md"));

        assert_eq!(registry.main_file().unwrap().relative_path(), "board.md");
        assert_eq!(registry.include_files().len(), 1);
        assert!(registry.get_by_relative_path("board.md").is_some());
        assert!(registry.unregister("board.md").is_none());
    }

    #[test]
    fn test_register_replaces_same_path() {
        let registry = MarkdownFileRegistry::new(Arc::new(NoEditCapture));
        let factory = factory();
        registry.register(factory.create_include(FileKind::IncludeRegular, "a.md"));
        registry.register(factory.create_include(FileKind::IncludeColumn, "A.md"));

        let files = registry.include_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind(), FileKind::IncludeColumn);
    }

    #[tokio::test]
    async fn test_no_edit_capture() {
        let registry = MarkdownFileRegistry::new(Arc::new(NoEditCapture));
        assert!(registry.request_stop_editing().await.is_none());
    }
}
