/// Include content loading.
///
/// Every load goes through `unified_load`, whether or not the file was
/// loaded before: the file is (re)registered with the right kind, its content
/// is reloaded from disk (or taken from preloaded text), and the result is
/// written into the target column or task. A missing or empty file flags the
/// target with `include_error` instead of failing the whole load.
use std::collections::HashMap;
use std::sync::Arc;

use crate::files::factory::MarkdownFileFactory;
use crate::files::registry::FileRegistry;
use crate::files::{FileKind, MarkdownFile};
use crate::parser::BoardCodec;
use crate::presentation::SurfaceMessage;
use crate::state_machine::context::ChangeError;
use crate::types::{read_board, write_board, Board, ResolvedTarget, SharedBoard, TargetKind, Task};

/// Result of loading one target.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    pub target: ResolvedTarget,
    /// Final (non-loading) update for the target.
    pub message: SurfaceMessage,
    /// Files that were missing or empty.
    pub failed_files: Vec<String>,
}

pub struct IncludeLoader {
    codec: Arc<dyn BoardCodec>,
    factory: MarkdownFileFactory,
}

impl IncludeLoader {
    pub fn new(codec: Arc<dyn BoardCodec>, factory: MarkdownFileFactory) -> Self {
        Self { codec, factory }
    }

    pub fn factory(&self) -> &MarkdownFileFactory {
        &self.factory
    }

    /// Check that the target exists and fill in the owning column of a task.
    pub fn resolve_target(
        board: &Board,
        kind: TargetKind,
        target_id: &str,
        column_id_for_task: Option<&str>,
    ) -> Option<ResolvedTarget> {
        match kind {
            TargetKind::Column => board
                .find_column(target_id)
                .map(|c| ResolvedTarget::column(&c.id)),
            TargetKind::Task => board
                .find_task(column_id_for_task, target_id)
                .map(|(c, t)| ResolvedTarget::task(&t.id, Some(c.id.clone()))),
        }
    }

    /// Registered file for `path` of the given kind, replacing a registration
    /// of the wrong kind.
    pub fn ensure_file(
        &self,
        registry: &dyn FileRegistry,
        path: &str,
        kind: FileKind,
    ) -> Arc<MarkdownFile> {
        if let Some(existing) = registry.get_by_relative_path(path) {
            if existing.kind() == kind {
                return existing;
            }
            log::warn!(
                "[lexera.include.load] {} registered as {:?}, expected {:?}; recreating",
                path,
                existing.kind(),
                kind
            );
        }
        let file = self.factory.create_include(kind, path);
        registry.register(file.clone());
        file
    }

    /// Current text of `file`, or None when it is missing or empty.
    async fn read_include(&self, file: &MarkdownFile, preloaded: Option<&String>) -> Option<String> {
        match preloaded {
            Some(text) => file.set_content(text, true),
            None => {
                if let Err(e) = file.reload().await {
                    log::warn!(
                        "[lexera.include.load] Reload of {} failed: {}",
                        file.relative_path(),
                        e
                    );
                }
            }
        }
        let exists = preloaded.is_some() || file.exists_on_disk().await;
        let content = file.content();
        if !exists || content.trim().is_empty() {
            return None;
        }
        Some(content)
    }

    /// Load `files` into `target`, in order. An empty list removes the include.
    pub async fn unified_load(
        &self,
        board: &SharedBoard,
        target: &ResolvedTarget,
        files: &[String],
        preloaded: &HashMap<String, String>,
        registry: &dyn FileRegistry,
    ) -> Result<LoadOutcome, ChangeError> {
        let kind = match target.kind {
            TargetKind::Column => FileKind::IncludeColumn,
            TargetKind::Task => FileKind::IncludeTask,
        };

        let mut loaded: Vec<(String, String)> = Vec::new();
        let mut failed_files = Vec::new();
        for path in files {
            let file = self.ensure_file(registry, path, kind);
            match self.read_include(&file, preloaded.get(path)).await {
                Some(content) => loaded.push((path.clone(), content)),
                None => {
                    log::warn!("[lexera.include.load] Include {} is missing or empty", path);
                    failed_files.push(path.clone());
                }
            }
        }

        let mut board = write_board(board);
        let include_error = !failed_files.is_empty();
        let message = match target.kind {
            TargetKind::Column => {
                let tasks: Vec<Task> = loaded
                    .iter()
                    .flat_map(|(_, content)| self.codec.parse_presentation(content))
                    .collect();
                let column = board
                    .find_column_mut(&target.id)
                    .ok_or_else(|| ChangeError::TargetNotFound(target.id.clone()))?;
                column.tasks = tasks;
                column.include_mode = !files.is_empty();
                column.include_files = files.to_vec();
                column.include_error = include_error;
                SurfaceMessage::column_content(column, false)
            }
            TargetKind::Task => {
                let (column_id, task) = board
                    .find_task_mut(target.column_id.as_deref(), &target.id)
                    .ok_or_else(|| ChangeError::TargetNotFound(target.id.clone()))?;
                task.include_mode = !files.is_empty();
                task.include_files = files.to_vec();
                task.include_error = include_error;
                task.description = loaded
                    .iter()
                    .map(|(_, content)| content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                task.display_title = files.first().map(|p| format!("# include in {}", p));
                if files.is_empty() {
                    task.original_title = None;
                }
                SurfaceMessage::task_content(&column_id, task, false)
            }
        };

        log::debug!(
            "[lexera.include.load] Loaded {} file(s) into {:?} {} ({} failed)",
            loaded.len(),
            target.kind,
            target.id,
            failed_files.len()
        );
        Ok(LoadOutcome {
            target: target.clone(),
            message,
            failed_files,
        })
    }

    /// Load every include column and include task of the board.
    pub async fn load_board_includes(
        &self,
        board: &SharedBoard,
        registry: &dyn FileRegistry,
    ) -> Result<Vec<LoadOutcome>, ChangeError> {
        let targets = include_targets(&read_board(board));
        let mut outcomes = Vec::with_capacity(targets.len());
        for (target, files) in targets {
            outcomes.push(
                self.unified_load(board, &target, &files, &HashMap::new(), registry)
                    .await?,
            );
        }
        Ok(outcomes)
    }
}

/// Include columns and include tasks of `board`, with their files.
pub fn include_targets(board: &Board) -> Vec<(ResolvedTarget, Vec<String>)> {
    let mut targets = Vec::new();
    for column in &board.columns {
        if column.include_mode {
            targets.push((ResolvedTarget::column(&column.id), column.include_files.clone()));
            continue;
        }
        for task in column.tasks.iter().filter(|t| t.include_mode) {
            targets.push((
                ResolvedTarget::task(&task.id, Some(column.id.clone())),
                task.include_files.clone(),
            ));
        }
    }
    targets
}

/// Targets that include `path` as a column or task include.
pub fn targets_including(board: &Board, path: &str) -> Vec<(ResolvedTarget, Vec<String>)> {
    include_targets(board)
        .into_iter()
        .filter(|(_, files)| crate::paths::contains_path(files, path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::files::registry::{MarkdownFileRegistry, NoEditCapture};
    use crate::parser::MarkdownCodec;
    use crate::types::{shared_board, Column};

    struct Fixture {
        _dir: tempfile::TempDir,
        loader: IncludeLoader,
        registry: MarkdownFileRegistry,
        board: SharedBoard,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let mut config = EngineConfig::default();
        config.reload_verify_backoff_ms = 1;
        let factory = MarkdownFileFactory::new(dir.path(), &config, None, None);

        let mut column = Column::new("Slides");
        column.id = "col-1".to_string();
        let mut notes = Column::new("Notes");
        notes.id = "col-2".to_string();
        let mut task = Task::new("!!!include(idea.md)!!!", "");
        task.id = "task-1".to_string();
        notes.tasks.push(task);

        Fixture {
            _dir: dir,
            loader: IncludeLoader::new(Arc::new(MarkdownCodec), factory),
            registry: MarkdownFileRegistry::new(Arc::new(NoEditCapture)),
            board: shared_board(Board {
                valid: true,
                columns: vec![column, notes],
                ..Board::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_column_load_parses_slides_in_order() {
        let fx = fixture(&[
            ("a.md", "# A1\n\n---\n\n# A2\n"),
            ("b.md", "# B1\n"),
        ]);
        let target = ResolvedTarget::column("col-1");
        let files = vec!["a.md".to_string(), "b.md".to_string()];

        let outcome = fx
            .loader
            .unified_load(&fx.board, &target, &files, &HashMap::new(), &fx.registry)
            .await
            .unwrap();

        let board = read_board(&fx.board);
        let titles: Vec<&str> = board.columns[0].tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["# A1", "# A2", "# B1"]);
        assert!(board.columns[0].include_mode);
        assert!(!board.columns[0].include_error);
        assert!(!outcome.message.is_loading());
        assert_eq!(fx.registry.include_files().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_sets_include_error() {
        let fx = fixture(&[("a.md", "# A1\n")]);
        let target = ResolvedTarget::column("col-1");
        let files = vec!["a.md".to_string(), "gone.md".to_string()];

        let outcome = fx
            .loader
            .unified_load(&fx.board, &target, &files, &HashMap::new(), &fx.registry)
            .await
            .unwrap();

        assert_eq!(outcome.failed_files, vec!["gone.md"]);
        let board = read_board(&fx.board);
        assert!(board.columns[0].include_error);
        assert_eq!(board.columns[0].tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_task_load_sets_description_and_display_title() {
        let fx = fixture(&[("idea.md", "Body of the idea\n")]);
        let target = ResolvedTarget::task("task-1", Some("col-2".to_string()));

        fx.loader
            .unified_load(&fx.board, &target, &["idea.md".to_string()], &HashMap::new(), &fx.registry)
            .await
            .unwrap();

        let board = read_board(&fx.board);
        let task = &board.columns[1].tasks[0];
        assert_eq!(task.description, "Body of the idea\n");
        assert_eq!(task.display_title.as_deref(), Some("# include in idea.md"));
        assert!(task.include_mode);
    }

    #[tokio::test]
    async fn test_empty_file_list_clears_target() {
        let fx = fixture(&[("a.md", "# A1\n")]);
        let target = ResolvedTarget::column("col-1");
        fx.loader
            .unified_load(&fx.board, &target, &["a.md".to_string()], &HashMap::new(), &fx.registry)
            .await
            .unwrap();
        fx.loader
            .unified_load(&fx.board, &target, &[], &HashMap::new(), &fx.registry)
            .await
            .unwrap();

        let board = read_board(&fx.board);
        assert!(board.columns[0].tasks.is_empty());
        assert!(!board.columns[0].include_mode);
        assert!(board.columns[0].include_files.is_empty());
    }

    #[tokio::test]
    async fn test_preloaded_content_skips_disk() {
        let fx = fixture(&[]);
        let target = ResolvedTarget::column("col-1");
        let mut preloaded = HashMap::new();
        preloaded.insert("new.md".to_string(), "# Fresh\n".to_string());

        fx.loader
            .unified_load(&fx.board, &target, &["new.md".to_string()], &preloaded, &fx.registry)
            .await
            .unwrap();

        let board = read_board(&fx.board);
        assert_eq!(board.columns[0].tasks[0].title, "# Fresh");
        assert!(!board.columns[0].include_error);
    }

    #[tokio::test]
    async fn test_wrong_kind_registration_is_replaced() {
        let fx = fixture(&[("a.md", "# A1\n")]);
        fx.registry
            .register(fx.loader.factory().create_include(FileKind::IncludeRegular, "a.md"));

        let file = fx.loader.ensure_file(&fx.registry, "A.md", FileKind::IncludeColumn);
        assert_eq!(file.kind(), FileKind::IncludeColumn);
        assert_eq!(
            fx.registry.get_by_relative_path("a.md").unwrap().kind(),
            FileKind::IncludeColumn
        );
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let fx = fixture(&[]);
        let result = fx
            .loader
            .unified_load(
                &fx.board,
                &ResolvedTarget::column("nope"),
                &[],
                &HashMap::new(),
                &fx.registry,
            )
            .await;
        assert_eq!(result.unwrap_err(), ChangeError::TargetNotFound("nope".to_string()));
    }

    #[test]
    fn test_targets_including() {
        let mut board = Board::default();
        let mut col = Column::new("A");
        col.include_mode = true;
        col.include_files = vec!["Shared.md".to_string()];
        board.columns.push(col);
        assert_eq!(targets_including(&board, "./shared.md").len(), 1);
        assert!(targets_including(&board, "other.md").is_empty());
    }
}
