/// One open board: its files, watches, undo history and state machine.
///
/// A session is an explicit instance owned by the host. Nothing here is
/// global, so several boards can be open side by side.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, Notify};

use crate::config::EngineConfig;
use crate::files::factory::MarkdownFileFactory;
use crate::files::registry::{EditCaptureSource, FileRegistry, MarkdownFileRegistry};
use crate::files::{FileError, MarkdownFile};
use crate::include::loader::IncludeLoader;
use crate::include::scanner::{scan_include_tree, IncludeTree};
use crate::parser::{BoardCodec, MarkdownCodec};
use crate::presentation::{PresentationSurface, SurfaceMessage};
use crate::state_machine::context::{ChangeError, ChangeResult};
use crate::state_machine::events::{ChangeEvent, SaveSource};
use crate::state_machine::{ChangeStateMachine, EngineDeps};
use crate::types::{read_board, shared_board, write_board, Board, ResolvedTarget, TargetKind};
use crate::undo::{infer_targets, BoardStore, UndoRestore};
use crate::watcher::registry::{FileWatchRegistry, WatchBackend};
use crate::watcher::types::FileWatchEvent;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A change is being processed, try again")]
    Busy,
    #[error(transparent)]
    File(#[from] FileError),
    #[error("Not a kanban board: {0}")]
    InvalidBoard(PathBuf),
    #[error(transparent)]
    Change(#[from] ChangeError),
    #[error("Nothing to undo")]
    NothingToUndo,
    #[error("Nothing to redo")]
    NothingToRedo,
    #[error("No board loaded")]
    NoBoard,
}

pub struct DocumentSession {
    main_path: PathBuf,
    machine: ChangeStateMachine,
    registry: Arc<MarkdownFileRegistry>,
    surface: Arc<dyn PresentationSurface>,
    codec: Arc<dyn BoardCodec>,
    watch: Option<FileWatchRegistry>,
    events: Mutex<Option<mpsc::UnboundedReceiver<FileWatchEvent>>>,
    shutdown: Arc<Notify>,
}

impl DocumentSession {
    /// Open `main_path` with OS file watching.
    #[cfg(feature = "file-watcher")]
    pub async fn open(
        main_path: &Path,
        surface: Arc<dyn PresentationSurface>,
        edit_source: Arc<dyn EditCaptureSource>,
        config: EngineConfig,
    ) -> Result<Self, SessionError> {
        let backend: Arc<dyn WatchBackend> = Arc::new(
            crate::watcher::file_watcher::NotifyBackend::new(config.watch_debounce()),
        );
        Self::open_with(main_path, surface, edit_source, config, Some(backend)).await
    }

    #[cfg(not(feature = "file-watcher"))]
    pub async fn open(
        main_path: &Path,
        surface: Arc<dyn PresentationSurface>,
        edit_source: Arc<dyn EditCaptureSource>,
        config: EngineConfig,
    ) -> Result<Self, SessionError> {
        Self::open_with(main_path, surface, edit_source, config, None).await
    }

    /// Open with an explicit watch backend, or none to disable watching.
    pub async fn open_with(
        main_path: &Path,
        surface: Arc<dyn PresentationSurface>,
        edit_source: Arc<dyn EditCaptureSource>,
        config: EngineConfig,
        backend: Option<Arc<dyn WatchBackend>>,
    ) -> Result<Self, SessionError> {
        let text = tokio::fs::read_to_string(main_path)
            .await
            .map_err(|e| FileError::io(main_path, e))?;
        let codec: Arc<dyn BoardCodec> = Arc::new(MarkdownCodec);
        if !codec.is_valid_board(&text) {
            return Err(SessionError::InvalidBoard(main_path.to_path_buf()));
        }

        let board_dir = main_path.parent().unwrap_or_else(|| Path::new("."));
        let watch = backend.map(FileWatchRegistry::new);
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = MarkdownFileFactory::new(
            board_dir,
            &config,
            watch.clone(),
            watch.as_ref().map(|_| tx),
        );

        let registry = Arc::new(MarkdownFileRegistry::new(edit_source));
        let main = factory.create_main(main_path);
        main.set_content(&text, true);
        registry.register(main.clone());

        let loader = IncludeLoader::new(codec.clone(), factory);
        let staged = shared_board(codec.parse_board(&text));
        loader
            .load_board_includes(&staged, registry.as_ref())
            .await?;
        let board = read_board(&staged).clone();
        main.set_cached_board(board.clone());
        surface.replace_board(board);

        let machine = ChangeStateMachine::new(EngineDeps {
            registry: registry.clone(),
            surface: surface.clone(),
            codec: codec.clone(),
            loader,
            config,
        });
        machine.sync_registry()?;
        surface.send(SurfaceMessage::FullBoardRefresh);

        log::info!(
            "[lexera.session] Opened {} ({} include file(s))",
            main_path.display(),
            registry.include_files().len()
        );
        Ok(Self {
            main_path: main_path.to_path_buf(),
            machine,
            registry,
            surface,
            codec,
            watch,
            events: Mutex::new(Some(rx)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn main_path(&self) -> &Path {
        &self.main_path
    }

    pub fn machine(&self) -> &ChangeStateMachine {
        &self.machine
    }

    pub fn main_file(&self) -> Option<Arc<MarkdownFile>> {
        self.registry.main_file()
    }

    pub fn file(&self, relative_path: &str) -> Option<Arc<MarkdownFile>> {
        self.registry.get_by_relative_path(relative_path)
    }

    /// Every file reachable from the board through include directives,
    /// including directives nested inside include files.
    pub fn include_tree(&self) -> IncludeTree {
        scan_include_tree(&self.main_path)
    }

    /// Snapshot of the current board.
    pub fn board(&self) -> Option<Board> {
        self.surface.board().map(|b| read_board(&b).clone())
    }

    pub fn can_undo(&self) -> bool {
        self.machine.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.machine.can_redo()
    }

    pub fn is_dirty(&self) -> bool {
        self.machine.is_dirty()
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<ChangeResult> {
        self.machine.subscribe_results()
    }

    pub async fn process_change(&self, event: ChangeEvent) -> ChangeResult {
        self.machine.process_change(event).await
    }

    /// Save the board and every include with unsaved changes.
    pub async fn save(&self) -> ChangeResult {
        let file = self
            .main_file()
            .map(|f| f.relative_path().to_string())
            .unwrap_or_default();
        self.process_change(ChangeEvent::Save {
            file,
            source: SaveSource::User,
        })
        .await
    }

    pub fn undo(&self) -> Result<Vec<ResolvedTarget>, SessionError> {
        self.restore(BoardStore::undo, SessionError::NothingToUndo)
    }

    pub fn redo(&self) -> Result<Vec<ResolvedTarget>, SessionError> {
        self.restore(BoardStore::redo, SessionError::NothingToRedo)
    }

    /// Swap in a board from the history and update the surface. Refused
    /// while a change is being processed.
    fn restore(
        &self,
        step: fn(&mut BoardStore, &Board) -> Option<UndoRestore>,
        empty: SessionError,
    ) -> Result<Vec<ResolvedTarget>, SessionError> {
        let board = self.surface.board().ok_or(SessionError::NoBoard)?;
        let restored = self
            .machine
            .with_idle(|| {
                let mut store = self.machine.store();
                let current = read_board(&board).clone();
                let restore = step(&mut store, &current)?;
                let targets = if restore.targets.is_empty() {
                    infer_targets(&current, &restore.board)
                } else {
                    restore.targets
                };
                *write_board(&board) = restore.board;
                Some(targets)
            })
            .ok_or(SessionError::Busy)?;
        let targets = restored.ok_or(empty)?;

        self.machine.sync_registry()?;
        if let Some(main) = self.registry.main_file() {
            main.set_content(&self.codec.generate_board(&read_board(&board)), false);
            main.invalidate_board_cache();
        }

        let messages = {
            let board = read_board(&board);
            let targeted: Option<Vec<SurfaceMessage>> = targets
                .iter()
                .map(|target| match target.kind {
                    TargetKind::Column => board
                        .find_column(&target.id)
                        .map(|c| SurfaceMessage::column_content(c, false)),
                    TargetKind::Task => board
                        .find_task(target.column_id.as_deref(), &target.id)
                        .map(|(c, t)| SurfaceMessage::task_content(&c.id, t, false)),
                })
                .collect();
            match targeted {
                Some(messages) if !messages.is_empty() => messages,
                _ => vec![SurfaceMessage::FullBoardRefresh],
            }
        };
        for message in messages {
            self.surface.send(message);
        }
        self.surface.send(SurfaceMessage::UndoRedoStatus {
            can_undo: self.machine.can_undo(),
            can_redo: self.machine.can_redo(),
        });
        log::debug!("[lexera.session] Restored {} target(s)", targets.len());
        Ok(targets)
    }

    /// Feed watcher events into the state machine until `close` is called.
    /// Only the first call runs; the event stream is consumed.
    pub async fn run_watch_loop(&self) {
        let rx = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            log::warn!("[lexera.session] Watch loop already started");
            return;
        };

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                event = rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    log::debug!(
                        "[lexera.session] {:?} on {}",
                        event.change_type,
                        event.relative_path
                    );
                    let result = self
                        .machine
                        .process_change(ChangeEvent::FileSystemChange {
                            file: event.relative_path,
                            change_type: event.change_type,
                            timestamp: event.timestamp,
                        })
                        .await;
                    if let Some(error) = result.error.filter(|e| *e != ChangeError::Queued) {
                        log::warn!("[lexera.session] External change not applied: {}", error);
                    }
                }
            }
        }
        log::debug!("[lexera.session] Watch loop stopped");
    }

    /// Stop the watch loop and release every file and watch.
    pub fn close(&self) {
        self.shutdown.notify_one();
        self.registry.clear();
        self.machine.store().clear();
        log::info!("[lexera.session] Closed {}", self.main_path.display());
    }
}
