/// Change orchestration.
///
/// Every mutation of the document (watcher change, user edit, save, include
/// switch) enters through [`ChangeStateMachine::process_change`] and runs
/// through the same sequence of states. Only one change is in flight at a
/// time; changes arriving meanwhile are queued FIFO and their callers get a
/// `queued` result right away.
pub mod context;
pub mod events;
pub mod states;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::config::{DuplicateIncludePolicy, EngineConfig};
use crate::files::registry::FileRegistry;
use crate::files::{FileKind, MarkdownFile, ReloadOutcome, SaveOptions};
use crate::include::loader::{targets_including, IncludeLoader};
use crate::include::resolver::{collect_board_includes, count_include_references};
use crate::include::syntax::{extract_include_paths, replace_includes};
use crate::parser::BoardCodec;
use crate::paths::{is_same_file, normalize_path, normalized_difference};
use crate::presentation::{ConflictChoice, PresentationSurface, SurfaceMessage, UnsavedChoice};
use crate::types::{
    read_board, shared_board, write_board, Board, CapturedEdit, Column, EditField,
    ResolvedTarget, SharedBoard, TargetKind,
};
use crate::undo::{resolve_targets, BoardStore, UndoEntry, UndoProvenance};
use context::{ChangeContext, ChangeError, ChangeResult, RollbackSnapshot};
use events::{ChangeEvent, EditParams, EditType, IncludeSwitchRequest};
use states::ChangeState;

/// Collaborators the state machine drives.
pub struct EngineDeps {
    pub registry: Arc<dyn FileRegistry>,
    pub surface: Arc<dyn PresentationSurface>,
    pub codec: Arc<dyn BoardCodec>,
    pub loader: IncludeLoader,
    pub config: EngineConfig,
}

#[derive(Default)]
struct ChangeQueue {
    busy: bool,
    pending: VecDeque<ChangeEvent>,
}

struct MachineInner {
    deps: EngineDeps,
    store: Mutex<BoardStore>,
    queue: Mutex<ChangeQueue>,
    /// Set while an include switch loads, so nothing regenerates ids under it.
    include_switch_in_progress: AtomicBool,
    results: broadcast::Sender<ChangeResult>,
}

#[derive(Clone)]
pub struct ChangeStateMachine {
    inner: Arc<MachineInner>,
}

/// Holds the machine busy for one `process_change` call. Dropping it
/// without a clean release (the caller's future was dropped mid-run) frees
/// the machine and the include switch flag; whatever is still queued runs
/// on the next call.
struct InFlight<'a> {
    machine: &'a ChangeStateMachine,
    released: bool,
}

impl<'a> InFlight<'a> {
    fn new(machine: &'a ChangeStateMachine) -> Self {
        Self {
            machine,
            released: false,
        }
    }

    /// Next queued change, or release the machine when there is none.
    /// Both happen under one lock so no change is stranded in between.
    fn next_or_release(&mut self) -> Option<ChangeEvent> {
        let mut queue = self.machine.queue();
        let next = queue.pending.pop_front();
        if next.is_none() {
            queue.busy = false;
            self.released = true;
        }
        next
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.machine
            .inner
            .include_switch_in_progress
            .store(false, Ordering::SeqCst);
        let mut queue = self.machine.queue();
        queue.busy = false;
        log::warn!(
            "[lexera.state] Change abandoned mid-run, {} queued change(s) wait for the next call",
            queue.pending.len()
        );
    }
}

impl ChangeStateMachine {
    pub fn new(deps: EngineDeps) -> Self {
        let (results, _) = broadcast::channel(64);
        let capacity = deps.config.undo_capacity;
        Self {
            inner: Arc::new(MachineInner {
                deps,
                store: Mutex::new(BoardStore::new(capacity)),
                queue: Mutex::new(ChangeQueue::default()),
                include_switch_in_progress: AtomicBool::new(false),
                results,
            }),
        }
    }

    fn deps(&self) -> &EngineDeps {
        &self.inner.deps
    }

    fn queue(&self) -> MutexGuard<'_, ChangeQueue> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn store(&self) -> MutexGuard<'_, BoardStore> {
        self.inner.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self) -> bool {
        self.queue().busy
    }

    pub fn queued_count(&self) -> usize {
        self.queue().pending.len()
    }

    pub fn include_switch_in_progress(&self) -> bool {
        self.inner.include_switch_in_progress.load(Ordering::SeqCst)
    }

    pub fn can_undo(&self) -> bool {
        self.store().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.store().can_redo()
    }

    pub fn is_dirty(&self) -> bool {
        self.store().is_dirty()
    }

    /// Every completed change, including those that ran from the queue.
    pub fn subscribe_results(&self) -> broadcast::Receiver<ChangeResult> {
        self.inner.results.subscribe()
    }

    /// Run `f` while no change is in flight, keeping new changes from
    /// starting until it returns. None if a change is running.
    pub(crate) fn with_idle<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let queue = self.queue();
        if queue.busy {
            return None;
        }
        let result = f();
        drop(queue);
        Some(result)
    }

    /// Process one change, or queue it when another is in flight.
    ///
    /// Changes left queued by a run whose caller dropped it go first, so
    /// FIFO order holds across an abandoned run.
    pub async fn process_change(&self, event: ChangeEvent) -> ChangeResult {
        let backlog = {
            let mut queue = self.queue();
            if queue.busy {
                log::debug!(
                    "[lexera.state] Busy, queued {} (pending: {})",
                    event.kind(),
                    queue.pending.len() + 1
                );
                queue.pending.push_back(event.clone());
                return ChangeResult::queued(event);
            }
            queue.busy = true;
            queue.pending.len()
        };
        let mut in_flight = InFlight::new(self);

        for _ in 0..backlog {
            let earlier = self.queue().pending.pop_front();
            let Some(earlier) = earlier else {
                break;
            };
            let earlier_result = self.run(earlier).await;
            let _ = self.inner.results.send(earlier_result);
        }

        let result = self.run(event).await;
        let _ = self.inner.results.send(result.clone());

        while let Some(next) = in_flight.next_or_release() {
            let queued_result = self.run(next).await;
            let _ = self.inner.results.send(queued_result);
        }

        result
    }

    async fn run(&self, event: ChangeEvent) -> ChangeResult {
        let mut ctx = ChangeContext::new(event);
        log::debug!("[lexera.state] Processing {}", ctx.event.kind());

        let mut state = ChangeState::Idle;
        let mut next = ChangeState::ReceivingChange;
        loop {
            if !state.can_transition_to(next) {
                let err = ChangeError::IllegalTransition {
                    from: state,
                    to: next,
                };
                log::error!("[lexera.state.error] {}", err);
                ctx.result.error = Some(err);
                next = ChangeState::Error;
            }
            log::debug!("[lexera.state] {} -> {}", state, next);
            state = next;
            ctx.enter(state);
            if state.is_terminal() {
                break;
            }

            next = match self.step(state, &mut ctx).await {
                Ok(next) => next,
                Err(e) => {
                    log::error!(
                        "[lexera.state.error] {} failed in {}: {}",
                        ctx.event.kind(),
                        state,
                        e
                    );
                    ctx.result.error = Some(e);
                    ChangeState::Error
                }
            };
        }

        self.finish(state, &mut ctx);
        ctx.enter(ChangeState::Idle);

        ChangeResult {
            success: ctx.result.success,
            error: ctx.result.error.clone(),
            duration: ctx.started_at.elapsed(),
            context: ctx,
        }
    }

    async fn step(
        &self,
        state: ChangeState,
        ctx: &mut ChangeContext,
    ) -> Result<ChangeState, ChangeError> {
        match state {
            ChangeState::ReceivingChange => {
                self.board()?;
                Ok(ChangeState::AnalyzingImpact)
            }
            ChangeState::AnalyzingImpact => self.analyze_impact(ctx).await,
            ChangeState::CheckingEditState => Ok(self.check_edit_state(ctx)),
            ChangeState::CapturingEdit => self.capture_edit(ctx).await,
            ChangeState::CheckingUnsaved => Ok(self.check_unsaved(ctx)),
            ChangeState::PromptingUser => self.prompt_user(ctx).await,
            ChangeState::SavingUnsaved => self.save_unsaved(ctx).await,
            ChangeState::ClearingCache => self.clear_cache(ctx),
            ChangeState::LoadingNew => self.load_new(ctx).await,
            ChangeState::UpdatingBackend => self.update_backend(ctx).await,
            ChangeState::SyncingFrontend => Ok(self.sync_frontend(ctx)),
            ChangeState::Idle
            | ChangeState::Complete
            | ChangeState::Cancelled
            | ChangeState::Error => Err(ChangeError::Unexpected(format!(
                "no handler for {}",
                state
            ))),
        }
    }

    fn board(&self) -> Result<SharedBoard, ChangeError> {
        self.deps().surface.board().ok_or(ChangeError::NoBoard)
    }

    fn file(&self, path: &str) -> Option<Arc<MarkdownFile>> {
        self.deps().registry.get_by_relative_path(path)
    }

    // ANALYZING_IMPACT

    async fn analyze_impact(&self, ctx: &mut ChangeContext) -> Result<ChangeState, ChangeError> {
        let board = self.board()?;
        match ctx.event.clone() {
            ChangeEvent::FileSystemChange {
                file, change_type, ..
            } => {
                let Some(tracked) = self.file(&file) else {
                    log::debug!("[lexera.state] {} is not tracked, ignoring", file);
                    return Ok(ChangeState::Complete);
                };
                if tracked.consume_self_write(change_type).await {
                    log::debug!("[lexera.state] Ignoring our own write to {}", file);
                    return Ok(ChangeState::Complete);
                }
                tracked.mark_file_system_change(change_type);
                ctx.impact.affected_files.push(file.clone());
                if tracked.kind() == FileKind::Main {
                    ctx.impact.main_file_changed = true;
                } else {
                    ctx.impact.include_files_changed = true;
                    ctx.impact.targets = targets_including(&read_board(&board), &file)
                        .into_iter()
                        .map(|(target, _)| target)
                        .collect();
                }
            }
            ChangeEvent::UserEdit { edit_type, params } => {
                ctx.impact.board_mutated = true;
                ctx.impact.main_file_changed = true;
                if let Some(main) = self.deps().registry.main_file() {
                    ctx.impact.affected_files.push(main.relative_path().to_string());
                }
                let switch = {
                    let board = read_board(&board);
                    ctx.impact.targets = resolve_targets(&ctx.event, &board);
                    validate_edit_target(&board, edit_type, &params)?;
                    title_switch(&board, edit_type, &params)
                };
                if let Some((target, request)) = switch {
                    self.plan_switch(ctx, &board, target, request, params.value.clone())?;
                }
            }
            ChangeEvent::Save { file, .. } => {
                let tracked = self
                    .file(&file)
                    .ok_or_else(|| ChangeError::TargetNotFound(file.clone()))?;
                ctx.impact.main_file_changed = tracked.kind() == FileKind::Main;
                ctx.impact.include_files_changed = tracked.kind().is_include();
                ctx.impact.affected_files.push(file);
            }
            ChangeEvent::IncludeSwitch {
                target,
                target_id,
                column_id_for_task,
                old_files,
                new_files,
                new_title,
                ..
            } => {
                let resolved = IncludeLoader::resolve_target(
                    &read_board(&board),
                    target,
                    &target_id,
                    column_id_for_task.as_deref(),
                )
                .ok_or_else(|| ChangeError::TargetNotFound(target_id.clone()))?;
                ctx.impact.board_mutated = true;
                self.plan_switch(
                    ctx,
                    &board,
                    resolved,
                    IncludeSwitchRequest {
                        old_files,
                        new_files,
                    },
                    new_title,
                )?;
            }
        }
        log::debug!("[lexera.state] Impact: {:?}", ctx.impact);
        Ok(ChangeState::CheckingEditState)
    }

    fn plan_switch(
        &self,
        ctx: &mut ChangeContext,
        board: &SharedBoard,
        target: ResolvedTarget,
        request: IncludeSwitchRequest,
        new_title: Option<String>,
    ) -> Result<(), ChangeError> {
        let plan = &mut ctx.switches;
        plan.unloading_files = normalized_difference(&request.old_files, &request.new_files);
        plan.loading_files = normalized_difference(&request.new_files, &request.old_files);
        plan.old_files = request.old_files;
        plan.new_files = request.new_files;
        plan.new_title = new_title;
        plan.target = Some(target.clone());

        self.check_duplicates(&read_board(board), &plan.loading_files)?;

        ctx.impact.includes_switched = true;
        ctx.impact.board_mutated = true;
        ctx.impact.targets = vec![target];
        ctx.impact
            .affected_files
            .extend(plan.old_files.iter().cloned());
        log::info!(
            "[lexera.state] Include switch: loading {:?}, unloading {:?}",
            ctx.switches.loading_files,
            ctx.switches.unloading_files
        );
        Ok(())
    }

    fn check_duplicates(&self, board: &Board, loading: &[String]) -> Result<(), ChangeError> {
        let policy = self.deps().config.duplicate_includes;
        if policy == DuplicateIncludePolicy::Allow {
            return Ok(());
        }
        let duplicates: Vec<&String> = loading
            .iter()
            .filter(|p| count_include_references(board, p) > 0)
            .collect();
        if duplicates.is_empty() {
            return Ok(());
        }
        let message = format!("Already included elsewhere: {:?}", duplicates);
        match policy {
            DuplicateIncludePolicy::Reject => Err(ChangeError::Validation(message)),
            _ => {
                log::warn!("[lexera.state] {}", message);
                self.deps().surface.show_warning(&message);
                Ok(())
            }
        }
    }

    // CHECKING_EDIT_STATE / CAPTURING_EDIT

    fn files_in_scope(&self, ctx: &ChangeContext) -> Vec<Arc<MarkdownFile>> {
        let mut files: Vec<Arc<MarkdownFile>> = Vec::new();
        let paths = ctx.impact.affected_files.iter().chain(&ctx.switches.old_files);
        for file in paths.filter_map(|p| self.file(p)) {
            if !files.iter().any(|f| Arc::ptr_eq(f, &file)) {
                files.push(file);
            }
        }
        if let Some(main) = self.deps().registry.main_file() {
            if !files.iter().any(|f| Arc::ptr_eq(f, &main)) {
                files.push(main);
            }
        }
        files
    }

    fn check_edit_state(&self, ctx: &ChangeContext) -> ChangeState {
        if self.files_in_scope(ctx).iter().any(|f| f.is_in_edit_mode()) {
            ChangeState::CapturingEdit
        } else {
            ChangeState::CheckingUnsaved
        }
    }

    async fn capture_edit(&self, ctx: &mut ChangeContext) -> Result<ChangeState, ChangeError> {
        let captured = self.deps().registry.request_stop_editing().await;
        let editing: Vec<Arc<MarkdownFile>> = self
            .files_in_scope(ctx)
            .into_iter()
            .filter(|f| f.is_in_edit_mode())
            .collect();

        if let Some(edit) = captured {
            log::info!(
                "[lexera.state] Captured in-progress {:?} edit of {}",
                edit.field,
                edit.target.id
            );
            self.apply_captured_edit(&edit)?;
            ctx.impact.board_mutated = true;
            ctx.edit_capture = Some(edit);
        }
        for file in editing {
            file.set_edit_mode(false);
        }
        Ok(ChangeState::CheckingUnsaved)
    }

    fn apply_captured_edit(&self, edit: &CapturedEdit) -> Result<(), ChangeError> {
        let board = self.board()?;
        let include_file = {
            let mut board = write_board(&board);
            match edit.target.kind {
                TargetKind::Task => {
                    let (_, task) = board
                        .find_task_mut(edit.target.column_id.as_deref(), &edit.target.id)
                        .ok_or_else(|| ChangeError::TargetNotFound(edit.target.id.clone()))?;
                    match edit.field {
                        EditField::Title => {
                            task.title = edit.value.clone();
                            None
                        }
                        EditField::Description => {
                            task.description = edit.value.clone();
                            task.include_files.first().filter(|_| task.include_mode).cloned()
                        }
                    }
                }
                TargetKind::Column => {
                    let column = board
                        .find_column_mut(&edit.target.id)
                        .ok_or_else(|| ChangeError::TargetNotFound(edit.target.id.clone()))?;
                    if edit.field == EditField::Title {
                        column.title = edit.value.clone();
                    }
                    None
                }
            }
        };
        // Local work in the owning file; the baseline stays at the disk state
        match include_file {
            Some(path) => {
                if let Some(file) = self.file(&path) {
                    file.apply_captured_edit(&edit.value);
                }
            }
            None => {
                if let Some(main) = self.deps().registry.main_file() {
                    let text = self.deps().codec.generate_board(&read_board(&board));
                    main.apply_captured_edit(&text);
                }
            }
        }
        Ok(())
    }

    // CHECKING_UNSAVED / PROMPTING_USER / SAVING_UNSAVED

    fn check_unsaved(&self, ctx: &mut ChangeContext) -> ChangeState {
        let unsaved: Vec<String> = ctx
            .switches
            .unloading_files
            .iter()
            .filter(|p| self.file(p).is_some_and(|f| f.has_unsaved_changes()))
            .cloned()
            .collect();
        if !unsaved.is_empty() {
            ctx.unsaved.files = unsaved;
            return ChangeState::PromptingUser;
        }

        if let ChangeEvent::FileSystemChange { file, .. } = &ctx.event {
            if let Some(tracked) = self.file(file) {
                if tracked.needs_reload() {
                    log::debug!("[lexera.state] {} has no local work, reloading", file);
                    ctx.unsaved.auto_reload = true;
                } else if tracked.has_conflict() {
                    ctx.unsaved.conflict_file = Some(file.clone());
                    return ChangeState::PromptingUser;
                }
            }
        }
        ChangeState::ClearingCache
    }

    async fn prompt_user(&self, ctx: &mut ChangeContext) -> Result<ChangeState, ChangeError> {
        let surface = self.deps().surface.clone();

        if let Some(path) = ctx.unsaved.conflict_file.clone() {
            let file = self
                .file(&path)
                .ok_or_else(|| ChangeError::TargetNotFound(path.clone()))?;
            let choice = surface.prompt_conflict(&path).await;
            log::info!("[lexera.state] Conflict on {} resolved with {:?}", path, choice);
            ctx.unsaved.conflict_choice = Some(choice);
            return match choice {
                ConflictChoice::KeepLocal => {
                    file.ignore_file_system_change();
                    Ok(ChangeState::ClearingCache)
                }
                ConflictChoice::Reload => {
                    file.discard_changes();
                    Ok(ChangeState::ClearingCache)
                }
                ConflictChoice::BackupAndReload => {
                    file.write_conflict_backup().await?;
                    file.discard_changes();
                    Ok(ChangeState::ClearingCache)
                }
                ConflictChoice::Overwrite => Ok(ChangeState::SavingUnsaved),
            };
        }

        let choice = surface.prompt_unsaved_includes(&ctx.unsaved.files).await;
        ctx.unsaved.choice = Some(choice);
        match choice {
            UnsavedChoice::Save => Ok(ChangeState::SavingUnsaved),
            UnsavedChoice::Discard => {
                for file in ctx.unsaved.files.iter().filter_map(|p| self.file(p)) {
                    file.discard_changes();
                }
                Ok(ChangeState::ClearingCache)
            }
            UnsavedChoice::Cancel => {
                log::info!("[lexera.state] Change cancelled by user");
                ctx.result.error = Some(ChangeError::UserCancelled);
                Ok(ChangeState::Cancelled)
            }
        }
    }

    async fn save_unsaved(&self, ctx: &mut ChangeContext) -> Result<ChangeState, ChangeError> {
        let paths = match &ctx.unsaved.conflict_file {
            Some(path) => vec![path.clone()],
            None => ctx.unsaved.files.clone(),
        };
        for path in paths {
            let file = self
                .file(&path)
                .ok_or_else(|| ChangeError::TargetNotFound(path.clone()))?;
            file.save(SaveOptions::default()).await?;
            ctx.result.updated_files.push(path);
        }
        Ok(ChangeState::ClearingCache)
    }

    // CLEARING_CACHE

    /// Snapshot the board for undo and the single target for error rollback.
    /// Runs once per change, before the first board mutation. The undo
    /// entry is held until the change completes.
    fn capture_before_mutation(&self, ctx: &mut ChangeContext) -> Result<(), ChangeError> {
        if ctx.pending_undo.is_some() {
            return Ok(());
        }
        let board = read_board(&self.board()?).clone();
        ctx.rollback = rollback_snapshot(&board, &ctx.impact.targets);
        ctx.pending_undo = Some(UndoEntry::new(
            board,
            ctx.impact.targets.clone(),
            UndoProvenance::Event,
        ));
        Ok(())
    }

    fn clear_cache(&self, ctx: &mut ChangeContext) -> Result<ChangeState, ChangeError> {
        if !ctx.impact.includes_switched {
            return Ok(ChangeState::LoadingNew);
        }
        let Some(target) = ctx.switches.target.clone() else {
            return Err(ChangeError::Unexpected("include switch without target".to_string()));
        };
        self.capture_before_mutation(ctx)?;

        let board = self.board()?;
        let message = {
            let mut board = write_board(&board);
            match target.kind {
                TargetKind::Column => {
                    let column = board
                        .find_column_mut(&target.id)
                        .ok_or_else(|| ChangeError::TargetNotFound(target.id.clone()))?;
                    column.title = ctx
                        .switches
                        .new_title
                        .clone()
                        .unwrap_or_else(|| replace_includes(&column.title, &ctx.switches.new_files));
                    column.tasks.clear();
                    SurfaceMessage::column_content(column, true)
                }
                TargetKind::Task => {
                    let (column_id, task) = board
                        .find_task_mut(target.column_id.as_deref(), &target.id)
                        .ok_or_else(|| ChangeError::TargetNotFound(target.id.clone()))?;
                    let title = ctx.switches.new_title.clone().unwrap_or_else(|| {
                        let current = task.original_title.as_deref().unwrap_or(&task.title);
                        replace_includes(current, &ctx.switches.new_files)
                    });
                    task.original_title = Some(title.clone());
                    task.title = title;
                    task.description.clear();
                    task.include_files.clear();
                    SurfaceMessage::task_content(&column_id, task, true)
                }
            }
        };
        self.deps().surface.send(message);
        ctx.result.messages_sent += 1;
        Ok(ChangeState::LoadingNew)
    }

    // LOADING_NEW

    async fn load_new(&self, ctx: &mut ChangeContext) -> Result<ChangeState, ChangeError> {
        let keep_local = matches!(
            ctx.unsaved.conflict_choice,
            Some(ConflictChoice::KeepLocal | ConflictChoice::Overwrite)
        );

        match ctx.event.clone() {
            _ if ctx.impact.includes_switched => self.load_switch(ctx).await?,
            ChangeEvent::FileSystemChange { file, .. } => {
                if keep_local {
                    log::debug!("[lexera.state] Keeping local text of {}", file);
                } else if ctx.impact.main_file_changed {
                    self.reload_main(ctx).await?;
                } else if ctx.impact.include_files_changed {
                    self.reload_include(ctx, &file).await?;
                }
            }
            ChangeEvent::UserEdit {
                edit_type: EditType::Import | EditType::ApplyTemplate,
                params,
            } => {
                let replacement = params
                    .board
                    .ok_or_else(|| ChangeError::Validation("no board to import".to_string()))?;
                self.load_replacement(ctx, replacement).await?;
            }
            _ => {}
        }
        Ok(ChangeState::UpdatingBackend)
    }

    async fn load_switch(&self, ctx: &mut ChangeContext) -> Result<(), ChangeError> {
        let Some(target) = ctx.switches.target.clone() else {
            return Err(ChangeError::Unexpected("include switch without target".to_string()));
        };
        let preloaded = match &ctx.event {
            ChangeEvent::IncludeSwitch {
                preloaded_content, ..
            } => preloaded_content.clone(),
            _ => HashMap::new(),
        };

        self.inner
            .include_switch_in_progress
            .store(true, Ordering::SeqCst);
        let board = self.board()?;
        let outcome = self
            .deps()
            .loader
            .unified_load(
                &board,
                &target,
                &ctx.switches.new_files,
                &preloaded,
                self.deps().registry.as_ref(),
            )
            .await?;
        if !outcome.failed_files.is_empty() {
            self.deps().surface.show_warning(&format!(
                "Include file(s) missing or empty: {}",
                outcome.failed_files.join(", ")
            ));
        }
        ctx.result
            .updated_files
            .extend(ctx.switches.new_files.iter().cloned());
        ctx.pending_messages.push(outcome.message);
        Ok(())
    }

    async fn reload_include(&self, ctx: &mut ChangeContext, path: &str) -> Result<(), ChangeError> {
        let board = self.board()?;
        let targets = targets_including(&read_board(&board), path);
        if targets.is_empty() {
            // Description-embedded include: tracked, not shown in the board
            if let Some(file) = self.file(path) {
                file.reload().await?;
            }
            return Ok(());
        }
        if let [(target, _)] = targets.as_slice() {
            ctx.impact.targets = vec![target.clone()];
            ctx.rollback = rollback_snapshot(&read_board(&board), &ctx.impact.targets);
        }
        for (target, files) in targets {
            let outcome = self
                .deps()
                .loader
                .unified_load(
                    &board,
                    &target,
                    &files,
                    &HashMap::new(),
                    self.deps().registry.as_ref(),
                )
                .await?;
            ctx.pending_messages.push(outcome.message);
        }
        ctx.result.updated_files.push(path.to_string());
        Ok(())
    }

    async fn reload_main(&self, ctx: &mut ChangeContext) -> Result<(), ChangeError> {
        let main = self
            .deps()
            .registry
            .main_file()
            .ok_or(ChangeError::NoBoard)?;
        match main.reload().await? {
            ReloadOutcome::Reloaded => {}
            ReloadOutcome::Unchanged | ReloadOutcome::Superseded => return Ok(()),
            ReloadOutcome::Missing => {
                return Err(ChangeError::Io(format!(
                    "{} was deleted",
                    main.relative_path()
                )))
            }
        }

        let text = main.content();
        if !self.deps().codec.is_valid_board(&text) {
            return Err(ChangeError::Validation(format!(
                "{} is no longer a kanban board",
                main.relative_path()
            )));
        }
        let staged = shared_board(self.deps().codec.parse_board(&text));
        self.deps()
            .loader
            .load_board_includes(&staged, self.deps().registry.as_ref())
            .await?;
        let board = read_board(&staged).clone();
        main.set_cached_board(board.clone());
        self.deps().surface.replace_board(board);
        ctx.impact.needs_full_refresh = true;
        ctx.result.updated_files.push(main.relative_path().to_string());
        log::info!("[lexera.state] Reloaded board from {}", main.relative_path());
        Ok(())
    }

    /// Replace the columns with an imported or template board and load its includes.
    async fn load_replacement(&self, ctx: &mut ChangeContext, replacement: Board) -> Result<(), ChangeError> {
        self.capture_before_mutation(ctx)?;
        let staged = shared_board(replacement);
        self.deps()
            .loader
            .load_board_includes(&staged, self.deps().registry.as_ref())
            .await?;
        let loaded = read_board(&staged).clone();
        let board = self.board()?;
        let mut board = write_board(&board);
        board.columns = loaded.columns;
        if loaded.yaml_header.is_some() {
            board.yaml_header = loaded.yaml_header;
        }
        if loaded.kanban_footer.is_some() {
            board.kanban_footer = loaded.kanban_footer;
        }
        board.valid = true;
        Ok(())
    }

    // UPDATING_BACKEND

    async fn update_backend(&self, ctx: &mut ChangeContext) -> Result<ChangeState, ChangeError> {
        match ctx.event.clone() {
            ChangeEvent::UserEdit { edit_type, params } => {
                self.capture_before_mutation(ctx)?;
                if let Some(include_path) = self.apply_user_edit(edit_type, &params)? {
                    if let (Some(file), Some(value)) = (self.file(&include_path), &params.value) {
                        file.set_content(value, false);
                        ctx.result.updated_files.push(include_path);
                    }
                }
            }
            ChangeEvent::Save { file, .. } => {
                self.perform_save(ctx, &file).await?;
            }
            _ => {}
        }

        self.sync_registry()?;

        if let Some(main) = self.deps().registry.main_file() {
            if ctx.impact.board_mutated {
                let text = self.deps().codec.generate_board(&read_board(&self.board()?));
                main.set_content(&text, false);
            }
            if self.include_switch_in_progress() {
                log::debug!("[lexera.state] Include switch in progress, board cache kept");
            } else {
                main.invalidate_board_cache();
            }
        }
        self.inner
            .include_switch_in_progress
            .store(false, Ordering::SeqCst);
        Ok(ChangeState::SyncingFrontend)
    }

    /// Apply an edit to the board. Returns the include file a task
    /// description edit has to be written through to.
    fn apply_user_edit(
        &self,
        edit_type: EditType,
        params: &EditParams,
    ) -> Result<Option<String>, ChangeError> {
        let board = self.board()?;
        let mut board = write_board(&board);
        let value = || {
            params
                .value
                .clone()
                .ok_or_else(|| ChangeError::Validation("edit without value".to_string()))
        };
        let task_id = || {
            params
                .task_id
                .clone()
                .ok_or_else(|| ChangeError::Validation("edit without task id".to_string()))
        };
        let column_id = || {
            params
                .column_id
                .clone()
                .ok_or_else(|| ChangeError::Validation("edit without column id".to_string()))
        };

        match edit_type {
            EditType::TaskTitle => {
                let (value, task_id) = (value()?, task_id()?);
                let (_, task) = board
                    .find_task_mut(params.column_id.as_deref(), &task_id)
                    .ok_or(ChangeError::TargetNotFound(task_id))?;
                if task.include_mode || !extract_include_paths(&value).is_empty() {
                    task.original_title = Some(value.clone());
                }
                task.title = value;
            }
            EditType::TaskDescription => {
                let (value, task_id) = (value()?, task_id()?);
                let (_, task) = board
                    .find_task_mut(params.column_id.as_deref(), &task_id)
                    .ok_or(ChangeError::TargetNotFound(task_id))?;
                task.description = value;
                if task.include_mode {
                    return Ok(task.include_files.first().cloned());
                }
            }
            EditType::ColumnTitle => {
                let (value, column_id) = (value()?, column_id()?);
                let column = board
                    .find_column_mut(&column_id)
                    .ok_or(ChangeError::TargetNotFound(column_id))?;
                column.title = value;
            }
            EditType::ColumnAdd => {
                let title = params.value.clone().unwrap_or_default();
                let column = Column::new(title);
                // Insert after the given column, else append
                let position = params
                    .column_id
                    .as_deref()
                    .and_then(|id| board.columns.iter().position(|c| c.id == id))
                    .map_or(board.columns.len(), |i| i + 1);
                board.columns.insert(position, column);
            }
            EditType::ColumnDelete => {
                let column_id = column_id()?;
                let before = board.columns.len();
                board.columns.retain(|c| c.id != column_id);
                if board.columns.len() == before {
                    return Err(ChangeError::TargetNotFound(column_id));
                }
            }
            // Applied in LOADING_NEW together with its includes
            EditType::Import | EditType::ApplyTemplate => {}
        }
        Ok(None)
    }

    async fn perform_save(&self, ctx: &mut ChangeContext, path: &str) -> Result<(), ChangeError> {
        let file = self
            .file(path)
            .ok_or_else(|| ChangeError::TargetNotFound(path.to_string()))?;
        if file.kind() != FileKind::Main {
            file.save(SaveOptions::default()).await?;
            ctx.result.updated_files.push(path.to_string());
            return Ok(());
        }

        let text = self.deps().codec.generate_board(&read_board(&self.board()?));
        file.set_content(&text, false);
        file.save(SaveOptions::default()).await?;
        ctx.result.updated_files.push(path.to_string());

        for include in self.deps().registry.include_files() {
            if include.has_unsaved_changes() {
                include.save(SaveOptions::default()).await?;
                ctx.result
                    .updated_files
                    .push(include.relative_path().to_string());
            }
        }
        self.store().mark_clean();
        Ok(())
    }

    /// Register every include the board references and drop the rest.
    pub(crate) fn sync_registry(&self) -> Result<(), ChangeError> {
        let references = collect_board_includes(&read_board(&self.board()?));
        let registry = self.deps().registry.as_ref();

        for reference in &references {
            let registered = registry.get_by_relative_path(&reference.path);
            let stale_kind = registered
                .as_ref()
                .is_some_and(|f| f.kind() != reference.kind);
            if registered.is_none() || stale_kind {
                self.deps()
                    .loader
                    .ensure_file(registry, &reference.path, reference.kind);
            }
        }

        for file in registry.include_files() {
            let referenced = references
                .iter()
                .any(|r| is_same_file(&r.path, file.relative_path()));
            if !referenced {
                log::info!(
                    "[lexera.state] Unloading include {}",
                    file.relative_path()
                );
                registry.unregister(file.relative_path());
            }
        }
        Ok(())
    }

    // SYNCING_FRONTEND

    fn sync_frontend(&self, ctx: &mut ChangeContext) -> ChangeState {
        let surface = &self.deps().surface;
        for message in ctx.pending_messages.drain(..) {
            surface.send(message);
            ctx.result.messages_sent += 1;
        }
        if ctx.impact.needs_full_refresh {
            surface.send(SurfaceMessage::FullBoardRefresh);
            ctx.result.messages_sent += 1;
        }
        ChangeState::Complete
    }

    // Terminal states

    fn finish(&self, state: ChangeState, ctx: &mut ChangeContext) {
        match state {
            ChangeState::Complete => {
                ctx.result.success = true;
                {
                    let mut store = self.store();
                    if let Some(entry) = ctx.pending_undo.take() {
                        store.save_undo_entry(entry);
                    }
                    if ctx.impact.board_mutated && !ctx.impact.needs_full_refresh {
                        store.mark_dirty();
                    }
                }
                log::info!(
                    "[lexera.state] {} complete in {:?}",
                    ctx.event.kind(),
                    ctx.started_at.elapsed()
                );
            }
            ChangeState::Cancelled => {
                ctx.result.success = false;
                if ctx.result.error.is_none() {
                    ctx.result.error = Some(ChangeError::UserCancelled);
                }
            }
            _ => {
                ctx.result.success = false;
                self.rollback(ctx);
            }
        }
        self.inner
            .include_switch_in_progress
            .store(false, Ordering::SeqCst);
    }

    /// Restore the single captured target and tell the user.
    fn rollback(&self, ctx: &mut ChangeContext) {
        let surface = &self.deps().surface;
        if let (Some(snapshot), Some(board)) = (ctx.rollback.clone(), surface.board()) {
            let message = {
                let mut board = write_board(&board);
                match snapshot {
                    RollbackSnapshot::Column(column) => board
                        .find_column_mut(&column.id)
                        .map(|slot| {
                            *slot = column;
                            SurfaceMessage::column_content(slot, false)
                        }),
                    RollbackSnapshot::Task { column_id, task } => board
                        .find_task_mut(Some(column_id.as_str()), &task.id)
                        .map(|(_, slot)| {
                            *slot = task;
                            SurfaceMessage::task_content(&column_id, slot, false)
                        }),
                }
            };
            match message {
                Some(message) => {
                    log::warn!(
                        "[lexera.state.error] Rolled back {:?}",
                        ctx.rollback.as_ref().map(|s| s.target())
                    );
                    surface.send(message);
                    ctx.result.messages_sent += 1;
                }
                None => log::warn!("[lexera.state.error] Rollback target no longer exists"),
            }
        }
        let reason = ctx
            .result
            .error
            .as_ref()
            .map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        surface.show_warning(&format!("Change could not be completed: {}", reason));
    }
}

/// Copy of the one target a failed change can restore.
fn rollback_snapshot(board: &Board, targets: &[ResolvedTarget]) -> Option<RollbackSnapshot> {
    let [target] = targets else {
        return None;
    };
    match target.kind {
        TargetKind::Column => board
            .find_column(&target.id)
            .cloned()
            .map(RollbackSnapshot::Column),
        TargetKind::Task => board
            .find_task(target.column_id.as_deref(), &target.id)
            .map(|(column, task)| RollbackSnapshot::Task {
                column_id: column.id.clone(),
                task: task.clone(),
            }),
    }
}

/// Single-field edits must name an existing target.
fn validate_edit_target(board: &Board, edit_type: EditType, params: &EditParams) -> Result<(), ChangeError> {
    match edit_type {
        EditType::TaskTitle | EditType::TaskDescription => {
            let task_id = params.task_id.as_deref().unwrap_or_default();
            board
                .find_task(params.column_id.as_deref(), task_id)
                .map(|_| ())
                .ok_or_else(|| ChangeError::TargetNotFound(task_id.to_string()))
        }
        EditType::ColumnTitle => {
            let column_id = params.column_id.as_deref().unwrap_or_default();
            board
                .find_column(column_id)
                .map(|_| ())
                .ok_or_else(|| ChangeError::TargetNotFound(column_id.to_string()))
        }
        _ => Ok(()),
    }
}

/// A title edit whose include directives differ from the current ones.
fn title_switch(
    board: &Board,
    edit_type: EditType,
    params: &EditParams,
) -> Option<(ResolvedTarget, IncludeSwitchRequest)> {
    let (target, old_files) = match edit_type {
        EditType::ColumnTitle => {
            let column = board.find_column(params.column_id.as_deref()?)?;
            (ResolvedTarget::column(&column.id), column.include_files.clone())
        }
        EditType::TaskTitle => {
            let (column, task) = board.find_task(params.column_id.as_deref(), params.task_id.as_deref()?)?;
            (
                ResolvedTarget::task(&task.id, Some(column.id.clone())),
                task.include_files.clone(),
            )
        }
        _ => return None,
    };
    if let Some(request) = &params.include_switch {
        return Some((target, request.clone()));
    }

    let new_files = extract_include_paths(params.value.as_deref()?);
    let same = old_files.len() == new_files.len()
        && old_files
            .iter()
            .zip(&new_files)
            .all(|(a, b)| normalize_path(a) == normalize_path(b));
    if same {
        return None;
    }
    Some((
        target,
        IncludeSwitchRequest {
            old_files,
            new_files,
        },
    ))
}
