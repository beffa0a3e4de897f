use std::time::Duration;

use tokio::time::Instant;

use super::events::ChangeEvent;
use super::states::ChangeState;
use crate::files::FileError;
use crate::presentation::{ConflictChoice, SurfaceMessage, UnsavedChoice};
use crate::types::{CapturedEdit, Column, ResolvedTarget, Task};
use crate::undo::UndoEntry;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChangeError {
    /// Another change is in flight; this one runs after it.
    #[error("queued")]
    Queued,
    #[error("USER_CANCELLED")]
    UserCancelled,
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Unresolved conflict on {0}")]
    Conflict(String),
    #[error("No board loaded")]
    NoBoard,
    #[error("Target not found: {0}")]
    TargetNotFound(String),
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: ChangeState, to: ChangeState },
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<FileError> for ChangeError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Validation { .. } => ChangeError::Validation(e.to_string()),
            other => ChangeError::Io(other.to_string()),
        }
    }
}

/// Which parts of the document a change touches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpactAnalysis {
    pub main_file_changed: bool,
    pub include_files_changed: bool,
    pub includes_switched: bool,
    /// The board is edited in memory by this change.
    pub board_mutated: bool,
    /// Relative paths of the files this change reads or writes.
    pub affected_files: Vec<String>,
    /// Tasks and columns whose display must be updated.
    pub targets: Vec<ResolvedTarget>,
    /// The main file was re-read and the board replaced.
    pub needs_full_refresh: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwitchPlan {
    pub target: Option<ResolvedTarget>,
    pub old_files: Vec<String>,
    pub new_files: Vec<String>,
    pub loading_files: Vec<String>,
    pub unloading_files: Vec<String>,
    pub new_title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnsavedRecord {
    pub files: Vec<String>,
    pub choice: Option<UnsavedChoice>,
    /// File changed on disk while it had local work.
    pub conflict_file: Option<String>,
    pub conflict_choice: Option<ConflictChoice>,
    /// External change taken without asking.
    pub auto_reload: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRecord {
    pub success: bool,
    pub error: Option<ChangeError>,
    pub updated_files: Vec<String>,
    pub messages_sent: usize,
}

/// Pre-change copy of the one target an error can restore.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackSnapshot {
    Column(Column),
    Task { column_id: String, task: Task },
}

impl RollbackSnapshot {
    pub fn target(&self) -> ResolvedTarget {
        match self {
            RollbackSnapshot::Column(column) => ResolvedTarget::column(&column.id),
            RollbackSnapshot::Task { column_id, task } => {
                ResolvedTarget::task(&task.id, Some(column_id.clone()))
            }
        }
    }
}

/// Working record of one change as it moves through the states.
#[derive(Debug, Clone)]
pub struct ChangeContext {
    pub event: ChangeEvent,
    pub impact: ImpactAnalysis,
    pub edit_capture: Option<CapturedEdit>,
    pub unsaved: UnsavedRecord,
    pub switches: SwitchPlan,
    pub result: ResultRecord,
    pub rollback: Option<RollbackSnapshot>,
    /// Targeted updates to send once the backend is consistent.
    pub pending_messages: Vec<SurfaceMessage>,
    /// Pre-change board, pushed onto the undo stack only if the change completes.
    pub pending_undo: Option<UndoEntry>,
    pub started_at: Instant,
    pub current_state: ChangeState,
    pub state_history: Vec<ChangeState>,
}

impl ChangeContext {
    pub fn new(event: ChangeEvent) -> Self {
        Self {
            event,
            impact: ImpactAnalysis::default(),
            edit_capture: None,
            unsaved: UnsavedRecord::default(),
            switches: SwitchPlan::default(),
            result: ResultRecord::default(),
            rollback: None,
            pending_messages: Vec::new(),
            pending_undo: None,
            started_at: Instant::now(),
            current_state: ChangeState::Idle,
            state_history: vec![ChangeState::Idle],
        }
    }

    pub(crate) fn enter(&mut self, state: ChangeState) {
        self.current_state = state;
        self.state_history.push(state);
    }

    pub fn visited(&self, state: ChangeState) -> bool {
        self.state_history.contains(&state)
    }
}

/// Outcome of one `process_change` call.
#[derive(Debug, Clone)]
pub struct ChangeResult {
    pub success: bool,
    pub error: Option<ChangeError>,
    pub duration: Duration,
    pub context: ChangeContext,
}

impl ChangeResult {
    pub(crate) fn queued(event: ChangeEvent) -> Self {
        Self {
            success: false,
            error: Some(ChangeError::Queued),
            duration: Duration::ZERO,
            context: ChangeContext::new(event),
        }
    }

    /// The change did not run yet; it waits behind the one in flight.
    pub fn is_queued(&self) -> bool {
        self.error == Some(ChangeError::Queued)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == Some(ChangeError::UserCancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::types::FileChangeType;

    #[test]
    fn test_sentinel_messages() {
        assert_eq!(ChangeError::Queued.to_string(), "queued");
        assert_eq!(ChangeError::UserCancelled.to_string(), "USER_CANCELLED");
    }

    #[test]
    fn test_queued_result() {
        let result = ChangeResult::queued(ChangeEvent::file_system_change("a.md", FileChangeType::Modified));
        assert!(result.is_queued());
        assert!(!result.success);
        assert_eq!(result.context.current_state, ChangeState::Idle);
    }

    #[test]
    fn test_file_error_mapping() {
        let err: ChangeError = FileError::Validation {
            path: "board.md".into(),
            reason: "empty".to_string(),
        }
        .into();
        assert!(matches!(err, ChangeError::Validation(_)));

        let err: ChangeError = FileError::NotFound("x.md".into()).into();
        assert!(matches!(err, ChangeError::Io(_)));
    }
}
