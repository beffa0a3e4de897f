/// The presentation surface: whatever shows the board to the user.
///
/// The engine reads and replaces the board through it, pushes targeted
/// update messages, and asks it the few questions only a user can answer.
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{shared_board, write_board, Board, Column, SharedBoard, Task};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SurfaceMessage {
    #[serde(rename_all = "camelCase")]
    UpdateColumnContent {
        column_id: String,
        tasks: Vec<Task>,
        include_mode: bool,
        include_files: Vec<String>,
        include_error: bool,
        is_loading_content: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpdateTaskContent {
        column_id: String,
        task_id: String,
        title: String,
        description: String,
        display_title: Option<String>,
        include_mode: bool,
        include_files: Vec<String>,
        include_error: bool,
        is_loading_content: bool,
    },
    #[serde(rename_all = "camelCase")]
    UndoRedoStatus { can_undo: bool, can_redo: bool },
    FullBoardRefresh,
    #[serde(rename_all = "camelCase")]
    ShowWarning { message: String },
}

impl SurfaceMessage {
    pub fn column_content(column: &Column, is_loading_content: bool) -> Self {
        SurfaceMessage::UpdateColumnContent {
            column_id: column.id.clone(),
            tasks: column.tasks.clone(),
            include_mode: column.include_mode,
            include_files: column.include_files.clone(),
            include_error: column.include_error,
            is_loading_content,
        }
    }

    pub fn task_content(column_id: &str, task: &Task, is_loading_content: bool) -> Self {
        SurfaceMessage::UpdateTaskContent {
            column_id: column_id.to_string(),
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            display_title: task.display_title.clone(),
            include_mode: task.include_mode,
            include_files: task.include_files.clone(),
            include_error: task.include_error,
            is_loading_content,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            SurfaceMessage::UpdateColumnContent {
                is_loading_content: true,
                ..
            } | SurfaceMessage::UpdateTaskContent {
                is_loading_content: true,
                ..
            }
        )
    }
}

/// Answer to "these include files have unsaved changes".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnsavedChoice {
    Save,
    Discard,
    Cancel,
}

/// Answer to "this file changed on disk while you were editing it".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictChoice {
    /// Keep the local text, ignore the external change.
    KeepLocal,
    /// Discard local text and load the disk version.
    Reload,
    /// Write the local text to a conflict copy, then load the disk version.
    BackupAndReload,
    /// Save the local text over the disk version.
    Overwrite,
}

#[async_trait]
pub trait PresentationSurface: Send + Sync {
    fn board(&self) -> Option<SharedBoard>;
    fn replace_board(&self, board: Board);
    fn send(&self, message: SurfaceMessage);

    fn show_warning(&self, message: &str) {
        self.send(SurfaceMessage::ShowWarning {
            message: message.to_string(),
        });
    }

    async fn prompt_unsaved_includes(&self, files: &[String]) -> UnsavedChoice;
    async fn prompt_conflict(&self, file: &str) -> ConflictChoice;
}

/// Surface that forwards messages over a channel and answers prompts with
/// fixed choices. Hosts that bridge to a remote UI start from this.
pub struct ChannelSurface {
    board: RwLock<Option<SharedBoard>>,
    tx: mpsc::UnboundedSender<SurfaceMessage>,
    unsaved_choice: UnsavedChoice,
    conflict_choice: ConflictChoice,
}

impl ChannelSurface {
    pub fn new(tx: mpsc::UnboundedSender<SurfaceMessage>) -> Self {
        Self {
            board: RwLock::new(None),
            tx,
            unsaved_choice: UnsavedChoice::Save,
            conflict_choice: ConflictChoice::KeepLocal,
        }
    }

    pub fn with_choices(mut self, unsaved: UnsavedChoice, conflict: ConflictChoice) -> Self {
        self.unsaved_choice = unsaved;
        self.conflict_choice = conflict;
        self
    }
}

#[async_trait]
impl PresentationSurface for ChannelSurface {
    fn board(&self) -> Option<SharedBoard> {
        self.board
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_board(&self, board: Board) {
        let mut slot = self.board.write().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            // Keep the handle so holders see the new board
            Some(existing) => *write_board(existing) = board,
            None => *slot = Some(shared_board(board)),
        }
    }

    fn send(&self, message: SurfaceMessage) {
        if self.tx.send(message).is_err() {
            log::debug!("[lexera.surface] Receiver closed, message dropped");
        }
    }

    async fn prompt_unsaved_includes(&self, files: &[String]) -> UnsavedChoice {
        log::info!(
            "[lexera.surface] Unsaved includes {:?}, answering {:?}",
            files,
            self.unsaved_choice
        );
        self.unsaved_choice
    }

    async fn prompt_conflict(&self, file: &str) -> ConflictChoice {
        log::info!(
            "[lexera.surface] Conflict on {}, answering {:?}",
            file,
            self.conflict_choice
        );
        self.conflict_choice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::read_board;

    #[test]
    fn test_message_wire_format() {
        let column = Column::new("Week");
        let json = serde_json::to_value(SurfaceMessage::column_content(&column, true)).unwrap();
        assert_eq!(json["type"], "updateColumnContent");
        assert_eq!(json["isLoadingContent"], true);
        assert_eq!(json["columnId"], column.id.as_str());

        let json = serde_json::to_value(SurfaceMessage::UndoRedoStatus {
            can_undo: true,
            can_redo: false,
        })
        .unwrap();
        assert_eq!(json["type"], "undoRedoStatus");
        assert_eq!(json["canUndo"], true);
    }

    #[test]
    fn test_replace_board_keeps_handle() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let surface = ChannelSurface::new(tx);
        assert!(surface.board().is_none());

        surface.replace_board(Board::default());
        let handle = surface.board().unwrap();
        surface.replace_board(Board {
            valid: true,
            ..Board::default()
        });
        assert!(read_board(&handle).valid);
    }

    #[test]
    fn test_warning_is_a_message() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let surface = ChannelSurface::new(tx);
        surface.show_warning("include missing");
        assert_eq!(
            rx.try_recv().unwrap(),
            SurfaceMessage::ShowWarning {
                message: "include missing".to_string()
            }
        );
    }
}
