/// Undo/redo stacks of whole-board snapshots.
///
/// Each entry also records which tasks or columns the change touched, so an
/// undo can be shown with targeted updates. An empty target list means the
/// change was structural and the whole board has to be refreshed.
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::events::{ChangeEvent, EditType};
use crate::types::{Board, ResolvedTarget, TargetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UndoProvenance {
    /// Targets derived from the change event.
    Event,
    /// Targets supplied by the caller.
    Manual,
    /// Targets found by comparing boards.
    Inferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    pub board: Board,
    pub targets: Vec<ResolvedTarget>,
    pub provenance: UndoProvenance,
    pub timestamp: DateTime<Utc>,
}

impl UndoEntry {
    pub fn new(board: Board, targets: Vec<ResolvedTarget>, provenance: UndoProvenance) -> Self {
        Self {
            board,
            targets,
            provenance,
            timestamp: Utc::now(),
        }
    }
}

/// A board to restore and the targets whose display must be refreshed.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoRestore {
    pub board: Board,
    pub targets: Vec<ResolvedTarget>,
}

/// Targets touched by `event`. Empty for structural changes.
pub fn resolve_targets(event: &ChangeEvent, board: &Board) -> Vec<ResolvedTarget> {
    match event {
        ChangeEvent::UserEdit { edit_type, params } => {
            if edit_type.is_structural() {
                return Vec::new();
            }
            match edit_type {
                EditType::TaskTitle | EditType::TaskDescription => {
                    let Some(task_id) = params.task_id.as_deref() else {
                        return Vec::new();
                    };
                    board
                        .find_task(params.column_id.as_deref(), task_id)
                        .map(|(col, task)| vec![ResolvedTarget::task(&task.id, Some(col.id.clone()))])
                        .unwrap_or_default()
                }
                EditType::ColumnTitle => params
                    .column_id
                    .as_deref()
                    .filter(|id| board.find_column(id).is_some())
                    .map(|id| vec![ResolvedTarget::column(id)])
                    .unwrap_or_default(),
                _ => Vec::new(),
            }
        }
        ChangeEvent::IncludeSwitch {
            target,
            target_id,
            column_id_for_task,
            ..
        } => match target {
            TargetKind::Column => vec![ResolvedTarget::column(target_id)],
            TargetKind::Task => board
                .find_task(column_id_for_task.as_deref(), target_id)
                .map(|(col, _)| vec![ResolvedTarget::task(target_id, Some(col.id.clone()))])
                .unwrap_or_default(),
        },
        ChangeEvent::FileSystemChange { .. } | ChangeEvent::Save { .. } => Vec::new(),
    }
}

/// Targets whose content differs between two boards with the same layout.
/// Falls back to an empty list when columns were added, removed or moved.
pub fn infer_targets(before: &Board, after: &Board) -> Vec<ResolvedTarget> {
    let same_layout = before.columns.len() == after.columns.len()
        && before
            .columns
            .iter()
            .zip(&after.columns)
            .all(|(a, b)| a.id == b.id && a.tasks.len() == b.tasks.len());
    if !same_layout {
        return Vec::new();
    }

    let mut targets = Vec::new();
    for (a, b) in before.columns.iter().zip(&after.columns) {
        if a.title != b.title || a.include_files != b.include_files {
            targets.push(ResolvedTarget::column(&b.id));
            continue;
        }
        for (ta, tb) in a.tasks.iter().zip(&b.tasks) {
            if ta != tb {
                targets.push(ResolvedTarget::task(&tb.id, Some(b.id.clone())));
            }
        }
    }
    targets
}

#[derive(Debug)]
pub struct BoardStore {
    undo: VecDeque<UndoEntry>,
    redo: VecDeque<UndoEntry>,
    capacity: usize,
    dirty: bool,
}

impl BoardStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            capacity: capacity.max(1),
            dirty: false,
        }
    }

    pub fn save_undo_entry(&mut self, entry: UndoEntry) {
        self.undo.push_back(entry);
        while self.undo.len() > self.capacity {
            self.undo.pop_front();
        }
        self.redo.clear();
        self.dirty = true;
    }

    /// Step back. `current` is the board as it is now; it moves to the redo stack.
    pub fn undo(&mut self, current: &Board) -> Option<UndoRestore> {
        let entry = self.undo.pop_back()?;
        Self::push_bounded(
            &mut self.redo,
            self.capacity,
            UndoEntry::new(current.clone(), entry.targets.clone(), entry.provenance),
        );
        self.dirty = true;
        Some(UndoRestore {
            board: entry.board,
            targets: entry.targets,
        })
    }

    pub fn redo(&mut self, current: &Board) -> Option<UndoRestore> {
        let entry = self.redo.pop_back()?;
        Self::push_bounded(
            &mut self.undo,
            self.capacity,
            UndoEntry::new(current.clone(), entry.targets.clone(), entry.provenance),
        );
        self.dirty = true;
        Some(UndoRestore {
            board: entry.board,
            targets: entry.targets,
        })
    }

    fn push_bounded(stack: &mut VecDeque<UndoEntry>, capacity: usize, entry: UndoEntry) {
        stack.push_back(entry);
        while stack.len() > capacity {
            stack.pop_front();
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::events::EditParams;
    use crate::types::{Column, Task};

    fn board_with(title: &str) -> Board {
        let mut col = Column::new("Todo");
        col.id = "col-1".to_string();
        let mut task = Task::new(title, "");
        task.id = "task-1".to_string();
        col.tasks.push(task);
        Board {
            valid: true,
            columns: vec![col],
            ..Board::default()
        }
    }

    #[test]
    fn test_undo_then_redo_restores_state_and_targets() {
        let mut store = BoardStore::new(10);
        let before = board_with("old");
        let after = board_with("new");
        let targets = vec![ResolvedTarget::task("task-1", Some("col-1".to_string()))];
        store.save_undo_entry(UndoEntry::new(before.clone(), targets.clone(), UndoProvenance::Event));

        let undone = store.undo(&after).unwrap();
        assert_eq!(undone.board, before);
        assert_eq!(undone.targets, targets);
        assert!(store.can_redo());

        let redone = store.redo(&undone.board).unwrap();
        assert_eq!(redone.board, after);
        assert_eq!(redone.targets, targets);
        assert!(store.can_undo());
        assert!(!store.can_redo());
    }

    #[test]
    fn test_new_entry_clears_redo() {
        let mut store = BoardStore::new(10);
        store.save_undo_entry(UndoEntry::new(board_with("a"), vec![], UndoProvenance::Manual));
        store.undo(&board_with("b"));
        assert!(store.can_redo());
        store.save_undo_entry(UndoEntry::new(board_with("c"), vec![], UndoProvenance::Manual));
        assert!(!store.can_redo());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut store = BoardStore::new(2);
        for title in ["a", "b", "c"] {
            store.save_undo_entry(UndoEntry::new(board_with(title), vec![], UndoProvenance::Manual));
        }
        assert_eq!(store.undo_len(), 2);
        let last = store.undo(&board_with("d")).unwrap();
        assert_eq!(last.board.columns[0].tasks[0].title, "c");
    }

    #[test]
    fn test_single_field_edit_resolves_one_target() {
        let board = board_with("x");
        let event = ChangeEvent::user_edit(
            EditType::TaskTitle,
            EditParams {
                task_id: Some("task-1".to_string()),
                value: Some("y".to_string()),
                ..EditParams::default()
            },
        );
        assert_eq!(
            resolve_targets(&event, &board),
            vec![ResolvedTarget::task("task-1", Some("col-1".to_string()))]
        );
    }

    #[test]
    fn test_structural_edit_resolves_nothing() {
        let board = board_with("x");
        for edit_type in [EditType::ColumnAdd, EditType::ColumnDelete, EditType::Import, EditType::ApplyTemplate] {
            let event = ChangeEvent::user_edit(
                edit_type,
                EditParams {
                    column_id: Some("col-1".to_string()),
                    ..EditParams::default()
                },
            );
            assert!(resolve_targets(&event, &board).is_empty());
        }
    }

    #[test]
    fn test_infer_targets() {
        let before = board_with("a");
        let after = board_with("b");
        assert_eq!(
            infer_targets(&before, &after),
            vec![ResolvedTarget::task("task-1", Some("col-1".to_string()))]
        );

        let mut grown = after.clone();
        grown.columns.push(Column::new("More"));
        assert!(infer_targets(&before, &grown).is_empty());
    }
}
