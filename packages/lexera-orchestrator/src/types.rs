use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique id such as `col-12-18f3a2b4c11`.
pub fn generate_id(prefix: &str) -> String {
    let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{}-{}-{:x}", prefix, seq, ts)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub checked: bool,
    #[serde(default)]
    pub include_mode: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_files: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_error: bool,
    /// UI-only title derived from include content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_title: Option<String>,
    /// Title including the raw include directive, needed to regenerate the source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_title: Option<String>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: generate_id("task"),
            title: title.into(),
            description: description.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: String,
    pub title: String,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub include_mode: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_files: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_error: bool,
}

impl Column {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: generate_id("col"),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn find_task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub valid: bool,
    pub columns: Vec<Column>,
    /// Raw header text, preserved verbatim for round-tripping.
    pub yaml_header: Option<String>,
    /// Raw `%%` footer text, preserved verbatim for round-tripping.
    pub kanban_footer: Option<String>,
}

impl Board {
    pub fn find_column(&self, column_id: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == column_id)
    }

    pub fn find_column_mut(&mut self, column_id: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.id == column_id)
    }

    /// Locate a task. When `column_id` is given only that column is searched.
    pub fn find_task(&self, column_id: Option<&str>, task_id: &str) -> Option<(&Column, &Task)> {
        self.columns
            .iter()
            .filter(|c| column_id.map_or(true, |id| c.id == id))
            .find_map(|c| c.find_task(task_id).map(|t| (c, t)))
    }

    /// Mutable variant of [`Board::find_task`]; also returns the owning column id.
    pub fn find_task_mut(
        &mut self,
        column_id: Option<&str>,
        task_id: &str,
    ) -> Option<(String, &mut Task)> {
        self.columns
            .iter_mut()
            .filter(|c| column_id.map_or(true, |id| c.id == id))
            .find_map(|c| {
                let col_id = c.id.clone();
                c.find_task_mut(task_id).map(|t| (col_id, t))
            })
    }
}

/// Board handle shared between the engine and the presentation surface.
pub type SharedBoard = Arc<RwLock<Board>>;

pub fn shared_board(board: Board) -> SharedBoard {
    Arc::new(RwLock::new(board))
}

pub fn read_board(board: &SharedBoard) -> RwLockReadGuard<'_, Board> {
    board.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_board(board: &SharedBoard) -> RwLockWriteGuard<'_, Board> {
    board.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Task,
    Column,
}

/// A single task or column a change touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTarget {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_id: Option<String>,
}

impl ResolvedTarget {
    pub fn column(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Column,
            id: id.into(),
            column_id: None,
        }
    }

    pub fn task(id: impl Into<String>, column_id: Option<String>) -> Self {
        Self {
            kind: TargetKind::Task,
            id: id.into(),
            column_id,
        }
    }
}

/// Which field of a task or column an edit touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditField {
    Title,
    Description,
}

/// The value an in-progress edit held when the editor was asked to stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedEdit {
    pub target: ResolvedTarget,
    pub field: EditField,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_board() -> Board {
        let mut todo = Column::new("Todo");
        todo.tasks.push(Task::new("First", ""));
        let mut done = Column::new("Done");
        done.tasks.push(Task::new("Second", "body"));
        Board {
            valid: true,
            columns: vec![todo, done],
            ..Board::default()
        }
    }

    #[test]
    fn test_generate_id_unique() {
        let a = generate_id("task");
        let b = generate_id("task");
        assert_ne!(a, b);
        assert!(a.starts_with("task-"));
    }

    #[test]
    fn test_find_task_scoped_to_column() {
        let board = sample_board();
        let done_id = board.columns[1].id.clone();
        let task_id = board.columns[1].tasks[0].id.clone();

        let (col, task) = board.find_task(Some(&done_id), &task_id).unwrap();
        assert_eq!(col.title, "Done");
        assert_eq!(task.title, "Second");

        let todo_id = board.columns[0].id.clone();
        assert!(board.find_task(Some(&todo_id), &task_id).is_none());
        assert!(board.find_task(None, &task_id).is_some());
    }

    #[test]
    fn test_find_task_mut_reports_column() {
        let mut board = sample_board();
        let task_id = board.columns[0].tasks[0].id.clone();
        let expected_col = board.columns[0].id.clone();

        let (col_id, task) = board.find_task_mut(None, &task_id).unwrap();
        task.title = "Renamed".to_string();
        assert_eq!(col_id, expected_col);
        assert_eq!(board.columns[0].tasks[0].title, "Renamed");
    }

    #[test]
    fn test_target_serializes_type_field() {
        let target = ResolvedTarget::task("t1", Some("c1".to_string()));
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["columnId"], "c1");
    }
}
