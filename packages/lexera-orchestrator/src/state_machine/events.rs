use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Board, TargetKind};
use crate::watcher::types::FileChangeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditType {
    TaskTitle,
    TaskDescription,
    ColumnTitle,
    ColumnAdd,
    ColumnDelete,
    Import,
    ApplyTemplate,
}

impl EditType {
    /// Edits that replace or reorder the board as a whole.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            EditType::ColumnAdd | EditType::ColumnDelete | EditType::Import | EditType::ApplyTemplate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncludeSwitchRequest {
    pub old_files: Vec<String>,
    pub new_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditParams {
    pub task_id: Option<String>,
    pub column_id: Option<String>,
    pub value: Option<String>,
    /// Set when a title edit adds, removes or changes include directives.
    pub include_switch: Option<IncludeSwitchRequest>,
    /// Replacement board for `import` and `applyTemplate`.
    pub board: Option<Board>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SaveSource {
    User,
    AutoSave,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    #[serde(rename_all = "camelCase")]
    FileSystemChange {
        /// Relative path of the file as registered.
        file: String,
        change_type: FileChangeType,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserEdit {
        edit_type: EditType,
        params: EditParams,
    },
    #[serde(rename_all = "camelCase")]
    Save { file: String, source: SaveSource },
    #[serde(rename_all = "camelCase")]
    IncludeSwitch {
        target: TargetKind,
        target_id: String,
        column_id_for_task: Option<String>,
        old_files: Vec<String>,
        new_files: Vec<String>,
        new_title: Option<String>,
        #[serde(default)]
        preloaded_content: HashMap<String, String>,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::FileSystemChange { .. } => "file_system_change",
            ChangeEvent::UserEdit { .. } => "user_edit",
            ChangeEvent::Save { .. } => "save",
            ChangeEvent::IncludeSwitch { .. } => "include_switch",
        }
    }

    pub fn file_system_change(file: impl Into<String>, change_type: FileChangeType) -> Self {
        ChangeEvent::FileSystemChange {
            file: file.into(),
            change_type,
            timestamp: Utc::now(),
        }
    }

    pub fn user_edit(edit_type: EditType, params: EditParams) -> Self {
        ChangeEvent::UserEdit { edit_type, params }
    }

    /// Switch the include files of a column.
    pub fn column_switch(column_id: &str, old_files: Vec<String>, new_files: Vec<String>) -> Self {
        ChangeEvent::IncludeSwitch {
            target: TargetKind::Column,
            target_id: column_id.to_string(),
            column_id_for_task: None,
            old_files,
            new_files,
            new_title: None,
            preloaded_content: HashMap::new(),
        }
    }

    /// Switch the include files of a task.
    pub fn task_switch(
        column_id: &str,
        task_id: &str,
        old_files: Vec<String>,
        new_files: Vec<String>,
    ) -> Self {
        ChangeEvent::IncludeSwitch {
            target: TargetKind::Task,
            target_id: task_id.to_string(),
            column_id_for_task: Some(column_id.to_string()),
            old_files,
            new_files,
            new_title: None,
            preloaded_content: HashMap::new(),
        }
    }
}
