/// Include path resolution and board reference collection.
///
/// Raw include paths (may be URL-encoded, relative) are resolved against the
/// main board file's parent directory.
use std::path::{Path, PathBuf};

use super::syntax::{decode_include_path, extract_include_paths};
use crate::files::FileKind;
use crate::paths::normalize_path;
use crate::types::Board;

/// Resolve a raw include path relative to the board's directory.
/// Handles URL-encoded paths (%20), `./` prefix, and relative paths.
pub fn resolve_include_path(raw_path: &str, board_dir: &Path) -> PathBuf {
    let decoded = decode_include_path(raw_path);
    let cleaned = decoded.strip_prefix("./").unwrap_or(&decoded);
    let resolved = board_dir.join(cleaned);

    // Canonicalize when the file exists, fall back to the joined path
    std::fs::canonicalize(&resolved).unwrap_or(resolved)
}

/// One include reference found in a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeReference {
    pub path: String,
    pub kind: FileKind,
}

/// Every include the board references, de-duplicated by normalized path.
/// Column and task includes win over regular (description-embedded) ones.
pub fn collect_board_includes(board: &Board) -> Vec<IncludeReference> {
    let mut refs: Vec<IncludeReference> = Vec::new();
    let mut push = |path: &str, kind: FileKind| {
        let key = normalize_path(path);
        if let Some(existing) = refs.iter_mut().find(|r| normalize_path(&r.path) == key) {
            if existing.kind == FileKind::IncludeRegular && kind != FileKind::IncludeRegular {
                existing.kind = kind;
            }
            return;
        }
        refs.push(IncludeReference {
            path: path.to_string(),
            kind,
        });
    };

    for column in &board.columns {
        if column.include_mode {
            for path in &column.include_files {
                push(path, FileKind::IncludeColumn);
            }
            continue;
        }
        for task in &column.tasks {
            if task.include_mode {
                for path in &task.include_files {
                    push(path, FileKind::IncludeTask);
                }
            } else {
                for path in extract_include_paths(&task.description) {
                    push(&path, FileKind::IncludeRegular);
                }
            }
        }
    }
    refs
}

/// Count how many columns/tasks reference `path` as a column or task include.
pub fn count_include_references(board: &Board, path: &str) -> usize {
    let key = normalize_path(path);
    let matches = |files: &[String]| files.iter().any(|f| normalize_path(f) == key);
    board
        .columns
        .iter()
        .map(|c| {
            let own = usize::from(c.include_mode && matches(&c.include_files));
            own + c
                .tasks
                .iter()
                .filter(|t| t.include_mode && matches(&t.include_files))
                .count()
        })
        .sum()
}
