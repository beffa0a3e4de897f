/// Transitive include discovery.
///
/// Include files may themselves contain `!!!include(...)!!!` directives.
/// Walks the include graph from a root file, each file visited once, and
/// reports every reachable file plus the parent directories a watcher has to
/// cover for them.
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::resolver::resolve_include_path;
use super::syntax::extract_include_paths;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IncludeTree {
    /// Resolved paths of every file reached (root first, then discovery order).
    pub files: Vec<PathBuf>,
    /// Resolved paths that were referenced but could not be read.
    pub missing: Vec<PathBuf>,
    /// Parent directories of all reached files.
    pub directories: BTreeSet<PathBuf>,
}

impl IncludeTree {
    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|p| p == path)
    }
}

/// Walk the include graph starting at `root`.
pub fn scan_include_tree(root: &Path) -> IncludeTree {
    let mut tree = IncludeTree::default();
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let mut pending = vec![root];

    while let Some(current) = pending.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }

        let content = match fs::read_to_string(&current) {
            Ok(content) => content,
            Err(e) => {
                log::warn!(
                    "[lexera.include.scan] Cannot read {}: {}",
                    current.display(),
                    e
                );
                tree.missing.push(current);
                continue;
            }
        };

        let dir = current.parent().unwrap_or(Path::new(".")).to_path_buf();
        tree.directories.insert(dir.clone());
        tree.files.push(current);

        // Reverse so the first directive is processed first off the stack
        let mut children: Vec<PathBuf> = extract_include_paths(&content)
            .iter()
            .map(|raw| resolve_include_path(raw, &dir))
            .filter(|p| !visited.contains(p))
            .collect();
        children.reverse();
        pending.extend(children);
    }

    tree
}
