/// Path comparison helpers.
///
/// Include paths arrive as typed by the user (`./Slides.md`, `sub\notes.md`,
/// NFD file names from macOS). Two paths name the same file when their
/// normalized forms are equal: NFC, forward slashes, no leading `./`,
/// no duplicate separators, lowercase.
use std::collections::HashSet;

use unicode_normalization::UnicodeNormalization;

/// Normalize a relative include path into its cache key.
pub fn normalize_path(path: &str) -> String {
    let unified: String = path.trim().nfc().collect::<String>().replace('\\', "/");

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            _ => segments.push(segment),
        }
    }

    let mut normalized = segments.join("/");
    if unified.starts_with('/') {
        normalized.insert(0, '/');
    }
    normalized.to_lowercase()
}

/// Case- and separator-insensitive file identity.
pub fn is_same_file(a: &str, b: &str) -> bool {
    normalize_path(a) == normalize_path(b)
}

/// Entries of `from` whose normalized form is absent from `minus`.
/// Keeps the order and original spelling of `from`, dropping normalized duplicates.
pub fn normalized_difference(from: &[String], minus: &[String]) -> Vec<String> {
    let excluded: HashSet<String> = minus.iter().map(|p| normalize_path(p)).collect();
    let mut seen = HashSet::new();
    from.iter()
        .filter(|p| {
            let key = normalize_path(p);
            !excluded.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect()
}

/// Whether `list` contains `path` under normalized comparison.
pub fn contains_path(list: &[String], path: &str) -> bool {
    let key = normalize_path(path);
    list.iter().any(|p| normalize_path(p) == key)
}
