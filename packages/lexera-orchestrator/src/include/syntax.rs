/// Include syntax detection and extraction.
///
/// Handles the `!!!include(path)!!!` pattern used in column headers, task
/// titles and descriptions. Supports URL-encoded paths (%20), literal spaces,
/// and tags after the closing `!!!`.
use regex::Regex;
use std::sync::LazyLock;

static INCLUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!!!include\(([^)]+)\)!!!").unwrap());

/// Check if a title contains an include directive.
pub fn is_include(title: &str) -> bool {
    INCLUDE_RE.is_match(title)
}

/// Extract the first raw path from an include directive.
pub fn extract_include_path(title: &str) -> Option<String> {
    INCLUDE_RE.captures(title).map(|caps| caps[1].trim().to_string())
}

/// Extract every include path in `text`, in order of appearance.
pub fn extract_include_paths(text: &str) -> Vec<String> {
    INCLUDE_RE
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Strip the include directives from a title, returning the remaining text (tags etc).
/// For example: `!!!include(path)!!! #stack` -> ` #stack`
pub fn strip_include(title: &str) -> String {
    INCLUDE_RE.replace_all(title, "").to_string()
}

/// Build a directive for `path`.
pub fn make_include(path: &str) -> String {
    format!("!!!include({})!!!", path)
}

/// Point the directives of `title` at `paths`, keeping the remaining text.
pub fn replace_includes(title: &str, paths: &[String]) -> String {
    let rest = strip_include(title);
    let rest = rest.trim();
    let directives: Vec<String> = paths.iter().map(|p| make_include(p)).collect();
    match (directives.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => directives.join(" "),
        (false, false) => format!("{} {}", directives.join(" "), rest),
    }
}

/// Decode URL-encoded path components (%20 -> space, etc).
pub fn decode_include_path(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .to_string()
}
