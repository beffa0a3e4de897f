/// Event types emitted by the file watch registry.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// SHA-256 fingerprint of file content, used for self-write detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentFingerprint(pub String);

impl ContentFingerprint {
    /// Compute SHA-256 fingerprint of content with normalized line endings.
    pub fn from_content(content: &str) -> Self {
        use sha2::{Digest, Sha256};
        let normalized = content.replace("\r\n", "\n");
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeType {
    Modified,
    Created,
    Deleted,
}

/// A change delivered to one subscriber of a watched path.
#[derive(Debug, Clone)]
pub struct FileWatchEvent {
    /// Relative path of the subscribing file (its registry key before normalization).
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub change_type: FileChangeType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to watch {path}: {message}")]
    Backend { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let fp1 = ContentFingerprint::from_content("hello world");
        let fp2 = ContentFingerprint::from_content("hello world");
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn test_fingerprint_normalized_line_endings() {
        let fp1 = ContentFingerprint::from_content("line1\nline2");
        let fp2 = ContentFingerprint::from_content("line1\r\nline2");
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn test_fingerprint_different_content() {
        let fp1 = ContentFingerprint::from_content("hello");
        let fp2 = ContentFingerprint::from_content("world");
        assert_ne!(fp1, fp2);
    }
}
