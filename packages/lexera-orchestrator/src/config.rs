/// Engine configuration.
/// Reads engine.json from ~/.config/lexera/engine.json (or platform equivalent).
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when the same file is included in more than one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateIncludePolicy {
    #[default]
    Allow,
    Warn,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_save_transaction_timeout_ms")]
    pub save_transaction_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_reload_verify_retries")]
    pub reload_verify_retries: u32,
    #[serde(default = "default_reload_verify_backoff_ms")]
    pub reload_verify_backoff_ms: u64,
    #[serde(default = "default_undo_capacity")]
    pub undo_capacity: usize,
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
    #[serde(default)]
    pub duplicate_includes: DuplicateIncludePolicy,
}

fn default_save_transaction_timeout_ms() -> u64 {
    30_000
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_reload_verify_retries() -> u32 {
    3
}

fn default_reload_verify_backoff_ms() -> u64 {
    100
}

fn default_undo_capacity() -> usize {
    100
}

fn default_watch_debounce_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            save_transaction_timeout_ms: default_save_transaction_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            reload_verify_retries: default_reload_verify_retries(),
            reload_verify_backoff_ms: default_reload_verify_backoff_ms(),
            undo_capacity: default_undo_capacity(),
            watch_debounce_ms: default_watch_debounce_ms(),
            duplicate_includes: DuplicateIncludePolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn save_transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.save_transaction_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn reload_verify_backoff(&self) -> Duration {
        Duration::from_millis(self.reload_verify_backoff_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

/// Default config path: ~/.config/lexera/engine.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lexera")
        .join("engine.json")
}

/// Load config from path. Returns default if file doesn't exist or can't be parsed.
pub fn load_config(path: &Path) -> EngineConfig {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!(
                "[lexera.config] Failed to parse config {}: {}",
                path.display(),
                e
            );
            EngineConfig::default()
        }),
        Err(_) => {
            log::info!(
                "[lexera.config] No config at {}, using defaults",
                path.display()
            );
            EngineConfig::default()
        }
    }
}
