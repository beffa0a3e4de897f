pub mod coordinator;
#[cfg(feature = "file-watcher")]
pub mod file_watcher;
pub mod registry;
pub mod types;
