// src/monitoring/mod.rs
pub mod collection_watcher;

pub use collection_watcher::{
    CollectionWatcher, TargetStatus, WatchSettings, WatchSummary, DEFAULT_CHECK_INTERVAL,
    DEFAULT_NOT_FOUND_RETRY,
};
