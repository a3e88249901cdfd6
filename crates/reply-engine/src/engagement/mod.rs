// src/engagement/mod.rs

//! Engagement segment tracking and its durable checkpoint

pub mod engagement_config;
pub mod kv_store;
pub mod segment_tracker;
pub mod snapshot;

// Re-exports
pub use engagement_config::EngagementConfig;
pub use kv_store::{InMemoryKeyValueStore, KeyValueStore, SqliteKeyValueStore};
pub use segment_tracker::{
    CacheStatus, CleanupStats, EngagementCache, EngagementHandoff, EngagementSegment,
    EngagementSegmentTracker, UserEngagementStatus, GAP_MARKER_TEXT,
};
pub use snapshot::{decode_snapshot, encode_snapshot, storage_key, SNAPSHOT_VERSION};
