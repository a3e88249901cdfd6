//! Versioned record format for persisted engagement caches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use super::segment_tracker::{EngagementCache, EngagementSegment};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    version: u32,
    conversation_id: String,
    users: BTreeMap<String, Vec<EngagementSegment>>,
    last_processed_time: Option<DateTime<Utc>>,
    last_cleanup_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

pub fn storage_key(conversation_id: &str) -> String {
    format!("engagement/{}", conversation_id)
}

pub fn encode_snapshot(conversation_id: &str, cache: &EngagementCache) -> EngineResult<Vec<u8>> {
    let record = SnapshotRecord {
        version: SNAPSHOT_VERSION,
        conversation_id: conversation_id.to_string(),
        users: cache.users.clone(),
        last_processed_time: cache.last_processed_time,
        last_cleanup_time: cache.last_cleanup_time,
    };
    serde_json::to_vec(&record).map_err(|e| EngineError::Storage(format!("cannot encode engagement cache: {}", e)))
}

/// Decodes a snapshot written for `conversation_id`.
pub fn decode_snapshot(conversation_id: &str, bytes: &[u8]) -> EngineResult<EngagementCache> {
    let header: VersionHeader = serde_json::from_slice(bytes)
        .map_err(|e| EngineError::StateCorruption(format!("engagement snapshot is not a record: {}", e)))?;
    if header.version != SNAPSHOT_VERSION {
        return Err(EngineError::StateCorruption(format!(
            "unsupported engagement snapshot version {}",
            header.version
        )));
    }

    let record: SnapshotRecord = serde_json::from_slice(bytes)
        .map_err(|e| EngineError::StateCorruption(format!("engagement snapshot is malformed: {}", e)))?;
    if record.conversation_id != conversation_id {
        return Err(EngineError::StateCorruption(format!(
            "snapshot belongs to {}, expected {}",
            record.conversation_id, conversation_id
        )));
    }

    for (user, segments) in &record.users {
        let ordered = segments.iter().all(|s| s.start_time <= s.end_time);
        let disjoint = segments.windows(2).all(|w| w[0].end_time <= w[1].start_time);
        if !ordered || !disjoint {
            return Err(EngineError::StateCorruption(format!("segments of {} overlap or are inverted", user)));
        }
    }

    Ok(EngagementCache {
        users: record.users,
        last_processed_time: record.last_processed_time,
        last_cleanup_time: record.last_cleanup_time,
    })
}
