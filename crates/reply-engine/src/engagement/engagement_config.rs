use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementConfig {
    /// Messages before the first tracked one that a new segment reaches back to.
    pub lead_in_messages: usize,

    /// Largest number of intervening messages that still extends a segment.
    pub merge_gap_messages: usize,

    /// Messages after the last tracked one that a closed segment absorbs.
    pub trailing_messages: usize,

    /// Total segment messages per user that triggers the hand-off.
    pub handoff_threshold: usize,

    pub max_segment_age_secs: i64,
    pub max_segments_per_user: usize,
    pub cleanup_interval_secs: i64,
    pub enable_cleanup: bool,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            lead_in_messages: 5,
            merge_gap_messages: 10,
            trailing_messages: 5,
            handoff_threshold: 45,
            max_segment_age_secs: 7 * 24 * 3600,
            max_segments_per_user: 10,
            cleanup_interval_secs: 3600,
            enable_cleanup: true,
        }
    }
}

impl EngagementConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.handoff_threshold == 0 {
            return Err(EngineError::config("engagement hand-off threshold must be at least 1"));
        }
        if self.max_segments_per_user == 0 {
            return Err(EngineError::config("max segments per user must be at least 1"));
        }
        if self.max_segment_age_secs <= 0 || self.cleanup_interval_secs <= 0 {
            return Err(EngineError::config("engagement age and cleanup interval must be positive"));
        }
        Ok(())
    }
}
