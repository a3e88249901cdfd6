//! Per-user engagement segments with merge, hand-off and eviction

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::memory::{Message, MessageExcerpt, MessageHistory};
use super::engagement_config::EngagementConfig;
use super::kv_store::KeyValueStore;
use super::snapshot::{decode_snapshot, encode_snapshot, storage_key};

pub const GAP_MARKER_TEXT: &str = "...(messages omitted)...";

/// A contiguous burst of one user's activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementSegment {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub last_message_time: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngagementCache {
    pub users: BTreeMap<String, Vec<EngagementSegment>>,
    pub last_processed_time: Option<DateTime<Utc>>,
    pub last_cleanup_time: Option<DateTime<Utc>>,
}

/// Payload for the relationship builder once a user crosses the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementHandoff {
    pub conversation_id: String,
    pub user_id: String,
    pub total_messages: usize,
    pub excerpts: Vec<MessageExcerpt>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_segments: usize,
    pub removed_users: usize,
    pub pruned_messages: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserEngagementStatus {
    pub user_id: String,
    pub total_messages: usize,
    pub segments: Vec<EngagementSegment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub conversation_id: String,
    pub handoff_threshold: usize,
    pub users: Vec<UserEngagementStatus>,
    pub last_processed_time: Option<DateTime<Utc>>,
    pub last_cleanup_time: Option<DateTime<Utc>>,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "engagement cache for {}: {} users", self.conversation_id, self.users.len())?;
        for user in &self.users {
            writeln!(
                f,
                "  {}: {}/{} messages in {} segments",
                user.user_id,
                user.total_messages,
                self.handoff_threshold,
                user.segments.len()
            )?;
            for segment in &user.segments {
                writeln!(
                    f,
                    "    {} .. {} ({} messages)",
                    segment.start_time.format("%m-%d %H:%M"),
                    segment.end_time.format("%m-%d %H:%M"),
                    segment.message_count
                )?;
            }
        }
        let fmt_time = |t: &Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into());
        write!(
            f,
            "last processed: {}, last cleanup: {}",
            fmt_time(&self.last_processed_time),
            fmt_time(&self.last_cleanup_time)
        )
    }
}

/// Tracks engagement bursts for every user of one conversation.
///
/// The cache is checkpointed to the key-value store after every mutation.
pub struct EngagementSegmentTracker {
    conversation_id: String,
    agent_id: String,
    config: EngagementConfig,
    history: Arc<dyn MessageHistory>,
    store: Arc<dyn KeyValueStore>,
    cache: Mutex<EngagementCache>,
}

impl EngagementSegmentTracker {
    /// Loads the persisted cache for `conversation_id`. An unreadable snapshot
    /// is logged and replaced by an empty cache.
    pub fn load(
        conversation_id: &str,
        agent_id: &str,
        config: EngagementConfig,
        history: Arc<dyn MessageHistory>,
        store: Arc<dyn KeyValueStore>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let key = storage_key(conversation_id);

        let cache = match store.load(&key) {
            Ok(Some(bytes)) => match decode_snapshot(conversation_id, &bytes) {
                Ok(cache) => {
                    info!(
                        "[{}] loaded engagement cache with {} users",
                        conversation_id,
                        cache.users.len()
                    );
                    cache
                }
                Err(e) => {
                    warn!("[{}] {}; starting with an empty engagement cache", conversation_id, e);
                    EngagementCache::default()
                }
            },
            Ok(None) => EngagementCache::default(),
            Err(e) => {
                warn!("[{}] cannot read engagement cache: {}; starting empty", conversation_id, e);
                EngagementCache::default()
            }
        };

        Ok(Self {
            conversation_id: conversation_id.to_string(),
            agent_id: agent_id.to_string(),
            config,
            history,
            store,
            cache: Mutex::new(cache),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngagementCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Feeds one message (already recorded in history) into the tracker.
    ///
    /// Returns the hand-off when the sender's total reaches the threshold; the
    /// sender's entry is cleared at the same time.
    pub fn observe(&self, message: &Message) -> Option<EngagementHandoff> {
        if message.sender_id == self.agent_id || message.conversation_id != self.conversation_id {
            return None;
        }

        let mut cache = self.lock();
        let timestamp = message.timestamp;
        if cache.last_processed_time.is_some_and(|last| timestamp <= last) {
            debug!("[{}] skipping already processed message {}", self.conversation_id, message.id);
            return None;
        }
        cache.last_processed_time = Some(timestamp);

        let user_id = message.sender_id.clone();
        let total = {
            let segments = cache.users.entry(user_id.clone()).or_default();
            match segments.last_mut() {
                None => segments.push(self.open_segment(timestamp)),
                Some(current) => {
                    let between = self
                        .history
                        .count_between(&self.conversation_id, current.last_message_time, timestamp);
                    if between <= self.config.merge_gap_messages {
                        current.end_time = timestamp;
                        current.last_message_time = timestamp;
                        // History may be shorter than the checkpoint after a restart.
                        current.message_count = self
                            .count_segment(current.start_time, timestamp)
                            .max(current.message_count + 1);
                    } else {
                        self.close_segment(current, timestamp);
                        segments.push(self.open_segment(timestamp));
                    }
                }
            }
            segments.iter().map(|s| s.message_count).sum::<usize>()
        };

        let handoff = if total >= self.config.handoff_threshold {
            let segments = cache.users.remove(&user_id).unwrap_or_default();
            info!(
                "[{}] {} reached {} engagement messages over {} segments, handing off",
                self.conversation_id,
                user_id,
                total,
                segments.len()
            );
            Some(self.build_handoff(&user_id, total, &segments))
        } else {
            None
        };

        self.persist(&cache);
        handoff
    }

    /// New segment reaching back over the lead-in messages before `timestamp`.
    fn open_segment(&self, timestamp: DateTime<Utc>) -> EngagementSegment {
        let lead_in = self
            .history
            .messages_before(&self.conversation_id, timestamp, self.config.lead_in_messages);
        let start_time = lead_in.first().map(|m| m.timestamp).unwrap_or(timestamp);
        EngagementSegment {
            start_time,
            end_time: timestamp,
            last_message_time: timestamp,
            message_count: self.count_segment(start_time, timestamp),
        }
    }

    /// Extends a finished segment over the trailing context, when enough of it
    /// exists before `next_start`.
    fn close_segment(&self, segment: &mut EngagementSegment, next_start: DateTime<Utc>) {
        let wanted = self.config.trailing_messages;
        if wanted == 0 {
            return;
        }
        let trailing = self
            .history
            .messages_after(&self.conversation_id, segment.last_message_time, wanted);
        if trailing.len() < wanted {
            return;
        }
        if let Some(last) = trailing.last() {
            if last.timestamp < next_start {
                segment.end_time = last.timestamp;
                segment.last_message_time = last.timestamp;
                segment.message_count = self
                    .count_segment(segment.start_time, last.timestamp)
                    .max(segment.message_count);
            }
        }
    }

    fn count_segment(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        self.history.count_in_range(&self.conversation_id, start, end).max(1)
    }

    fn build_handoff(&self, user_id: &str, total: usize, segments: &[EngagementSegment]) -> EngagementHandoff {
        let mut excerpts = Vec::new();
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                excerpts.push(MessageExcerpt {
                    timestamp: segment.start_time,
                    sender_id: String::new(),
                    text: GAP_MARKER_TEXT.to_string(),
                    is_gap_marker: true,
                });
            }
            excerpts.extend(
                self.history
                    .messages_in_range(&self.conversation_id, segment.start_time, segment.end_time)
                    .iter()
                    .map(MessageExcerpt::from),
            );
        }
        EngagementHandoff {
            conversation_id: self.conversation_id.clone(),
            user_id: user_id.to_string(),
            total_messages: total,
            excerpts,
        }
    }

    /// Interval-gated eviction of old segments. `None` when the sweep was not due.
    pub fn sweep(&self, now: DateTime<Utc>) -> Option<CleanupStats> {
        if !self.config.enable_cleanup {
            return None;
        }
        let mut cache = self.lock();
        let interval = Duration::seconds(self.config.cleanup_interval_secs);
        if cache.last_cleanup_time.is_some_and(|last| now - last < interval) {
            return None;
        }

        let cutoff = now - Duration::seconds(self.config.max_segment_age_secs);
        let max_segments = self.config.max_segments_per_user;
        let mut stats = CleanupStats::default();

        for segments in cache.users.values_mut() {
            let before = segments.len();
            segments.retain(|s| s.end_time >= cutoff);
            if segments.len() > max_segments {
                segments.sort_by_key(|s| s.start_time);
                let overflow = segments.len() - max_segments;
                segments.drain(..overflow);
            }
            stats.removed_segments += before - segments.len();
        }
        let users_before = cache.users.len();
        cache.users.retain(|_, segments| !segments.is_empty());
        stats.removed_users = users_before - cache.users.len();
        cache.last_cleanup_time = Some(now);

        // Keep every message a surviving segment can still be recounted over.
        let history_cutoff = cache
            .users
            .values()
            .flatten()
            .map(|s| s.start_time)
            .min()
            .map_or(cutoff, |earliest| earliest.min(cutoff));
        stats.pruned_messages = self.history.prune_before(&self.conversation_id, history_cutoff);

        if stats.removed_segments > 0 || stats.removed_users > 0 {
            info!(
                "[{}] engagement cleanup removed {} segments and {} users",
                self.conversation_id, stats.removed_segments, stats.removed_users
            );
        }
        self.persist(&cache);
        Some(stats)
    }

    /// Drops everything tracked for `user_id`. Returns whether anything was removed.
    pub fn force_cleanup_user(&self, user_id: &str) -> bool {
        let mut cache = self.lock();
        let removed = cache.users.remove(user_id).is_some();
        if removed {
            self.persist(&cache);
        }
        removed
    }

    pub fn user_total(&self, user_id: &str) -> usize {
        self.lock()
            .users
            .get(user_id)
            .map(|segments| segments.iter().map(|s| s.message_count).sum())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> EngagementCache {
        self.lock().clone()
    }

    pub fn cache_status(&self) -> CacheStatus {
        let cache = self.lock();
        CacheStatus {
            conversation_id: self.conversation_id.clone(),
            handoff_threshold: self.config.handoff_threshold,
            users: cache
                .users
                .iter()
                .map(|(user_id, segments)| UserEngagementStatus {
                    user_id: user_id.clone(),
                    total_messages: segments.iter().map(|s| s.message_count).sum(),
                    segments: segments.clone(),
                })
                .collect(),
            last_processed_time: cache.last_processed_time,
            last_cleanup_time: cache.last_cleanup_time,
        }
    }

    /// Writes the cache through. Failures are logged, never propagated.
    fn persist(&self, cache: &EngagementCache) {
        let result = encode_snapshot(&self.conversation_id, cache)
            .and_then(|bytes| self.store.save(&storage_key(&self.conversation_id), &bytes));
        if let Err(e) = result {
            error!("[{}] failed to checkpoint engagement cache: {}", self.conversation_id, e);
        }
    }

    /// Flushes the cache explicitly; used on shutdown.
    pub fn flush(&self) -> EngineResult<()> {
        let cache = self.lock();
        let bytes = encode_snapshot(&self.conversation_id, &cache)?;
        self.store
            .save(&storage_key(&self.conversation_id), &bytes)
            .map_err(|e| EngineError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engagement::kv_store::InMemoryKeyValueStore;
    use crate::memory::InMemoryMessageHistory;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    struct Fixture {
        history: Arc<InMemoryMessageHistory>,
        store: Arc<InMemoryKeyValueStore>,
        tracker: EngagementSegmentTracker,
        next: i64,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(EngagementConfig::default())
        }

        fn with_config(config: EngagementConfig) -> Self {
            let history = Arc::new(InMemoryMessageHistory::new());
            let store = Arc::new(InMemoryKeyValueStore::new());
            let tracker = EngagementSegmentTracker::load("conv", "agent", config, history.clone(), store.clone()).unwrap();
            Self { history, store, tracker, next: 0 }
        }

        fn post(&mut self, sender: &str) -> Option<EngagementHandoff> {
            let message = Message::new(format!("m{}", self.next), "conv", sender, format!("{} says {}", sender, self.next), at(self.next));
            self.next += 1;
            self.history.record(&message);
            self.tracker.observe(&message)
        }

        /// Agent messages fill history without being tracked themselves.
        fn chatter(&mut self, count: usize) {
            for _ in 0..count {
                self.post("agent");
            }
        }

        fn segments(&self, user: &str) -> Vec<EngagementSegment> {
            self.tracker.snapshot().users.get(user).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn test_first_segment_backdated_over_lead_in() {
        let mut fx = Fixture::new();
        fx.history.record(&Message::new("x0", "conv", "bystander", "a", at(-10)));
        fx.history.record(&Message::new("x1", "conv", "bystander", "b", at(-9)));
        for i in 0..5 {
            fx.history.record(&Message::new(format!("y{}", i), "conv", "bystander", "c", at(i)));
        }
        fx.next = 5;
        fx.post("alice");

        let segments = fx.segments("alice");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_time, at(0));
        assert_eq!(segments[0].end_time, at(5));
        assert_eq!(segments[0].message_count, 6);
    }

    #[test]
    fn test_small_gap_extends_segment() {
        let mut fx = Fixture::new();
        fx.post("alice");
        fx.chatter(10);
        fx.post("alice");

        let segments = fx.segments("alice");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].end_time, at(11));
        assert_eq!(segments[0].message_count, 12);
    }

    #[test]
    fn test_large_gap_opens_new_segment_with_trailing_context() {
        let mut fx = Fixture::new();
        fx.post("alice");
        fx.chatter(11);
        fx.post("alice");

        let segments = fx.segments("alice");
        assert_eq!(segments.len(), 2);
        // Closed segment absorbs the five messages after alice's first one.
        assert_eq!(segments[0].start_time, at(0));
        assert_eq!(segments[0].end_time, at(5));
        assert_eq!(segments[0].message_count, 6);
        // New segment reaches back five messages.
        assert_eq!(segments[1].start_time, at(7));
        assert_eq!(segments[1].end_time, at(12));
        assert_eq!(segments[1].message_count, 6);
        assert!(segments[0].end_time <= segments[1].start_time);
    }

    #[test]
    fn test_other_users_tracked_independently() {
        let mut fx = Fixture::new();
        fx.post("alice");
        fx.post("bob");
        assert_eq!(fx.segments("alice").len(), 1);
        assert_eq!(fx.segments("bob").len(), 1);
        assert_eq!(fx.tracker.user_total("bob"), 2);
    }

    #[test]
    fn test_agent_and_stale_messages_ignored() {
        let mut fx = Fixture::new();
        fx.post("agent");
        assert!(fx.tracker.snapshot().users.is_empty());

        fx.post("alice");
        let stale = Message::new("old", "conv", "bob", "late", at(-100));
        fx.history.record(&stale);
        assert!(fx.tracker.observe(&stale).is_none());
        assert!(fx.segments("bob").is_empty());
    }

    #[test]
    fn test_handoff_fires_once_and_clears_user() {
        let mut fx = Fixture::new();
        let mut handoffs = Vec::new();
        for _ in 0..44 {
            if let Some(h) = fx.post("alice") {
                handoffs.push(h);
            }
        }
        assert!(handoffs.is_empty());
        assert_eq!(fx.tracker.user_total("alice"), 44);

        let handoff = fx.post("alice").expect("threshold reached");
        assert_eq!(handoff.user_id, "alice");
        assert_eq!(handoff.total_messages, 45);
        assert_eq!(handoff.excerpts.len(), 45);
        assert!(handoff.excerpts.iter().all(|e| !e.is_gap_marker));
        assert!(fx.segments("alice").is_empty());

        assert!(fx.post("alice").is_none());
        assert_eq!(fx.segments("alice").len(), 1);
    }

    #[test]
    fn test_handoff_inserts_gap_markers() {
        let config = EngagementConfig { handoff_threshold: 10, ..Default::default() };
        let mut fx = Fixture::with_config(config);
        fx.post("alice");
        fx.chatter(11);
        let handoff = fx.post("alice").expect("12 messages over two segments");

        let markers: Vec<_> = handoff.excerpts.iter().filter(|e| e.is_gap_marker).collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(handoff.excerpts.len(), 6 + 1 + 6);
        assert!(handoff.excerpts[6].is_gap_marker);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let mut fx = Fixture::new();
        fx.post("alice");
        fx.chatter(11);
        fx.post("alice");
        fx.tracker.sweep(at(100));

        let reloaded = EngagementSegmentTracker::load(
            "conv",
            "agent",
            EngagementConfig::default(),
            fx.history.clone(),
            fx.store.clone(),
        )
        .unwrap();
        assert_eq!(reloaded.snapshot(), fx.tracker.snapshot());
        assert_eq!(reloaded.snapshot().last_cleanup_time, Some(at(100)));
    }

    #[test]
    fn test_reload_without_history_keeps_counts() {
        let mut fx = Fixture::new();
        for _ in 0..30 {
            fx.post("alice");
        }
        assert_eq!(fx.tracker.user_total("alice"), 30);

        let fresh = Arc::new(InMemoryMessageHistory::new());
        let reloaded =
            EngagementSegmentTracker::load("conv", "agent", EngagementConfig::default(), fresh.clone(), fx.store.clone())
                .unwrap();
        assert_eq!(reloaded.user_total("alice"), 30);

        let next = Message::new("m30", "conv", "alice", "still here", at(30));
        fresh.record(&next);
        assert!(reloaded.observe(&next).is_none());
        assert_eq!(reloaded.user_total("alice"), 31);
        assert_eq!(reloaded.snapshot().users["alice"].len(), 1);
    }

    #[test]
    fn test_sweep_prunes_history_behind_live_segments() {
        let config = EngagementConfig { max_segment_age_secs: 3600, ..Default::default() };
        let mut fx = Fixture::with_config(config);
        fx.post("alice");
        fx.post("alice");
        fx.history.record(&Message::new("old", "conv", "bystander", "ancient", at(-7200)));

        let stats = fx.tracker.sweep(at(60)).unwrap();
        assert_eq!(stats.pruned_messages, 1);
        assert_eq!(fx.history.len("conv"), 2);
        assert_eq!(fx.tracker.user_total("alice"), 2);
    }

    #[test]
    fn test_corrupted_snapshot_loads_empty() {
        let history = Arc::new(InMemoryMessageHistory::new());
        let store = Arc::new(InMemoryKeyValueStore::new());
        store.save(&storage_key("conv"), b"not json").unwrap();

        let tracker = EngagementSegmentTracker::load("conv", "agent", EngagementConfig::default(), history, store).unwrap();
        assert_eq!(tracker.snapshot(), EngagementCache::default());
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = EngagementConfig { max_segments_per_user: 0, ..Default::default() };
        let result = EngagementSegmentTracker::load(
            "conv",
            "agent",
            config,
            Arc::new(InMemoryMessageHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_sweep_removes_old_and_caps_count() {
        let config = EngagementConfig { max_segments_per_user: 2, ..Default::default() };
        let mut fx = Fixture::with_config(config);
        for _ in 0..4 {
            fx.post("alice");
            fx.chatter(11);
        }
        fx.post("bob");
        assert_eq!(fx.segments("alice").len(), 4);

        let now = at(60);
        let stats = fx.tracker.sweep(now).unwrap();
        assert_eq!(stats.removed_segments, 2);
        assert_eq!(fx.segments("alice").len(), 2);

        // Not due again within the interval.
        assert!(fx.tracker.sweep(now + Duration::minutes(30)).is_none());

        let later = now + Duration::days(8);
        let stats = fx.tracker.sweep(later).unwrap();
        assert_eq!(stats.removed_users, 2);
        assert!(fx.tracker.snapshot().users.is_empty());
    }

    #[test]
    fn test_cache_status_reports_totals() {
        let mut fx = Fixture::new();
        fx.post("alice");
        fx.post("alice");
        let status = fx.tracker.cache_status();
        assert_eq!(status.users.len(), 1);
        assert_eq!(status.users[0].total_messages, 2);
        assert!(status.to_string().contains("alice: 2/45 messages in 1 segments"));
    }

    #[test]
    fn test_force_cleanup_user() {
        let mut fx = Fixture::new();
        fx.post("alice");
        assert!(fx.tracker.force_cleanup_user("alice"));
        assert!(!fx.tracker.force_cleanup_user("alice"));
    }

    proptest! {
        #[test]
        fn prop_merge_rule(gap in 0usize..25) {
            let mut fx = Fixture::new();
            fx.post("alice");
            fx.chatter(gap);
            fx.post("alice");
            let expected = if gap <= 10 { 1 } else { 2 };
            prop_assert_eq!(fx.segments("alice").len(), expected);
        }
    }
}
