//! Inbound message model and the per-conversation message history the
//! engagement tracker counts against.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// A normalized inbound (or outbound, when recorded by the agent) message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub interest_score: f64,
    #[serde(default)]
    pub mentions_agent: bool,
    /// Served from the unbounded VIP lane in priority mode.
    #[serde(default)]
    pub is_vip: bool,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            timestamp,
            interest_score: 0.0,
            mentions_agent: false,
            is_vip: false,
        }
    }

    pub fn with_interest(mut self, interest_score: f64) -> Self {
        self.interest_score = interest_score;
        self
    }

    pub fn with_mention(mut self, mentions_agent: bool) -> Self {
        self.mentions_agent = mentions_agent;
        self
    }

    pub fn with_vip(mut self, is_vip: bool) -> Self {
        self.is_vip = is_vip;
        self
    }
}

/// One line of the transcript handed to the relationship builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageExcerpt {
    pub timestamp: DateTime<Utc>,
    pub sender_id: String,
    pub text: String,
    /// Marks a synthetic "messages omitted" line between two segments.
    pub is_gap_marker: bool,
}

impl From<&Message> for MessageExcerpt {
    fn from(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp,
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            is_gap_marker: false,
        }
    }
}

/// Time-ordered view of everything said in a conversation.
///
/// All ranges are evaluated against message timestamps; results are always in
/// ascending time order.
pub trait MessageHistory: Send + Sync {
    fn record(&self, message: &Message);

    /// Up to `limit` messages strictly before `before`, the ones closest to it.
    fn messages_before(&self, conversation_id: &str, before: DateTime<Utc>, limit: usize) -> Vec<Message>;

    /// Up to `limit` messages strictly after `after`, the earliest ones.
    fn messages_after(&self, conversation_id: &str, after: DateTime<Utc>, limit: usize) -> Vec<Message>;

    /// Messages with `start <= timestamp <= end`.
    fn messages_in_range(&self, conversation_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Message>;

    /// Number of messages with `start < timestamp < end`.
    fn count_between(&self, conversation_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> usize;

    fn count_in_range(&self, conversation_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        self.messages_in_range(conversation_id, start, end).len()
    }

    /// Drops messages older than `cutoff`. Returns how many were removed.
    fn prune_before(&self, _conversation_id: &str, _cutoff: DateTime<Utc>) -> usize {
        0
    }
}

/// Process-local history. Nothing survives a restart; use
/// `SqliteMessageHistory` when engagement checkpoints are durable.
#[derive(Clone)]
pub struct InMemoryMessageHistory {
    store: Arc<DashMap<String, Vec<Message>>>,
    /// Messages dropped by the capacity bound, per conversation.
    trimmed: Arc<DashMap<String, usize>>,
    max_per_conversation: usize,
}

impl InMemoryMessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `max_per_conversation` messages, dropping the oldest.
    pub fn with_capacity(max_per_conversation: usize) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            trimmed: Arc::new(DashMap::new()),
            max_per_conversation: max_per_conversation.max(1),
        }
    }

    pub fn len(&self, conversation_id: &str) -> usize {
        self.store.get(conversation_id).map(|h| h.len()).unwrap_or(0)
    }

    pub fn trimmed(&self, conversation_id: &str) -> usize {
        self.trimmed.get(conversation_id).map(|n| *n).unwrap_or(0)
    }

    pub fn clear(&self, conversation_id: &str) {
        self.store.remove(conversation_id);
        self.trimmed.remove(conversation_id);
    }
}

impl Default for InMemoryMessageHistory {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl MessageHistory for InMemoryMessageHistory {
    fn record(&self, message: &Message) {
        let mut entry = self.store.entry(message.conversation_id.clone()).or_default();
        // Equal timestamps keep arrival order.
        let pos = entry.partition_point(|m| m.timestamp <= message.timestamp);
        entry.insert(pos, message.clone());
        if entry.len() > self.max_per_conversation {
            let overflow = entry.len() - self.max_per_conversation;
            entry.drain(..overflow);
            drop(entry);

            let mut trimmed = self.trimmed.entry(message.conversation_id.clone()).or_insert(0);
            if *trimmed == 0 {
                warn!(
                    "[{}] message history reached {} messages, dropping the oldest; long segments may be undercounted",
                    message.conversation_id, self.max_per_conversation
                );
            } else {
                debug!("[{}] message history dropped {} old messages", message.conversation_id, overflow);
            }
            *trimmed += overflow;
        }
    }

    fn messages_before(&self, conversation_id: &str, before: DateTime<Utc>, limit: usize) -> Vec<Message> {
        match self.store.get(conversation_id) {
            Some(history) => {
                let end = history.partition_point(|m| m.timestamp < before);
                let start = end.saturating_sub(limit);
                history[start..end].to_vec()
            }
            None => Vec::new(),
        }
    }

    fn messages_after(&self, conversation_id: &str, after: DateTime<Utc>, limit: usize) -> Vec<Message> {
        match self.store.get(conversation_id) {
            Some(history) => {
                let start = history.partition_point(|m| m.timestamp <= after);
                history[start..].iter().take(limit).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    fn messages_in_range(&self, conversation_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Message> {
        if end < start {
            return Vec::new();
        }
        match self.store.get(conversation_id) {
            Some(history) => {
                let lo = history.partition_point(|m| m.timestamp < start);
                let hi = history.partition_point(|m| m.timestamp <= end);
                history[lo..hi].to_vec()
            }
            None => Vec::new(),
        }
    }

    fn count_between(&self, conversation_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        if end <= start {
            return 0;
        }
        match self.store.get(conversation_id) {
            Some(history) => {
                let lo = history.partition_point(|m| m.timestamp <= start);
                let hi = history.partition_point(|m| m.timestamp < end);
                hi.saturating_sub(lo)
            }
            None => 0,
        }
    }

    fn count_in_range(&self, conversation_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        if end < start {
            return 0;
        }
        match self.store.get(conversation_id) {
            Some(history) => {
                let lo = history.partition_point(|m| m.timestamp < start);
                let hi = history.partition_point(|m| m.timestamp <= end);
                hi.saturating_sub(lo)
            }
            None => 0,
        }
    }

    fn prune_before(&self, conversation_id: &str, cutoff: DateTime<Utc>) -> usize {
        match self.store.get_mut(conversation_id) {
            Some(mut history) => {
                let stale = history.partition_point(|m| m.timestamp < cutoff);
                history.drain(..stale);
                stale
            }
            None => 0,
        }
    }
}
