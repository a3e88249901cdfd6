use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::memory::Message;
use crate::metrics;
use super::collaborators::ThinkingSessionInfo;

/// One in-flight reply cycle, visible to the platform as a placeholder.
#[derive(Debug)]
pub struct ThinkingSession {
    pub id: String,
    pub anchor_message: Message,
    pub start_time: DateTime<Utc>,
    cancelled: AtomicBool,
}

impl ThinkingSession {
    pub fn new(anchor_message: Message) -> Self {
        Self {
            id: format!("tid-{}", Uuid::new_v4()),
            anchor_message,
            start_time: Utc::now(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.anchor_message.conversation_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> ThinkingSessionInfo {
        ThinkingSessionInfo {
            thinking_id: self.id.clone(),
            conversation_id: self.anchor_message.conversation_id.clone(),
            anchor_message_id: self.anchor_message.id.clone(),
            started_at: self.start_time,
        }
    }
}

/// Placeholders currently shown in one conversation.
#[derive(Debug, Default)]
pub struct PlaceholderRegistry {
    sessions: DashMap<String, Arc<ThinkingSession>>,
}

impl PlaceholderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<ThinkingSession>) {
        if self.sessions.insert(session.id.clone(), session).is_none() {
            metrics::inc_open_sessions();
        }
    }

    /// Removes the placeholder; `None` if it was already released.
    pub fn remove(&self, thinking_id: &str) -> Option<Arc<ThinkingSession>> {
        let removed = self.sessions.remove(thinking_id).map(|(_, session)| session);
        if removed.is_some() {
            metrics::dec_open_sessions();
        }
        removed
    }

    pub fn contains(&self, thinking_id: &str) -> bool {
        self.sessions.contains_key(thinking_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel();
        }
    }

    /// Drops every placeholder and returns how many there were.
    pub fn clear(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.remove(id).is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Arc<ThinkingSession> {
        Arc::new(ThinkingSession::new(Message::new("m1", "conv", "user", "hi", Utc::now())))
    }

    #[test]
    fn test_register_and_remove() {
        let registry = PlaceholderRegistry::new();
        let s = session();
        registry.register(s.clone());
        assert!(registry.contains(&s.id));
        assert!(registry.remove(&s.id).is_some());
        assert!(registry.remove(&s.id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_and_clear() {
        let registry = PlaceholderRegistry::new();
        let a = session();
        let b = session();
        registry.register(a.clone());
        registry.register(b.clone());

        registry.cancel_all();
        assert!(a.is_cancelled() && b.is_cancelled());
        assert_eq!(registry.clear(), 2);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_session_info() {
        let s = session();
        let info = s.info();
        assert_eq!(info.thinking_id, s.id);
        assert_eq!(info.anchor_message_id, "m1");
        assert!(info.thinking_id.starts_with("tid-"));
    }
}
