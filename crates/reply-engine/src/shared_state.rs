//! Application context owning every engine service
//!
//! One `EngineState` per process. Conversations are created lazily on their
//! first message; each gets its own orchestrator and intake task so a slow
//! conversation never blocks another.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engagement::{EngagementSegmentTracker, KeyValueStore};
use crate::memory::{Message, MessageHistory};
use crate::orchestrator::{Collaborators, ReplyOrchestrator};
use crate::willingness::WillingnessStore;

/// Atomic counters for engine-level bookkeeping
#[derive(Debug, Default)]
pub struct AtomicCounters {
    pub received_messages: AtomicUsize,
    pub active_conversations: AtomicUsize,
    pub rejected_messages: AtomicUsize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_received_messages(&self) -> usize {
        self.received_messages.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_rejected_messages(&self) -> usize {
        self.rejected_messages.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// A conversation's orchestrator plus the channel feeding its intake task.
pub struct ConversationHandle {
    pub orchestrator: ReplyOrchestrator,
    intake: mpsc::UnboundedSender<Message>,
    intake_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationHandle {
    fn spawn(orchestrator: ReplyOrchestrator) -> Self {
        let (intake, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(intake_loop(orchestrator.clone(), rx));
        Self {
            orchestrator,
            intake,
            intake_task: Mutex::new(Some(task)),
        }
    }

    /// Queues the message for the intake task. False once the conversation
    /// has been shut down.
    pub fn submit(&self, message: Message) -> bool {
        self.intake.send(message).is_ok()
    }

    fn close(&self) {
        if let Some(task) = self.intake_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

async fn intake_loop(orchestrator: ReplyOrchestrator, mut rx: mpsc::UnboundedReceiver<Message>) {
    debug!("[{}] intake loop started", orchestrator.conversation_id());
    while let Some(message) = rx.recv().await {
        let mentioned = message.mentions_agent;
        let interest = message.interest_score;
        // Decisions run detached; the engagement update already happened in order.
        drop(orchestrator.dispatch(message, mentioned, interest));
    }
    debug!("[{}] intake loop exited", orchestrator.conversation_id());
}

pub struct EngineState {
    pub config: Arc<Config>,
    pub willingness: Arc<WillingnessStore>,
    pub history: Arc<dyn MessageHistory>,
    pub store: Arc<dyn KeyValueStore>,
    pub counters: Arc<AtomicCounters>,
    collaborators: Collaborators,
    conversations: DashMap<String, Arc<ConversationHandle>>,
    decay_task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineState {
    pub fn new(
        config: Config,
        history: Arc<dyn MessageHistory>,
        store: Arc<dyn KeyValueStore>,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        info!("Initializing engine state");
        config.validate()?;
        let willingness = Arc::new(WillingnessStore::new(config.willingness.clone())?);

        Ok(Self {
            config: Arc::new(config),
            willingness,
            history,
            store,
            counters: Arc::new(AtomicCounters::new()),
            collaborators,
            conversations: DashMap::new(),
            decay_task: Mutex::new(None),
        })
    }

    /// Starts the shared willingness decay. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut decay = self.decay_task.lock().unwrap_or_else(PoisonError::into_inner);
        if decay.is_none() {
            *decay = Some(self.willingness.spawn_decay_task());
        }
    }

    /// Returns the conversation's handle, creating and starting it on first use.
    pub fn conversation(&self, conversation_id: &str) -> anyhow::Result<Arc<ConversationHandle>> {
        if let Some(handle) = self.conversations.get(conversation_id) {
            return Ok(handle.clone());
        }
        match self.conversations.entry(conversation_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let handle = Arc::new(self.open_conversation(conversation_id)?);
                entry.insert(handle.clone());
                self.counters.active_conversations.fetch_add(1, Ordering::Relaxed);
                Ok(handle)
            }
        }
    }

    fn open_conversation(&self, conversation_id: &str) -> anyhow::Result<ConversationHandle> {
        let tracker = Arc::new(EngagementSegmentTracker::load(
            conversation_id,
            &self.config.agent_id,
            self.config.engagement.clone(),
            self.history.clone(),
            self.store.clone(),
        )?);
        let orchestrator = ReplyOrchestrator::new(
            &self.config.agent_id,
            self.config.orchestrator.clone(),
            self.willingness.clone(),
            tracker,
            self.history.clone(),
            self.collaborators.clone(),
        )?;
        orchestrator.start();
        info!("[{}] conversation opened", conversation_id);
        Ok(ConversationHandle::spawn(orchestrator))
    }

    /// Routes an inbound message to its conversation's intake task.
    pub fn submit(&self, message: Message) -> anyhow::Result<()> {
        self.counters.inc_received_messages();
        let handle = self.conversation(&message.conversation_id)?;
        if !handle.submit(message) {
            self.counters.inc_rejected_messages();
            return Err(anyhow::anyhow!("conversation intake is closed"));
        }
        Ok(())
    }

    pub fn orchestrator(&self, conversation_id: &str) -> Option<ReplyOrchestrator> {
        self.conversations.get(conversation_id).map(|h| h.orchestrator.clone())
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.conversations.iter().map(|e| e.key().clone()).collect()
    }

    /// Stops every orchestrator and the decay task and checkpoints every
    /// engagement cache one last time.
    pub fn shutdown(&self) {
        info!("Shutting down {} conversations", self.conversations.len());
        for entry in self.conversations.iter() {
            let handle = entry.value();
            handle.orchestrator.stop();
            handle.close();
            if let Err(e) = handle.orchestrator.tracker().flush() {
                warn!("[{}] final engagement checkpoint failed: {}", entry.key(), e);
            }
        }
        if let Some(task) = self.decay_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engagement::InMemoryKeyValueStore;
    use crate::memory::InMemoryMessageHistory;
    use crate::orchestrator::{GenerationBackend, GenerationRequest, ReplySender, ThinkingSessionInfo};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl GenerationBackend for Echo {
        async fn generate_reply(&self, request: &GenerationRequest) -> anyhow::Result<Option<String>> {
            Ok(Some(format!("echo {}", request.trigger.text)))
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl ReplySender for Collect {
        async fn send_segments(&self, session: &ThinkingSessionInfo, _segments: &[String]) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(session.conversation_id.clone());
            Ok(())
        }
    }

    fn engine(sender: Arc<Collect>) -> EngineState {
        let mut config = Config::default();
        config.orchestrator.mention_forces_reply = true;
        EngineState::new(
            config,
            Arc::new(InMemoryMessageHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            Collaborators::new(Arc::new(Echo), sender),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_conversations_are_created_lazily_and_isolated() {
        let sender = Arc::new(Collect::default());
        let state = engine(sender.clone());
        state.start();

        for conv in ["a", "b"] {
            let message = Message::new(format!("{}-1", conv), conv, "user", "hi", Utc::now()).with_mention(true);
            state.submit(message).unwrap();
        }

        for _ in 0..200 {
            if sender.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut replied = sender.0.lock().unwrap().clone();
        replied.sort();
        assert_eq!(replied, vec!["a", "b"]);

        let mut ids = state.conversation_ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(state.counters.active_conversations.load(Ordering::Relaxed), 2);
        assert_eq!(state.counters.received_messages.load(Ordering::Relaxed), 2);
        state.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_disables_orchestrators() {
        let state = engine(Arc::new(Collect::default()));
        state.start();
        let handle = state.conversation("conv").unwrap();
        assert!(Arc::ptr_eq(&handle, &state.conversation("conv").unwrap()));

        state.shutdown();
        assert!(state.orchestrator("conv").unwrap().is_disabled());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.orchestrator.queue_capacity = 0;
        let result = EngineState::new(
            config,
            Arc::new(InMemoryMessageHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            Collaborators::new(Arc::new(Echo), Arc::new(Collect::default())),
        );
        assert!(result.is_err());
    }
}
