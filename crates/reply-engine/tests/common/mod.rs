#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reply_engine::{
    Collaborators, EngagementConfig, EngagementHandoff, EngagementSegmentTracker, GenerationBackend,
    GenerationRequest, InMemoryMessageHistory, KeyValueStore, Message, OrchestratorConfig, RelationshipBuilder,
    ReplyOrchestrator, ReplySender, ThinkingSessionInfo, WillingnessConfig, WillingnessStore,
};

/// Backend that waits `delay` and then echoes the trigger, or stays silent.
pub struct ScriptedBackend {
    pub delay: Duration,
    pub silent: bool,
    pub calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn echo(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, silent: false, calls: AtomicUsize::new(0) })
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(Self { delay: Duration::ZERO, silent: true, calls: AtomicUsize::new(0) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate_reply(&self, request: &GenerationRequest) -> anyhow::Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.silent {
            return Ok(None);
        }
        Ok(Some(format!("about {}", request.trigger.text)))
    }
}

#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(ThinkingSessionInfo, Vec<String>)>>,
}

impl RecordingSender {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ReplySender for RecordingSender {
    async fn send_segments(&self, session: &ThinkingSessionInfo, segments: &[String]) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((session.clone(), segments.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBuilder {
    pub handoffs: Mutex<Vec<EngagementHandoff>>,
}

#[async_trait]
impl RelationshipBuilder for RecordingBuilder {
    async fn build_relationship(&self, handoff: &EngagementHandoff) -> anyhow::Result<()> {
        self.handoffs.lock().unwrap().push(handoff.clone());
        Ok(())
    }
}

pub struct Fixture {
    pub orchestrator: ReplyOrchestrator,
    pub willingness: Arc<WillingnessStore>,
    pub history: Arc<InMemoryMessageHistory>,
    pub sender: Arc<RecordingSender>,
    pub builder: Arc<RecordingBuilder>,
}

pub fn fixture(
    config: OrchestratorConfig,
    backend: Arc<dyn GenerationBackend>,
    store: Arc<dyn KeyValueStore>,
) -> Fixture {
    let willingness = Arc::new(WillingnessStore::new(WillingnessConfig::default()).unwrap());
    let history = Arc::new(InMemoryMessageHistory::new());
    let tracker = Arc::new(
        EngagementSegmentTracker::load("group-1", "agent", EngagementConfig::default(), history.clone(), store)
            .unwrap(),
    );
    let sender = Arc::new(RecordingSender::default());
    let builder = Arc::new(RecordingBuilder::default());
    let collaborators = Collaborators::new(backend, sender.clone()).with_relationship_builder(builder.clone());
    let orchestrator =
        ReplyOrchestrator::new("agent", config, willingness.clone(), tracker, history.clone(), collaborators).unwrap();
    Fixture { orchestrator, willingness, history, sender, builder }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Message `n` seconds after the base time.
pub fn message_at(n: i64, sender: &str, text: &str) -> Message {
    Message::new(format!("m{}", n), "group-1", sender, text, base_time() + ChronoDuration::seconds(n))
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
