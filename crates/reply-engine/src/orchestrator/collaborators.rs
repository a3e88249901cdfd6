//! Seams to the services the orchestrator drives but does not own

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engagement::EngagementHandoff;
use crate::memory::Message;

pub const NO_ACTION: &str = "no_action";

/// Everything a backend needs to compose one reply.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub thinking_id: String,
    pub trigger: Message,
    /// Messages before the trigger, oldest first.
    pub context: Vec<Message>,
    /// Texts of the most recent replies, newest first.
    pub recent_replies: Vec<String>,
}

/// Identifies the placeholder an outbound reply replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingSessionInfo {
    pub thinking_id: String,
    pub conversation_id: String,
    pub anchor_message_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub action_type: String,
    /// Parallel actions run alongside the text reply instead of replacing it.
    pub is_parallel: bool,
    #[serde(default)]
    pub reasoning: String,
}

impl PlannedAction {
    pub fn no_action() -> Self {
        Self {
            action_type: NO_ACTION.to_string(),
            is_parallel: true,
            reasoning: String::new(),
        }
    }

    pub fn is_no_action(&self) -> bool {
        self.action_type == NO_ACTION
    }

    /// Whether the action takes the place of the text reply.
    pub fn preempts_reply(&self) -> bool {
        !self.is_no_action() && !self.is_parallel
    }
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// `Ok(None)` when the model produced nothing usable.
    async fn generate_reply(&self, request: &GenerationRequest) -> anyhow::Result<Option<String>>;
}

#[async_trait]
pub trait ActionPlanner: Send + Sync {
    /// Picks an action for the trigger and executes it if it is not `no_action`.
    async fn plan_and_execute(&self, request: &GenerationRequest) -> anyhow::Result<PlannedAction>;
}

#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send_segments(&self, session: &ThinkingSessionInfo, segments: &[String]) -> anyhow::Result<()>;
}

#[async_trait]
pub trait RelationshipBuilder: Send + Sync {
    async fn build_relationship(&self, handoff: &EngagementHandoff) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ModeController: Send + Sync {
    /// `Ok(true)` when the conversation moved to the more expensive mode.
    async fn request_upgrade(&self, conversation_id: &str) -> anyhow::Result<bool>;

    /// Progress in `[0, 1]` of the cooldown after leaving that mode, if any.
    fn cooldown_progress(&self, _conversation_id: &str) -> Option<f64> {
        None
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn GenerationBackend>,
    pub sender: Arc<dyn ReplySender>,
    pub planner: Option<Arc<dyn ActionPlanner>>,
    pub relationship_builder: Option<Arc<dyn RelationshipBuilder>>,
    pub mode_controller: Option<Arc<dyn ModeController>>,
}

impl Collaborators {
    pub fn new(backend: Arc<dyn GenerationBackend>, sender: Arc<dyn ReplySender>) -> Self {
        Self {
            backend,
            sender,
            planner: None,
            relationship_builder: None,
            mode_controller: None,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn ActionPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_relationship_builder(mut self, builder: Arc<dyn RelationshipBuilder>) -> Self {
        self.relationship_builder = Some(builder);
        self
    }

    pub fn with_mode_controller(mut self, controller: Arc<dyn ModeController>) -> Self {
        self.mode_controller = Some(controller);
        self
    }
}
