// src/orchestrator/mod.rs

//! Per-conversation reply orchestration: decision, deadline-bounded
//! generation, sending and adaptive throttling

pub mod collaborators;
pub mod frequency;
pub mod orchestrator_config;
pub mod reply_orchestrator;
pub mod thinking;

// Re-exports
pub use collaborators::{
    ActionPlanner, Collaborators, GenerationBackend, GenerationRequest, ModeController, PlannedAction,
    RelationshipBuilder, ReplySender, ThinkingSessionInfo, NO_ACTION,
};
pub use orchestrator_config::{ChatMode, OrchestratorConfig, ReplyMode};
pub use reply_orchestrator::{HandleOutcome, OrchestratorState, ReplyOrchestrator, ReplyRecord};
pub use thinking::{PlaceholderRegistry, ThinkingSession};
