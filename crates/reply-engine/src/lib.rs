// reply-engine/src/lib.rs

pub mod backend;
pub mod config;
pub mod engagement;
pub mod engine_server;
pub mod error;
pub mod memory;
pub mod memory_db;
pub mod metrics;
pub mod orchestrator;
pub mod scheduling;
pub mod shared_state;
pub mod telemetry;
pub mod utils;
pub mod willingness;

// Public API exports
pub use config::Config;
pub use engine_server::{run_engine, run_engine_with_io};
pub use error::{EngineError, EngineResult};
pub use memory::{InMemoryMessageHistory, Message, MessageExcerpt, MessageHistory};
pub use memory_db::SqliteMessageHistory;
pub use shared_state::EngineState;

pub use engagement::{
    CacheStatus, EngagementConfig, EngagementHandoff, EngagementSegmentTracker, InMemoryKeyValueStore,
    KeyValueStore, SqliteKeyValueStore,
};
pub use orchestrator::{
    ActionPlanner, ChatMode, Collaborators, GenerationBackend, GenerationRequest, HandleOutcome, ModeController,
    OrchestratorConfig, OrchestratorState, PlannedAction, RelationshipBuilder, ReplyMode, ReplyOrchestrator,
    ReplyRecord, ReplySender, ThinkingSessionInfo,
};
pub use scheduling::{AddOutcome, PriorityScheduler};
pub use willingness::{WillingnessConfig, WillingnessStore};
