//! Bounded priority buffering for high-volume conversations

pub mod priority_scheduler;

pub use priority_scheduler::{AddOutcome, PriorityScheduler, DEFAULT_QUEUE_CAPACITY};
