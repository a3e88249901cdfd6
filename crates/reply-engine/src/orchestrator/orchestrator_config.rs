use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use super::frequency::{MAX_UPGRADE_THRESHOLD, MIN_UPGRADE_THRESHOLD};

/// How inbound messages reach the reply decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// Every message goes through the willingness draw as it arrives.
    Interest,
    /// Messages are buffered and the highest-interest one is answered next.
    Priority,
}

impl FromStr for ReplyMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interest" => Ok(Self::Interest),
            "priority" => Ok(Self::Priority),
            other => Err(EngineError::config(format!("unknown reply mode: {}", other))),
        }
    }
}

impl fmt::Display for ReplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interest => write!(f, "interest"),
            Self::Priority => write!(f, "priority"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    Normal,
    /// Enables mode-upgrade checks before each decision.
    Auto,
}

impl FromStr for ChatMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "auto" => Ok(Self::Auto),
            other => Err(EngineError::config(format!("unknown chat mode: {}", other))),
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Per-conversation orchestrator settings. Swappable at runtime; the reply
/// mode and queue capacity only apply to orchestrators created afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub reply_mode: ReplyMode,
    pub chat_mode: ChatMode,
    pub thinking_timeout_secs: u64,
    /// Consecutive timeouts tolerated before the degradation warning.
    pub timeout_warning_threshold: u32,
    /// Target replies per minute.
    pub talk_frequency: f64,
    pub mention_forces_reply: bool,
    pub enable_planner: bool,
    pub upgrade_threshold: f64,
    pub queue_capacity: usize,
    pub recent_reply_capacity: usize,
    /// History messages handed to the backend with each request.
    pub context_messages: usize,
    pub max_segment_chars: usize,
    pub max_segments: usize,
    pub throttle_interval_secs: u64,
    pub priority_poll_interval_ms: u64,
    pub placeholder_cleanup_delay_ms: u64,
    /// Fixed seed for the reply draw; random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reply_mode: ReplyMode::Interest,
            chat_mode: ChatMode::Normal,
            thinking_timeout_secs: 120,
            timeout_warning_threshold: 5,
            talk_frequency: 1.0,
            mention_forces_reply: false,
            enable_planner: false,
            upgrade_threshold: 1.0,
            queue_capacity: 5,
            recent_reply_capacity: 20,
            context_messages: 15,
            max_segment_chars: 240,
            max_segments: 4,
            throttle_interval_secs: 30,
            priority_poll_interval_ms: 1000,
            placeholder_cleanup_delay_ms: 100,
            rng_seed: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn thinking_timeout(&self) -> Duration {
        Duration::from_secs(self.thinking_timeout_secs)
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_secs(self.throttle_interval_secs)
    }

    pub fn priority_poll_interval(&self) -> Duration {
        Duration::from_millis(self.priority_poll_interval_ms)
    }

    pub fn placeholder_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.placeholder_cleanup_delay_ms)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.thinking_timeout_secs == 0 {
            return Err(EngineError::config("thinking timeout must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::config("queue capacity must be at least 1"));
        }
        if self.recent_reply_capacity == 0 {
            return Err(EngineError::config("recent reply capacity must be at least 1"));
        }
        if !self.talk_frequency.is_finite() || self.talk_frequency < 0.0 {
            return Err(EngineError::config(format!(
                "talk frequency must be a non-negative number, got {}",
                self.talk_frequency
            )));
        }
        if !(MIN_UPGRADE_THRESHOLD..=MAX_UPGRADE_THRESHOLD).contains(&self.upgrade_threshold) {
            return Err(EngineError::config(format!(
                "upgrade threshold must be between {} and {}, got {}",
                MIN_UPGRADE_THRESHOLD, MAX_UPGRADE_THRESHOLD, self.upgrade_threshold
            )));
        }
        if self.max_segment_chars == 0 || self.max_segments == 0 {
            return Err(EngineError::config("segment limits must be positive"));
        }
        if self.throttle_interval_secs == 0 || self.priority_poll_interval_ms == 0 {
            return Err(EngineError::config("loop intervals must be positive"));
        }
        Ok(())
    }
}
