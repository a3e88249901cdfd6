// reply-engine/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::engagement::EngagementConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::willingness::WillingnessConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub backend_url: String,
    pub backend_model: String,
    /// Sender id of the agent itself; its messages are never tracked.
    pub agent_id: String,
    pub data_dir: PathBuf,
    pub willingness: WillingnessConfig,
    pub engagement: EngagementConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8081".to_string(),
            backend_model: "local-llm".to_string(),
            agent_id: "agent".to_string(),
            data_dir: PathBuf::from("./data"),
            willingness: WillingnessConfig::default(),
            engagement: EngagementConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source; unset variables
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let mut willingness = WillingnessConfig::default();
        willingness.interest_rate_amplifier = var("INTEREST_RATE_AMPLIFIER", "1.0")
            .parse()
            .context("INTEREST_RATE_AMPLIFIER must be a number")?;

        let mut engagement = EngagementConfig::default();
        engagement.handoff_threshold = var("HANDOFF_THRESHOLD", "45")
            .parse()
            .context("HANDOFF_THRESHOLD must be a positive integer")?;

        let orchestrator = OrchestratorConfig {
            reply_mode: var("REPLY_MODE", "interest").parse()?,
            chat_mode: var("CHAT_MODE", "normal").parse()?,
            thinking_timeout_secs: var("THINKING_TIMEOUT_SECONDS", "120")
                .parse()
                .context("THINKING_TIMEOUT_SECONDS must be an integer")?,
            timeout_warning_threshold: var("TIMEOUT_WARNING_THRESHOLD", "5")
                .parse()
                .context("TIMEOUT_WARNING_THRESHOLD must be an integer")?,
            talk_frequency: var("TALK_FREQUENCY", "1.0")
                .parse()
                .context("TALK_FREQUENCY must be a number")?,
            mention_forces_reply: parse_flag("MENTION_FORCES_REPLY", &var("MENTION_FORCES_REPLY", "false"))?,
            enable_planner: parse_flag("ENABLE_PLANNER", &var("ENABLE_PLANNER", "false"))?,
            queue_capacity: var("QUEUE_CAPACITY", "5")
                .parse()
                .context("QUEUE_CAPACITY must be an integer")?,
            upgrade_threshold: var("UPGRADE_THRESHOLD", "1.0")
                .parse()
                .context("UPGRADE_THRESHOLD must be a number")?,
            ..OrchestratorConfig::default()
        };

        let config = Self {
            backend_url: var("BACKEND_URL", "http://127.0.0.1:8081"),
            backend_model: var("BACKEND_MODEL", "local-llm"),
            agent_id: var("AGENT_ID", "agent"),
            data_dir: PathBuf::from(var("DATA_DIR", "./data")),
            willingness,
            engagement,
            orchestrator,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(anyhow::anyhow!("AGENT_ID must not be empty"));
        }
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(anyhow::anyhow!("BACKEND_URL must be an http(s) URL, got {}", self.backend_url));
        }
        self.willingness.validate()?;
        self.engagement.validate()?;
        self.orchestrator.validate()?;
        Ok(())
    }

    pub fn engagement_db_path(&self) -> PathBuf {
        self.data_dir.join("engagement.db")
    }

    /// Per-request HTTP timeout; the orchestrator deadline is the real bound.
    pub fn backend_request_timeout(&self) -> Duration {
        self.orchestrator.thinking_timeout() + Duration::from_secs(5)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Agent: {}", self.agent_id);
        info!("- Backend: {} (model {})", self.backend_url, self.backend_model);
        info!("- Data Dir: {}", self.data_dir.display());
        info!(
            "- Reply Mode: {} / Chat Mode: {}",
            self.orchestrator.reply_mode, self.orchestrator.chat_mode
        );
        info!(
            "- Thinking Timeout: {}s (warn after {} in a row)",
            self.orchestrator.thinking_timeout_secs, self.orchestrator.timeout_warning_threshold
        );
        info!("- Talk Frequency: {}/min", self.orchestrator.talk_frequency);
        info!("- Mention Forces Reply: {}", self.orchestrator.mention_forces_reply);
        info!("- Planner: {}", self.orchestrator.enable_planner);
        info!("- Queue Capacity: {}", self.orchestrator.queue_capacity);
        info!("- Upgrade Threshold: {}", self.orchestrator.upgrade_threshold);
        info!("- Interest Rate Amplifier: {}", self.willingness.interest_rate_amplifier);
        info!("- Hand-off Threshold: {}", self.engagement.handoff_threshold);
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow::anyhow!("{} must be a boolean, got {}", key, other)),
    }
}
