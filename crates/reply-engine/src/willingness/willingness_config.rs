use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Tuning constants of the willingness model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WillingnessConfig {
    /// How often every conversation's score decays.
    pub decay_interval_ms: u64,

    /// Multiplier applied to the score on each decay tick.
    pub decay_factor: f64,

    /// Effective interest must exceed this to raise the score.
    pub interest_threshold: f64,

    /// Subtracted from effective interest before it is added to the score.
    pub interest_offset: f64,

    pub mention_bonus: f64,

    /// Mention bonus once the score has already reached `mention_bonus`.
    pub saturated_mention_bonus: f64,

    pub max_score: f64,

    /// Charged when a reply cycle starts generating.
    pub commit_cost: f64,

    /// Given back after a successful reply, while the score is below `refund_ceiling`.
    pub refund_amount: f64,
    pub refund_ceiling: f64,

    /// Static multiplier on every interest score.
    pub interest_rate_amplifier: f64,

    pub min_amplifier: f64,
    pub max_amplifier: f64,
}

impl Default for WillingnessConfig {
    fn default() -> Self {
        Self {
            decay_interval_ms: 1000,
            decay_factor: 0.9,
            interest_threshold: 0.4,
            interest_offset: 0.3,
            mention_bonus: 1.0,
            saturated_mention_bonus: 0.05,
            max_score: 3.0,
            commit_cost: 1.8,
            refund_amount: 0.4,
            refund_ceiling: 1.0,
            interest_rate_amplifier: 1.0,
            min_amplifier: 0.2,
            max_amplifier: 5.0,
        }
    }
}

impl WillingnessConfig {
    pub fn decay_interval(&self) -> Duration {
        Duration::from_millis(self.decay_interval_ms)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.decay_interval_ms == 0 {
            return Err(EngineError::config("decay interval must be positive"));
        }
        if !(0.0..1.0).contains(&self.decay_factor) {
            return Err(EngineError::config(format!(
                "decay factor must be in [0, 1), got {}",
                self.decay_factor
            )));
        }
        if !(self.max_score > 0.0) {
            return Err(EngineError::config("max score must be positive"));
        }
        if self.commit_cost < 0.0 || self.refund_amount < 0.0 || self.mention_bonus < 0.0 {
            return Err(EngineError::config("score adjustments must not be negative"));
        }
        if !(self.interest_rate_amplifier > 0.0) {
            return Err(EngineError::config("interest rate amplifier must be positive"));
        }
        if !(self.min_amplifier > 0.0) || self.min_amplifier > self.max_amplifier {
            return Err(EngineError::config(format!(
                "amplifier bounds are invalid: [{}, {}]",
                self.min_amplifier, self.max_amplifier
            )));
        }
        Ok(())
    }
}
