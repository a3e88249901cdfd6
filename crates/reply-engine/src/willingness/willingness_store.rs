use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::memory::Message;
use super::willingness_config::WillingnessConfig;

/// Per-conversation reply inclination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WillingnessState {
    pub score: f64,
    pub amplifier: f64,
}

impl Default for WillingnessState {
    fn default() -> Self {
        Self { score: 0.0, amplifier: 1.0 }
    }
}

#[derive(Debug, Clone)]
struct PendingEvaluation {
    conversation_id: String,
    interest: f64,
    mentioned: bool,
    evaluated: bool,
}

/// Maps a willingness score to a reply probability in `[0.02, 1]`.
pub fn probability_for_score(score: f64) -> f64 {
    ((score - 0.5).max(0.01) * 2.0).min(1.0)
}

/// Decaying willingness scores for every conversation plus the evaluations
/// currently in flight.
///
/// Lock order is always `pending` before `states`; the decay task only ever
/// touches `states`.
pub struct WillingnessStore {
    config: WillingnessConfig,
    states: DashMap<String, WillingnessState>,
    pending: DashMap<String, PendingEvaluation>,
}

impl WillingnessStore {
    pub fn new(config: WillingnessConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            states: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    pub fn config(&self) -> &WillingnessConfig {
        &self.config
    }

    /// Registers a pending evaluation for `message`.
    pub fn setup(&self, message: &Message, interest: f64, mentioned: bool) {
        self.states.entry(message.conversation_id.clone()).or_default();
        self.pending.insert(
            message.id.clone(),
            PendingEvaluation {
                conversation_id: message.conversation_id.clone(),
                interest: if interest.is_finite() { interest.max(0.0) } else { 0.0 },
                mentioned,
                evaluated: false,
            },
        );
    }

    /// Folds the message's interest and mention into the conversation score and
    /// returns the resulting reply probability.
    ///
    /// The score update happens once per registered message; later calls only
    /// read. `None` for an unknown id.
    pub fn get_reply_probability(&self, message_id: &str) -> Option<f64> {
        let (conversation_id, interest, mentioned, first) = {
            let mut pending = self.pending.get_mut(message_id)?;
            let first = !pending.evaluated;
            pending.evaluated = true;
            (pending.conversation_id.clone(), pending.interest, pending.mentioned, first)
        };

        let mut state = self.states.entry(conversation_id.clone()).or_default();
        if first {
            let cfg = &self.config;
            let effective = interest * state.amplifier * cfg.interest_rate_amplifier;
            if effective > cfg.interest_threshold {
                state.score += effective - cfg.interest_offset;
            }
            if mentioned {
                state.score += if state.score < cfg.mention_bonus {
                    cfg.mention_bonus
                } else {
                    cfg.saturated_mention_bonus
                };
            }
            state.score = state.score.clamp(0.0, cfg.max_score);
            debug!(
                "[{}] willingness updated: interest={:.3} effective={:.3} mentioned={} score={:.3}",
                conversation_id, interest, effective, mentioned, state.score
            );
        }
        Some(probability_for_score(state.score))
    }

    /// Charges the commitment cost when a reply cycle starts generating.
    pub fn before_commit(&self, message_id: &str) {
        let Some(conversation_id) = self.pending.get(message_id).map(|p| p.conversation_id.clone()) else {
            return;
        };
        if let Some(mut state) = self.states.get_mut(&conversation_id) {
            state.score = (state.score - self.config.commit_cost).max(0.0);
        }
    }

    /// Partial refund after a successful reply; finalizes the evaluation.
    pub fn after_commit(&self, message_id: &str) {
        let Some((_, pending)) = self.pending.remove(message_id) else {
            return;
        };
        if let Some(mut state) = self.states.get_mut(&pending.conversation_id) {
            if state.score < self.config.refund_ceiling {
                state.score = (state.score + self.config.refund_amount).min(self.config.refund_ceiling);
            }
        }
    }

    /// Finalizes an evaluation that did not lead to a reply.
    pub fn not_reply(&self, message_id: &str) {
        self.pending.remove(message_id);
    }

    /// Drops an evaluation without any refund (failure or cancellation).
    pub fn release(&self, message_id: &str) {
        self.pending.remove(message_id);
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn state(&self, conversation_id: &str) -> Option<WillingnessState> {
        self.states.get(conversation_id).map(|s| *s)
    }

    pub fn score(&self, conversation_id: &str) -> f64 {
        self.state(conversation_id).map(|s| s.score).unwrap_or(0.0)
    }

    pub fn amplifier(&self, conversation_id: &str) -> f64 {
        self.state(conversation_id).map(|s| s.amplifier).unwrap_or(1.0)
    }

    /// Sets the conversation's amplifier, clamped to the configured bounds.
    /// Returns the value actually stored.
    pub fn set_amplifier(&self, conversation_id: &str, amplifier: f64) -> f64 {
        let clamped = if amplifier.is_finite() {
            amplifier.clamp(self.config.min_amplifier, self.config.max_amplifier)
        } else {
            1.0
        };
        self.states.entry(conversation_id.to_string()).or_default().amplifier = clamped;
        clamped
    }

    /// One decay step for every conversation.
    pub fn decay_once(&self) {
        for mut entry in self.states.iter_mut() {
            entry.score = (entry.score * self.config.decay_factor).max(0.0);
        }
    }

    /// Runs `decay_once` on a fixed interval until the store is dropped or the
    /// handle is aborted.
    pub fn spawn_decay_task(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.decay_interval();
        info!("Starting willingness decay every {:?}", period);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => store.decay_once(),
                    None => break,
                }
            }
        })
    }
}
