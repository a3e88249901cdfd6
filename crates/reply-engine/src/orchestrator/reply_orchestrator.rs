use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::future::join;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::engagement::{CacheStatus, EngagementSegmentTracker};
use crate::error::{EngineError, EngineResult};
use crate::memory::{Message, MessageHistory};
use crate::metrics;
use crate::scheduling::{AddOutcome, PriorityScheduler};
use crate::utils::TextUtils;
use crate::willingness::WillingnessStore;
use super::collaborators::{Collaborators, GenerationRequest, PlannedAction};
use super::frequency::{
    amplifier_for_rate, suppress_increase, upgrade_placeholder_limit, upgrade_reply_window,
    ReplyRateTracker, EVALUATION_WINDOW, SUPPRESSION_WINDOW,
};
use super::orchestrator_config::{ChatMode, OrchestratorConfig, ReplyMode};
use super::thinking::{PlaceholderRegistry, ThinkingSession};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrchestratorState {
    Idle = 0,
    Deciding = 1,
    Generating = 2,
    Sending = 3,
    Disabled = 4,
}

impl OrchestratorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Deciding,
            2 => Self::Generating,
            3 => Self::Sending,
            4 => Self::Disabled,
            _ => Self::Idle,
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// Disabled, foreign conversation, or the agent's own message.
    Ignored,
    Queued,
    Rejected,
    Declined { probability: f64 },
    Replied { segments: Vec<String> },
    /// The backend produced no usable text.
    NoReply,
    /// A non-parallel planner action replaced the text reply.
    Preempted { action_type: String },
    TimedOut,
    Failed(String),
    ModeUpgraded,
    Cancelled,
}

impl HandleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Queued => "queued",
            Self::Rejected => "rejected",
            Self::Declined { .. } => "declined",
            Self::Replied { .. } => "replied",
            Self::NoReply => "no_reply",
            Self::Preempted { .. } => "preempted",
            Self::TimedOut => "timed_out",
            Self::Failed(_) => "failed",
            Self::ModeUpgraded => "mode_upgraded",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyRecord {
    pub time: DateTime<Utc>,
    pub trigger_message_id: String,
    pub trigger_sender_id: String,
    pub trigger_text: String,
    pub segments: Vec<String>,
    pub mentioned: bool,
}

enum Admission {
    Settled(HandleOutcome),
    Decide(Message),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Aborts the generation and planning tasks when the cycle is dropped, so an
/// aborted loop never leaves them running detached.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Releases a thinking session's placeholder and active slot on every exit
/// from the reply cycle, including when its future is dropped.
struct SessionRelease<'a> {
    inner: &'a OrchestratorInner,
    session: Arc<ThinkingSession>,
}

impl Drop for SessionRelease<'_> {
    fn drop(&mut self) {
        self.inner.placeholders.remove(&self.session.id);
        let mut active = lock(&self.inner.active_session);
        if active.as_ref().is_some_and(|s| s.id == self.session.id) {
            *active = None;
        }
        drop(active);
        self.inner.set_state(OrchestratorState::Idle);
    }
}

/// Reply coordinator for a single conversation.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ReplyOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    conversation_id: String,
    agent_id: String,
    config: ArcSwap<OrchestratorConfig>,
    willingness: Arc<WillingnessStore>,
    tracker: Arc<EngagementSegmentTracker>,
    history: Arc<dyn MessageHistory>,
    collaborators: Collaborators,
    scheduler: Mutex<PriorityScheduler>,
    queue_notify: Notify,
    /// Held for the whole generate/send cycle.
    generation_slot: tokio::sync::Mutex<()>,
    placeholders: PlaceholderRegistry,
    active_session: Mutex<Option<Arc<ThinkingSession>>>,
    state: AtomicU8,
    disabled: AtomicBool,
    stop_tx: watch::Sender<bool>,
    timeout_count: AtomicU32,
    recent_replies: Mutex<VecDeque<ReplyRecord>>,
    rate_tracker: Mutex<ReplyRateTracker>,
    rng: Mutex<StdRng>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplyOrchestrator {
    pub fn new(
        agent_id: &str,
        config: OrchestratorConfig,
        willingness: Arc<WillingnessStore>,
        tracker: Arc<EngagementSegmentTracker>,
        history: Arc<dyn MessageHistory>,
        collaborators: Collaborators,
    ) -> EngineResult<Self> {
        config.validate()?;
        let scheduler = PriorityScheduler::new(config.queue_capacity)?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (upgrade_window, _) = upgrade_reply_window(config.upgrade_threshold);
        let (stop_tx, _) = watch::channel(false);
        let conversation_id = tracker.conversation_id().to_string();

        info!(
            "[{}] reply orchestrator created (reply mode: {}, chat mode: {})",
            conversation_id, config.reply_mode, config.chat_mode
        );

        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                conversation_id,
                agent_id: agent_id.to_string(),
                config: ArcSwap::from_pointee(config),
                willingness,
                tracker,
                history,
                collaborators,
                scheduler: Mutex::new(scheduler),
                queue_notify: Notify::new(),
                generation_slot: tokio::sync::Mutex::new(()),
                placeholders: PlaceholderRegistry::new(),
                active_session: Mutex::new(None),
                state: AtomicU8::new(OrchestratorState::Idle as u8),
                disabled: AtomicBool::new(false),
                stop_tx,
                timeout_count: AtomicU32::new(0),
                recent_replies: Mutex::new(VecDeque::new()),
                rate_tracker: Mutex::new(ReplyRateTracker::new(upgrade_window)),
                rng: Mutex::new(rng),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    /// Primary entry point: records the message and decides whether to reply.
    pub async fn handle_message(&self, message: Message, mentioned: bool, interest: f64) -> HandleOutcome {
        let outcome = match self.inner.admit(message, interest) {
            Admission::Settled(outcome) => outcome,
            Admission::Decide(message) => self.inner.decide(message, mentioned, interest).await,
        };
        metrics::inc_decision(outcome.label());
        outcome
    }

    /// Records and tracks the message right away, in call order, and runs the
    /// reply decision on its own task so later messages are not held up by an
    /// in-flight generation.
    pub fn dispatch(&self, message: Message, mentioned: bool, interest: f64) -> JoinHandle<HandleOutcome> {
        match self.inner.admit(message, interest) {
            Admission::Settled(outcome) => {
                metrics::inc_decision(outcome.label());
                tokio::spawn(async move { outcome })
            }
            Admission::Decide(message) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let outcome = inner.decide(message, mentioned, interest).await;
                    metrics::inc_decision(outcome.label());
                    outcome
                })
            }
        }
    }

    /// Starts the background loops. Clears a previous stop.
    pub fn start(&self) {
        let inner = &self.inner;
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("[{}] cannot start outside a tokio runtime: {}", inner.conversation_id, e);
                return;
            }
        };

        inner.disabled.store(false, Ordering::SeqCst);
        inner.stop_tx.send_replace(false);
        inner.set_state(OrchestratorState::Idle);

        let mut tasks = lock(&inner.tasks);
        tasks.retain(|handle| !handle.is_finished());
        if !tasks.is_empty() {
            info!("[{}] orchestrator loops already running", inner.conversation_id);
            return;
        }

        let config = inner.config.load_full();
        tasks.push(runtime.spawn(inner.clone().maintenance_loop()));
        if config.reply_mode == ReplyMode::Priority {
            tasks.push(runtime.spawn(inner.clone().priority_loop()));
        }
        info!("[{}] orchestrator started in {} mode", inner.conversation_id, config.reply_mode);
    }

    /// Disables the orchestrator and cancels in-flight work. Returns without
    /// waiting; placeholders are released shortly after in the background.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.disabled.store(true, Ordering::SeqCst);
        inner.set_state(OrchestratorState::Disabled);
        inner.stop_tx.send_replace(true);

        if let Some(session) = lock(&inner.active_session).as_ref() {
            session.cancel();
        }
        inner.placeholders.cancel_all();
        for handle in lock(&inner.tasks).drain(..) {
            handle.abort();
        }

        let delay = inner.config.load().placeholder_cleanup_delay();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let target = inner.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !target.is_disabled() {
                        return;
                    }
                    let cleared = target.placeholders.clear();
                    if cleared > 0 {
                        info!("[{}] released {} leftover placeholders", target.conversation_id, cleared);
                    }
                });
            }
            Err(_) => {
                inner.placeholders.clear();
            }
        }
        info!("[{}] orchestrator stopped", inner.conversation_id);
    }

    /// Most recent replies, newest first.
    pub fn get_recent_replies(&self, limit: usize) -> Vec<ReplyRecord> {
        lock(&self.inner.recent_replies).iter().rev().take(limit).cloned().collect()
    }

    pub fn get_cache_status(&self) -> CacheStatus {
        self.inner.tracker.cache_status()
    }

    pub fn state(&self) -> OrchestratorState {
        OrchestratorState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.is_disabled()
    }

    pub fn open_placeholders(&self) -> usize {
        self.inner.placeholders.len()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.inner.scheduler).len()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.inner.timeout_count.load(Ordering::SeqCst)
    }

    pub fn amplifier(&self) -> f64 {
        self.inner.willingness.amplifier(&self.inner.conversation_id)
    }

    /// Recomputes the willingness amplifier from the recent reply rate.
    pub fn adjust_reply_frequency(&self) -> f64 {
        self.inner.adjust_reply_frequency()
    }

    pub fn get_config(&self) -> Arc<OrchestratorConfig> {
        self.inner.config.load_full()
    }

    pub fn update_config(&self, config: OrchestratorConfig) -> EngineResult<()> {
        config.validate()?;
        info!("[{}] orchestrator config updated", self.inner.conversation_id);
        self.inner.config.store(Arc::new(config));
        Ok(())
    }

    pub fn tracker(&self) -> &Arc<EngagementSegmentTracker> {
        &self.inner.tracker
    }
}

impl OrchestratorInner {
    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: OrchestratorState) {
        if state != OrchestratorState::Disabled && self.is_disabled() {
            return;
        }
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Resolves once `stop()` has been called.
    async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Synchronous part of message handling: history, engagement and, in
    /// priority mode, the queue.
    fn admit(&self, message: Message, interest: f64) -> Admission {
        if self.is_disabled() {
            return Admission::Settled(HandleOutcome::Ignored);
        }
        if message.conversation_id != self.conversation_id {
            warn!(
                "[{}] dropping message {} addressed to {}",
                self.conversation_id, message.id, message.conversation_id
            );
            return Admission::Settled(HandleOutcome::Ignored);
        }
        self.history.record(&message);
        if message.sender_id == self.agent_id {
            return Admission::Settled(HandleOutcome::Ignored);
        }
        self.track_engagement(&message);
        match self.config.load().reply_mode {
            ReplyMode::Priority => Admission::Settled(self.enqueue(message, interest)),
            ReplyMode::Interest => Admission::Decide(message),
        }
    }

    async fn decide(self: &Arc<Self>, message: Message, mentioned: bool, interest: f64) -> HandleOutcome {
        if self.is_disabled() {
            return HandleOutcome::Ignored;
        }
        let config = self.config.load_full();
        self.process_message(&config, message, mentioned, interest).await
    }

    fn track_engagement(&self, message: &Message) {
        let Some(handoff) = self.tracker.observe(message) else {
            return;
        };
        metrics::inc_handoff();
        match self.collaborators.relationship_builder.clone() {
            Some(builder) => {
                let conversation_id = self.conversation_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = builder.build_relationship(&handoff).await {
                        warn!(
                            "[{}] relationship building for {} failed: {}",
                            conversation_id, handoff.user_id, e
                        );
                    }
                });
            }
            None => debug!(
                "[{}] no relationship builder configured, dropping hand-off for {}",
                self.conversation_id, handoff.user_id
            ),
        }
    }

    fn enqueue(&self, message: Message, interest: f64) -> HandleOutcome {
        let message_id = message.id.clone();
        let outcome = lock(&self.scheduler).add(message, interest);
        match outcome {
            AddOutcome::Queued => {
                metrics::inc_queue();
                self.queue_notify.notify_one();
                HandleOutcome::Queued
            }
            AddOutcome::Evicted(dropped) => {
                metrics::inc_scheduler_drop("evicted");
                info!(
                    "[{}] queue full, {} replaced lower-priority message {}",
                    self.conversation_id, message_id, dropped.id
                );
                self.queue_notify.notify_one();
                HandleOutcome::Queued
            }
            AddOutcome::Rejected => {
                metrics::inc_scheduler_drop("rejected");
                debug!("[{}] queue full, rejected {}", self.conversation_id, message_id);
                HandleOutcome::Rejected
            }
        }
    }

    async fn process_message(
        self: &Arc<Self>,
        config: &OrchestratorConfig,
        message: Message,
        mentioned: bool,
        interest: f64,
    ) -> HandleOutcome {
        if config.chat_mode == ChatMode::Auto && self.should_request_upgrade(config) {
            match &self.collaborators.mode_controller {
                Some(controller) => match controller.request_upgrade(&self.conversation_id).await {
                    Ok(true) => {
                        info!("[{}] switched to the upgraded mode, skipping {}", self.conversation_id, message.id);
                        return HandleOutcome::ModeUpgraded;
                    }
                    Ok(false) => info!("[{}] mode upgrade refused (cooldown), continuing", self.conversation_id),
                    Err(e) => warn!("[{}] mode upgrade request failed: {}", self.conversation_id, e),
                },
                None => warn!("[{}] mode upgrade wanted but no controller is set", self.conversation_id),
            }
        }

        let _ = self.state.compare_exchange(
            OrchestratorState::Idle as u8,
            OrchestratorState::Deciding as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        self.willingness.setup(&message, interest, mentioned);
        let mut probability = self.willingness.get_reply_probability(&message.id).unwrap_or(0.0);
        if mentioned && config.mention_forces_reply {
            probability = 1.0;
        }
        let fatigue = self.fatigue_multiplier();
        probability *= fatigue;

        info!(
            "[{}] {}: {} [interest: {:.2}] [probability: {:.1}%]{}",
            self.conversation_id,
            message.sender_id,
            TextUtils::truncate_with_ellipsis(&message.text, 60),
            interest,
            probability * 100.0,
            if fatigue < 1.0 { format!(" [fatigue x{:.2}]", fatigue) } else { String::new() }
        );

        let draw: f64 = lock(&self.rng).gen();
        if draw >= probability {
            self.willingness.not_reply(&message.id);
            let _ = self.state.compare_exchange(
                OrchestratorState::Deciding as u8,
                OrchestratorState::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            return HandleOutcome::Declined { probability };
        }

        self.willingness.before_commit(&message.id);
        let message_id = message.id.clone();
        let outcome = self.reply_one_message(config, message, mentioned).await;
        match &outcome {
            HandleOutcome::Replied { .. } => self.willingness.after_commit(&message_id),
            HandleOutcome::Cancelled => self.willingness.release(&message_id),
            _ => self.willingness.not_reply(&message_id),
        }
        outcome
    }

    fn fatigue_multiplier(&self) -> f64 {
        let Some(controller) = &self.collaborators.mode_controller else {
            return 1.0;
        };
        match controller.cooldown_progress(&self.conversation_id) {
            Some(progress) if progress < 1.0 => 0.2 + 0.8 * progress.max(0.0),
            _ => 1.0,
        }
    }

    fn should_request_upgrade(&self, config: &OrchestratorConfig) -> bool {
        let open = self.placeholders.len();
        if open >= upgrade_placeholder_limit(config.upgrade_threshold) {
            debug!("[{}] {} placeholders pending, upgrade wanted", self.conversation_id, open);
            return true;
        }
        let (window, limit) = upgrade_reply_window(config.upgrade_threshold);
        let recent = lock(&self.rate_tracker).count_within(Instant::now(), window);
        if recent > limit {
            debug!(
                "[{}] {} replies within {:?} exceeds {}, upgrade wanted",
                self.conversation_id, recent, window, limit
            );
            return true;
        }
        false
    }

    /// Runs one generate/plan/send cycle under a placeholder.
    async fn reply_one_message(
        self: &Arc<Self>,
        config: &OrchestratorConfig,
        message: Message,
        mentioned: bool,
    ) -> HandleOutcome {
        let session = Arc::new(ThinkingSession::new(message));
        self.placeholders.register(session.clone());
        debug!("[{}] placeholder {} registered", self.conversation_id, session.id);
        let _release = SessionRelease { inner: self, session: session.clone() };

        let outcome = self.run_cycle(config, &session, mentioned).await;

        if let HandleOutcome::Cancelled = outcome {
            let reason = EngineError::CancelledOperation(format!("reply cycle {}", session.id));
            info!("[{}] {}", self.conversation_id, reason);
        }
        outcome
    }

    async fn run_cycle(
        self: &Arc<Self>,
        config: &OrchestratorConfig,
        session: &Arc<ThinkingSession>,
        mentioned: bool,
    ) -> HandleOutcome {
        let _slot = tokio::select! {
            guard = self.generation_slot.lock() => guard,
            _ = self.stopped() => {
                session.cancel();
                return HandleOutcome::Cancelled;
            }
        };
        if self.is_disabled() || session.is_cancelled() {
            return HandleOutcome::Cancelled;
        }
        *lock(&self.active_session) = Some(session.clone());
        self.set_state(OrchestratorState::Generating);

        let request = self.build_request(config, session);
        let backend = self.collaborators.backend.clone();
        let gen_request = request.clone();
        let mut gen_task = tokio::spawn(async move { backend.generate_reply(&gen_request).await });

        let planner = if config.enable_planner {
            self.collaborators.planner.clone()
        } else {
            None
        };
        let mut plan_task = tokio::spawn(async move {
            match planner {
                Some(planner) => planner.plan_and_execute(&request).await,
                None => Ok(PlannedAction::no_action()),
            }
        });
        let _abort = AbortOnDrop(vec![gen_task.abort_handle(), plan_task.abort_handle()]);

        let deadline = config.thinking_timeout();
        let joined = tokio::select! {
            result = tokio::time::timeout(deadline, join(&mut gen_task, &mut plan_task)) => result,
            _ = self.stopped() => {
                gen_task.abort();
                plan_task.abort();
                session.cancel();
                return HandleOutcome::Cancelled;
            }
        };

        let (gen_result, plan_result) = match joined {
            Ok(results) => results,
            Err(_) => {
                gen_task.abort();
                plan_task.abort();
                metrics::inc_generation_timeout();
                warn!(
                    "[{}] generation and planning exceeded {:?}, both cancelled",
                    self.conversation_id, deadline
                );
                self.note_transient_failure(config);
                return HandleOutcome::TimedOut;
            }
        };

        let text = match gen_result {
            Ok(Ok(text)) => {
                self.timeout_count.store(0, Ordering::SeqCst);
                text
            }
            Ok(Err(e)) => {
                let failure = EngineError::TransientGenerationFailure(e.to_string());
                error!("[{}] {}", self.conversation_id, failure);
                self.note_transient_failure(config);
                return HandleOutcome::Failed(failure.to_string());
            }
            Err(e) => {
                let failure = EngineError::TransientGenerationFailure(format!("generation task ended: {}", e));
                error!("[{}] {}", self.conversation_id, failure);
                self.note_transient_failure(config);
                return HandleOutcome::Failed(failure.to_string());
            }
        };

        let action = match plan_result {
            Ok(Ok(action)) => action,
            Ok(Err(e)) => {
                error!("[{}] action planning failed: {}", self.conversation_id, e);
                PlannedAction::no_action()
            }
            Err(e) => {
                error!("[{}] action planning task ended: {}", self.conversation_id, e);
                PlannedAction::no_action()
            }
        };
        if !action.is_no_action() {
            info!(
                "[{}] planner chose {} (parallel: {})",
                self.conversation_id, action.action_type, action.is_parallel
            );
        }

        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            info!("[{}] backend produced no reply content", self.conversation_id);
            return HandleOutcome::NoReply;
        };
        if config.enable_planner && action.preempts_reply() {
            info!(
                "[{}] non-parallel action {} replaces the text reply",
                self.conversation_id, action.action_type
            );
            return HandleOutcome::Preempted { action_type: action.action_type };
        }
        if self.is_disabled() || session.is_cancelled() {
            return HandleOutcome::Cancelled;
        }

        self.set_state(OrchestratorState::Sending);
        let segments = TextUtils::split_reply_segments(&text, config.max_segment_chars, config.max_segments);
        if segments.is_empty() {
            return HandleOutcome::NoReply;
        }
        if !self.placeholders.contains(&session.id) {
            warn!("[{}] placeholder {} already released, not sending", self.conversation_id, session.id);
            return HandleOutcome::Cancelled;
        }
        if let Err(e) = self.collaborators.sender.send_segments(&session.info(), &segments).await {
            warn!("[{}] sending reply failed: {}", self.conversation_id, e);
            return HandleOutcome::Failed(format!("send failed: {}", e));
        }

        self.record_reply(config, session, &segments, mentioned);
        metrics::inc_replies_sent();
        info!(
            "[{}] replied to {}: {}",
            self.conversation_id,
            TextUtils::truncate_with_ellipsis(&session.anchor_message.text, 30),
            TextUtils::truncate_with_ellipsis(&segments.join(" "), 30)
        );
        HandleOutcome::Replied { segments }
    }

    fn note_transient_failure(&self, config: &OrchestratorConfig) {
        let count = self.timeout_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count > config.timeout_warning_threshold {
            error!(
                "[{}] {} consecutive generation failures (deadline {}s); the generation backend is too slow or misconfigured",
                self.conversation_id, count, config.thinking_timeout_secs
            );
        }
    }

    fn build_request(&self, config: &OrchestratorConfig, session: &ThinkingSession) -> GenerationRequest {
        let trigger = session.anchor_message.clone();
        let context = self
            .history
            .messages_before(&self.conversation_id, trigger.timestamp, config.context_messages);
        let recent_replies = lock(&self.recent_replies)
            .iter()
            .rev()
            .take(5)
            .map(|r| r.segments.join(" "))
            .collect();
        GenerationRequest {
            conversation_id: self.conversation_id.clone(),
            thinking_id: session.id.clone(),
            trigger,
            context,
            recent_replies,
        }
    }

    fn record_reply(&self, config: &OrchestratorConfig, session: &ThinkingSession, segments: &[String], mentioned: bool) {
        let now = Utc::now();
        for (i, segment) in segments.iter().enumerate() {
            let outbound = Message::new(
                format!("{}-{}", session.id, i),
                self.conversation_id.clone(),
                self.agent_id.clone(),
                segment.clone(),
                now,
            );
            self.history.record(&outbound);
        }

        let trigger = &session.anchor_message;
        let mut recent = lock(&self.recent_replies);
        recent.push_back(ReplyRecord {
            time: now,
            trigger_message_id: trigger.id.clone(),
            trigger_sender_id: trigger.sender_id.clone(),
            trigger_text: trigger.text.clone(),
            segments: segments.to_vec(),
            mentioned,
        });
        while recent.len() > config.recent_reply_capacity {
            recent.pop_front();
        }
        drop(recent);

        lock(&self.rate_tracker).record(Instant::now());
    }

    fn adjust_reply_frequency(&self) -> f64 {
        let config = self.config.load();
        let current = self.willingness.amplifier(&self.conversation_id);
        let target_in_window = config.talk_frequency * (EVALUATION_WINDOW.as_secs_f64() / 60.0);
        if target_in_window <= 0.0 {
            return current;
        }

        let now = Instant::now();
        let (sent_10_min, sent_5_min) = {
            let mut tracker = lock(&self.rate_tracker);
            (
                tracker.count_within(now, EVALUATION_WINDOW),
                tracker.count_within(now, SUPPRESSION_WINDOW),
            )
        };
        let proposed = amplifier_for_rate(sent_10_min, target_in_window);
        if proposed > current && suppress_increase(sent_5_min, config.talk_frequency) {
            debug!(
                "[{}] amplifier increase held back: {} replies in the last 5 minutes",
                self.conversation_id, sent_5_min
            );
            return current;
        }
        let applied = self.willingness.set_amplifier(&self.conversation_id, proposed);
        debug!(
            "[{}] {} replies in 10 minutes (target {:.0}), amplifier {:.2}",
            self.conversation_id, sent_10_min, target_in_window, applied
        );
        applied
    }

    async fn priority_loop(self: Arc<Self>) {
        info!("[{}] priority loop started", self.conversation_id);
        loop {
            if self.is_disabled() {
                break;
            }
            let next = lock(&self.scheduler).pop_highest();
            match next {
                Some((message, interest)) => {
                    metrics::dec_queue();
                    info!(
                        "[{}] dequeued {} from {} (interest {:.2})",
                        self.conversation_id, message.id, message.sender_id, interest
                    );
                    let config = self.config.load_full();
                    let mentioned = message.mentions_agent;
                    let outcome = self.reply_one_message(&config, message, mentioned).await;
                    metrics::inc_decision(outcome.label());
                    debug!("[{}] queued message handled: {}", self.conversation_id, outcome.label());
                }
                None => {
                    let poll = self.config.load().priority_poll_interval();
                    tokio::select! {
                        _ = self.queue_notify.notified() => {}
                        _ = tokio::time::sleep(poll) => {}
                        _ = self.stopped() => break,
                    }
                }
            }
        }
        info!("[{}] priority loop exited", self.conversation_id);
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.load().throttle_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stopped() => break,
            }
            if self.is_disabled() {
                break;
            }
            self.adjust_reply_frequency();
            if let Some(stats) = self.tracker.sweep(Utc::now()) {
                debug!(
                    "[{}] engagement sweep: {} segments, {} users removed, {} history messages pruned",
                    self.conversation_id, stats.removed_segments, stats.removed_users, stats.pruned_messages
                );
            }
        }
        debug!("[{}] maintenance loop exited", self.conversation_id);
    }
}
