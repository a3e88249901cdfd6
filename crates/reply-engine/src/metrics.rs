
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use lazy_static::lazy_static;
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static DECISIONS: OnceLock<IntCounterVec> = OnceLock::new();
static REPLIES_SENT: OnceLock<IntCounter> = OnceLock::new();
static GENERATION_TIMEOUTS: OnceLock<IntCounter> = OnceLock::new();
static HANDOFFS: OnceLock<IntCounter> = OnceLock::new();
static SCHEDULER_DROPS: OnceLock<IntCounterVec> = OnceLock::new();
static OPEN_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();

/// Registers every engine metric. Safe to call more than once.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if DECISIONS.get().is_some() {
        return Ok(());
    }

    let decisions = IntCounterVec::new(
        prometheus::opts!("reply_decisions_total", "Reply decisions per outcome"),
        &["outcome"],
    )?;
    let replies_sent = IntCounter::new("replies_sent_total", "Reply cycles that sent at least one segment")?;
    let timeouts = IntCounter::new("generation_timeouts_total", "Generation cycles abandoned at the deadline")?;
    let handoffs = IntCounter::new("engagement_handoffs_total", "Users handed to the relationship builder")?;
    let drops = IntCounterVec::new(
        prometheus::opts!("scheduler_drops_total", "Messages dropped by the priority scheduler"),
        &["kind"],
    )?;
    let open_sessions = IntGauge::new("open_thinking_sessions", "Placeholders currently registered")?;
    let queue_depth = IntGauge::new("scheduler_queue_depth", "Messages waiting in priority schedulers")?;

    REGISTRY.register(Box::new(decisions.clone())).ok();
    REGISTRY.register(Box::new(replies_sent.clone())).ok();
    REGISTRY.register(Box::new(timeouts.clone())).ok();
    REGISTRY.register(Box::new(handoffs.clone())).ok();
    REGISTRY.register(Box::new(drops.clone())).ok();
    REGISTRY.register(Box::new(open_sessions.clone())).ok();
    REGISTRY.register(Box::new(queue_depth.clone())).ok();

    let _ = DECISIONS.set(decisions);
    let _ = REPLIES_SENT.set(replies_sent);
    let _ = GENERATION_TIMEOUTS.set(timeouts);
    let _ = HANDOFFS.set(handoffs);
    let _ = SCHEDULER_DROPS.set(drops);
    let _ = OPEN_SESSIONS.set(open_sessions);
    let _ = QUEUE_DEPTH.set(queue_depth);
    Ok(())
}

pub fn inc_decision(outcome: &str) {
    if let Some(counter) = DECISIONS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_replies_sent() {
    if let Some(counter) = REPLIES_SENT.get() {
        counter.inc();
    }
}

pub fn inc_generation_timeout() {
    if let Some(counter) = GENERATION_TIMEOUTS.get() {
        counter.inc();
    }
}

pub fn inc_handoff() {
    if let Some(counter) = HANDOFFS.get() {
        counter.inc();
    }
}

pub fn inc_scheduler_drop(kind: &str) {
    if let Some(counter) = SCHEDULER_DROPS.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn inc_open_sessions() {
    if let Some(gauge) = OPEN_SESSIONS.get() {
        gauge.inc();
    }
}

pub fn dec_open_sessions() {
    if let Some(gauge) = OPEN_SESSIONS.get() {
        gauge.dec();
    }
}

pub fn inc_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.inc();
    }
}

pub fn dec_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.dec();
    }
}

/// Prometheus text exposition of everything registered so far.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
