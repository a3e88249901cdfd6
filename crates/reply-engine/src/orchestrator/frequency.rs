//! Reply-rate bookkeeping behind adaptive throttling and mode upgrades

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const EVALUATION_WINDOW: Duration = Duration::from_secs(600);
pub const SUPPRESSION_WINDOW: Duration = Duration::from_secs(300);

const MAX_AMPLIFIER: f64 = 5.0;
const BASE_AMPLIFIER: f64 = 1.0;
const MIN_AMPLIFIER: f64 = 0.2;

/// Accepted range for the mode upgrade threshold.
pub const MIN_UPGRADE_THRESHOLD: f64 = 0.01;
pub const MAX_UPGRADE_THRESHOLD: f64 = 100.0;

/// Send times of recent replies, pruned past the retention window.
#[derive(Debug)]
pub struct ReplyRateTracker {
    sent: VecDeque<Instant>,
    retention: Duration,
}

impl ReplyRateTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            sent: VecDeque::new(),
            retention: retention.max(EVALUATION_WINDOW),
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.sent.push_back(at);
        self.prune(at);
    }

    pub fn count_within(&mut self, now: Instant, window: Duration) -> usize {
        self.prune(now);
        self.sent
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.sent.front() {
            if now.saturating_duration_since(*front) >= self.retention {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Amplifier for `replies` sent in the evaluation window against a target of
/// `target` replies in the same window.
///
/// Linear from 5.0 at zero replies to 1.0 at the target, then down to 0.2 at
/// twice the target, pinned at 0.2 beyond.
pub fn amplifier_for_rate(replies: usize, target: f64) -> f64 {
    if target <= 0.0 {
        return BASE_AMPLIFIER;
    }
    let replies = replies as f64;
    let amplifier = if replies <= target {
        MAX_AMPLIFIER + replies * (BASE_AMPLIFIER - MAX_AMPLIFIER) / target
    } else if replies <= target * 2.0 {
        BASE_AMPLIFIER + (replies - target) * (MIN_AMPLIFIER - BASE_AMPLIFIER) / target
    } else {
        MIN_AMPLIFIER
    };
    amplifier.clamp(MIN_AMPLIFIER, MAX_AMPLIFIER)
}

/// Whether an increase of the amplifier should be held back: more than half
/// the per-minute target was already sent in the suppression window.
pub fn suppress_increase(replies_in_suppression_window: usize, talk_frequency: f64) -> bool {
    let threshold = (talk_frequency / 2.0) * (SUPPRESSION_WINDOW.as_secs_f64() / 60.0);
    replies_in_suppression_window as f64 > threshold
}

/// Window and reply count above which a mode upgrade is requested.
pub fn upgrade_reply_window(upgrade_threshold: f64) -> (Duration, usize) {
    let upgrade_threshold = if upgrade_threshold.is_nan() {
        1.0
    } else {
        upgrade_threshold.clamp(MIN_UPGRADE_THRESHOLD, MAX_UPGRADE_THRESHOLD)
    };
    let window = Duration::from_secs_f64(120.0 / upgrade_threshold);
    let limit = (6.0 * upgrade_threshold).floor() as usize;
    (window, limit)
}

pub fn upgrade_placeholder_limit(upgrade_threshold: f64) -> usize {
    (4.0 * upgrade_threshold).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_amplifier_curve() {
        assert!(approx(amplifier_for_rate(0, 10.0), 5.0));
        assert!(approx(amplifier_for_rate(5, 10.0), 3.0));
        assert!(approx(amplifier_for_rate(10, 10.0), 1.0));
        assert!(approx(amplifier_for_rate(15, 10.0), 0.6));
        assert!(approx(amplifier_for_rate(20, 10.0), 0.2));
        assert!(approx(amplifier_for_rate(50, 10.0), 0.2));
        assert!(approx(amplifier_for_rate(3, 0.0), 1.0));
    }

    #[test]
    fn test_suppression_threshold() {
        // Half of one reply per minute over five minutes is 2.5.
        assert!(!suppress_increase(2, 1.0));
        assert!(suppress_increase(3, 1.0));
    }

    #[test]
    fn test_upgrade_limits() {
        let (window, limit) = upgrade_reply_window(1.0);
        assert_eq!(window, Duration::from_secs(120));
        assert_eq!(limit, 6);
        assert_eq!(upgrade_placeholder_limit(1.0), 4);
        assert_eq!(upgrade_placeholder_limit(0.5), 2);

        // Out-of-range thresholds are clamped rather than overflowing the window.
        let (window, _) = upgrade_reply_window(1e-310);
        assert_eq!(window, Duration::from_secs(12_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_windows() {
        let mut tracker = ReplyRateTracker::new(EVALUATION_WINDOW);
        let start = Instant::now();
        tracker.record(start);
        tokio::time::advance(Duration::from_secs(400)).await;
        tracker.record(Instant::now());

        let now = Instant::now();
        assert_eq!(tracker.count_within(now, EVALUATION_WINDOW), 2);
        assert_eq!(tracker.count_within(now, SUPPRESSION_WINDOW), 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(tracker.count_within(Instant::now(), EVALUATION_WINDOW), 1);
    }
}
