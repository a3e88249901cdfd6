use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::memory::Message;

pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: Message,
    interest: f64,
    sequence: u64,
}

impl QueuedMessage {
    fn outranks(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    /// Higher interest first, then earlier timestamp, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.interest
            .total_cmp(&other.interest)
            .then_with(|| other.message.timestamp.cmp(&self.message.timestamp))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Result of offering a message to a full or non-full scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Queued,
    /// Queued after dropping the lowest-priority entry, returned here.
    Evicted(Message),
    /// The queue was full and everything in it outranks the new message.
    Rejected,
}

/// Interest-ordered buffer with a single consumer.
///
/// VIP messages wait in their own unbounded lane and are always served first;
/// the capacity bound, eviction and rejection apply to the normal lane only.
#[derive(Debug)]
pub struct PriorityScheduler {
    vip: BinaryHeap<QueuedMessage>,
    heap: BinaryHeap<QueuedMessage>,
    capacity: usize,
    next_sequence: u64,
}

impl PriorityScheduler {
    pub fn new(capacity: usize) -> EngineResult<Self> {
        if capacity == 0 {
            return Err(EngineError::config("priority queue capacity must be at least 1"));
        }
        Ok(Self {
            vip: BinaryHeap::new(),
            heap: BinaryHeap::with_capacity(capacity + 1),
            capacity,
            next_sequence: 0,
        })
    }

    pub fn add(&mut self, message: Message, interest: f64) -> AddOutcome {
        let interest = if interest.is_finite() { interest } else { 0.0 };
        let entry = QueuedMessage {
            message,
            interest,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        if entry.message.is_vip {
            self.vip.push(entry);
            debug!("VIP lane now holds {} messages", self.vip.len());
            return AddOutcome::Queued;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(entry);
            return AddOutcome::Queued;
        }

        let Some(lowest) = self.heap.iter().min().cloned() else {
            self.heap.push(entry);
            return AddOutcome::Queued;
        };
        if !entry.outranks(&lowest) {
            debug!(
                "[{}] scheduler full, rejected {} (interest {:.2})",
                entry.message.conversation_id, entry.message.id, entry.interest
            );
            return AddOutcome::Rejected;
        }

        let evicted_sequence = lowest.sequence;
        self.heap.retain(|queued| queued.sequence != evicted_sequence);
        self.heap.push(entry);
        debug!(
            "[{}] scheduler full, evicted {} (interest {:.2})",
            lowest.message.conversation_id, lowest.message.id, lowest.interest
        );
        AddOutcome::Evicted(lowest.message)
    }

    pub fn is_empty(&self) -> bool {
        self.vip.is_empty() && self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vip.len() + self.heap.len()
    }

    pub fn vip_len(&self) -> usize {
        self.vip.len()
    }

    pub fn normal_len(&self) -> usize {
        self.heap.len()
    }

    pub fn queue_status(&self) -> String {
        format!("VIP lane: {}, normal queue: {}/{}", self.vip.len(), self.heap.len(), self.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes and returns the highest-interest message with its interest,
    /// draining the VIP lane before the normal queue.
    pub fn pop_highest(&mut self) -> Option<(Message, f64)> {
        self.vip
            .pop()
            .or_else(|| self.heap.pop())
            .map(|queued| (queued.message, queued.interest))
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.len();
        self.vip.clear();
        self.heap.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, secs: i64) -> Message {
        Message::new(id, "conv", "user", "text", at(secs))
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(PriorityScheduler::new(0), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_pop_highest_interest() {
        let mut scheduler = PriorityScheduler::new(5).unwrap();
        scheduler.add(msg("low", 0), 0.1);
        scheduler.add(msg("high", 1), 0.9);
        scheduler.add(msg("mid", 2), 0.5);

        assert_eq!(scheduler.pop_highest().unwrap().0.id, "high");
        assert_eq!(scheduler.pop_highest().unwrap().0.id, "mid");
        assert_eq!(scheduler.pop_highest().unwrap().0.id, "low");
        assert!(scheduler.pop_highest().is_none());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_ties_prefer_earlier_timestamp() {
        let mut scheduler = PriorityScheduler::new(5).unwrap();
        scheduler.add(msg("later", 10), 0.5);
        scheduler.add(msg("earlier", 5), 0.5);
        assert_eq!(scheduler.pop_highest().unwrap().0.id, "earlier");
    }

    #[test]
    fn test_full_queue_evicts_lowest() {
        let mut scheduler = PriorityScheduler::new(2).unwrap();
        scheduler.add(msg("a", 0), 0.2);
        scheduler.add(msg("b", 1), 0.4);

        let outcome = scheduler.add(msg("c", 2), 0.8);
        assert_eq!(outcome, AddOutcome::Evicted(msg("a", 0)));
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.pop_highest().unwrap().0.id, "c");
        assert_eq!(scheduler.pop_highest().unwrap().0.id, "b");
    }

    #[test]
    fn test_full_queue_rejects_lower() {
        let mut scheduler = PriorityScheduler::new(2).unwrap();
        scheduler.add(msg("a", 0), 0.5);
        scheduler.add(msg("b", 1), 0.6);

        assert_eq!(scheduler.add(msg("c", 2), 0.3), AddOutcome::Rejected);
        // Equal interest but later timestamp ranks lower.
        assert_eq!(scheduler.add(msg("d", 3), 0.5), AddOutcome::Rejected);
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn test_vip_lane_served_first_and_never_evicted() {
        let mut scheduler = PriorityScheduler::new(2).unwrap();
        scheduler.add(msg("a", 0), 0.9);
        scheduler.add(msg("b", 1), 0.8);
        for i in 0..4 {
            let vip = msg(&format!("vip{}", i), 10 + i).with_vip(true);
            assert_eq!(scheduler.add(vip, 0.1 * i as f64), AddOutcome::Queued);
        }
        assert_eq!(scheduler.len(), 6);
        assert_eq!(scheduler.vip_len(), 4);
        assert_eq!(scheduler.normal_len(), 2);
        assert_eq!(scheduler.queue_status(), "VIP lane: 4, normal queue: 2/2");

        // The normal lane stays bounded while the VIP lane grows.
        assert_eq!(scheduler.add(msg("c", 2), 0.1), AddOutcome::Rejected);

        let order: Vec<String> = std::iter::from_fn(|| scheduler.pop_highest().map(|(m, _)| m.id)).collect();
        assert_eq!(order, vec!["vip3", "vip2", "vip1", "vip0", "a", "b"]);
        assert!(scheduler.is_empty());
    }

    proptest! {
        #[test]
        fn prop_capacity_and_order(
            capacity in 1usize..8,
            items in prop::collection::vec((0.0f64..1.0, 0i64..1000), 0..40),
        ) {
            let mut scheduler = PriorityScheduler::new(capacity).unwrap();
            for (i, (interest, secs)) in items.iter().enumerate() {
                scheduler.add(msg(&i.to_string(), *secs), *interest);
                prop_assert!(scheduler.len() <= capacity);
            }

            let mut previous: Option<(f64, DateTime<Utc>)> = None;
            while let Some((message, interest)) = scheduler.pop_highest() {
                if let Some((prev_interest, prev_time)) = previous {
                    prop_assert!(interest <= prev_interest);
                    if interest == prev_interest {
                        prop_assert!(message.timestamp >= prev_time);
                    }
                }
                previous = Some((interest, message.timestamp));
            }
        }
    }
}
