//! Priority scoring.
//!
//! A queued item's score is a weighted sum of its tier weight, cost
//! efficiency, operation base priority, retry boost, and a bonus that grows
//! linearly with wait time. Because every queued item gains the same bonus
//! per second, the relative order of two items never changes while they
//! wait, and the heap can be keyed on a time-invariant value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use spendguard_core::WorkItem;

/// Weights of the priority score terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    /// Multiplies the tier weight (1, 2, 3)
    pub tier: f64,

    /// Multiplies `1 / (1 + estimated_cost)`
    pub cost_efficiency: f64,

    /// Score gained per second of waiting
    pub wait_per_second: f64,

    /// Multiplies the operation base priority
    pub operation: f64,

    /// Added per retry
    pub retry_boost: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            tier: 10.0,
            cost_efficiency: 5.0,
            wait_per_second: 0.1,
            operation: 4.0,
            retry_boost: 2.0,
        }
    }
}

impl PriorityWeights {
    /// Score without the wait bonus.
    pub fn base_score(&self, item: &WorkItem) -> f64 {
        let cost = item.estimated_cost.max(0.0);
        self.tier * item.tier.weight()
            + self.cost_efficiency / (1.0 + cost)
            + self.operation * item.operation.base_priority()
            + self.retry_boost * f64::from(item.retry_count)
    }

    /// Score of a queued item at `now`.
    pub fn score_at(&self, item: &WorkItem, now: DateTime<Utc>) -> f64 {
        self.base_score(item) + self.wait_per_second.max(0.0) * item.waited(now).as_secs_f64()
    }

    /// Heap key: differences between keys equal differences between scores
    /// at any common instant.
    pub(crate) fn ordering_key(&self, item: &WorkItem, epoch: DateTime<Utc>) -> f64 {
        let offset = item.submitted_at.signed_duration_since(epoch);
        let offset_secs = offset.num_milliseconds() as f64 / 1000.0;
        self.base_score(item) - self.wait_per_second.max(0.0) * offset_secs
    }
}

/// Heap entry; the greatest entry is dispatched first.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub key: f64,
    pub submitted_at: DateTime<Utc>,
    pub seq: u64,
    pub id: Uuid,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;
    use spendguard_core::{OperationType, Tier};
    use std::collections::BinaryHeap;
    use std::time::Duration;

    fn item(tier: Tier, op: OperationType, cost: f64, submitted: DateTime<Utc>) -> WorkItem {
        WorkItem::new("alice", tier, op, cost, json!({}), submitted, Duration::from_secs(60))
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_higher_tier_and_cheaper_work_score_higher() {
        let w = PriorityWeights::default();
        let now = start();
        let free = item(Tier::Free, OperationType::ContentGeneration, 0.2, now);
        let premium = item(Tier::Premium, OperationType::ContentGeneration, 0.2, now);
        let pricey = item(Tier::Free, OperationType::ContentGeneration, 2.0, now);
        let analytics = item(Tier::Free, OperationType::Analytics, 0.2, now);

        assert!(w.score_at(&premium, now) > w.score_at(&free, now));
        assert!(w.score_at(&free, now) > w.score_at(&pricey, now));
        assert!(w.score_at(&free, now) > w.score_at(&analytics, now));
    }

    #[test]
    fn test_retry_boost() {
        let w = PriorityWeights::default();
        let mut retried = item(Tier::Free, OperationType::Analytics, 0.2, start());
        let base = w.base_score(&retried);
        retried.retry_count = 2;
        assert!((w.base_score(&retried) - base - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_heap_orders_by_key_then_submission() {
        let w = PriorityWeights::default();
        let epoch = start();
        let older = item(Tier::Free, OperationType::Analytics, 0.2, epoch);
        let newer = item(Tier::Free, OperationType::Analytics, 0.2, epoch + chrono::Duration::seconds(1));
        let premium = item(Tier::Premium, OperationType::Analytics, 0.2, epoch + chrono::Duration::seconds(2));

        let mut heap = BinaryHeap::new();
        for (seq, it) in [&newer, &premium, &older].into_iter().enumerate() {
            heap.push(QueueEntry {
                key: w.ordering_key(it, epoch),
                submitted_at: it.submitted_at,
                seq: seq as u64,
                id: it.id,
            });
        }

        assert_eq!(heap.pop().unwrap().id, premium.id);
        assert_eq!(heap.pop().unwrap().id, older.id);
        assert_eq!(heap.pop().unwrap().id, newer.id);
    }

    #[test]
    fn test_equal_keys_break_ties_by_insertion() {
        let t = start();
        let a = QueueEntry { key: 1.0, submitted_at: t, seq: 1, id: Uuid::new_v4() };
        let b = QueueEntry { key: 1.0, submitted_at: t, seq: 2, id: Uuid::new_v4() };
        assert!(a > b);
    }

    proptest! {
        #[test]
        fn prop_score_non_decreasing_with_wait(
            cost in 0.0f64..10.0,
            retries in 0u32..4,
            first in 0u64..10_000,
            extra in 0u64..10_000,
        ) {
            let w = PriorityWeights::default();
            let mut queued = item(Tier::Free, OperationType::ProfileAnalysis, cost, start());
            queued.retry_count = retries;

            let earlier = start() + chrono::Duration::seconds(first as i64);
            let later = earlier + chrono::Duration::seconds(extra as i64);
            prop_assert!(w.score_at(&queued, later) >= w.score_at(&queued, earlier));
        }
    }
}
