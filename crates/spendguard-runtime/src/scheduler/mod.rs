//! Tiered priority scheduler.
//!
//! Admitted work waits in one priority heap per tier. Dispatch pops the
//! highest-priority item of each tier while that tier has a free
//! concurrency slot, so a saturated low tier never blocks a higher one.
//! Items that wait past their `max_wait` are expired without executing and
//! their budget reservations are released.

mod priority;
mod results;

pub use priority::PriorityWeights;
pub use results::{CompletedWork, ResultsTable};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use spendguard_core::{
    Clock, GovernanceError, Tier, TierRegistry, WorkItem, WorkResult, WorkStatus,
};

use crate::budget::BudgetGovernor;
use crate::rate_limiter::RateLimiter;
use priority::QueueEntry;

/// Smoothing factor of the execution-time average used for ETAs.
const EWMA_ALPHA: f64 = 0.2;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum queued items across all tiers
    pub queue_capacity: usize,

    /// Wait allowance for submissions that don't specify one
    #[serde(with = "crate::config::duration_str")]
    pub default_max_wait: Duration,

    /// Re-queue ceiling for transient failures
    pub max_retries: u32,

    pub weights: PriorityWeights,

    /// Dispatch loop wake-up interval when nothing notifies it
    #[serde(with = "crate::config::duration_str")]
    pub dispatch_interval: Duration,

    /// Terminal items kept for status queries
    pub completed_capacity: u64,

    #[serde(with = "crate::config::duration_str")]
    pub completed_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            default_max_wait: Duration::from_secs(120),
            max_retries: 3,
            weights: PriorityWeights::default(),
            dispatch_interval: Duration::from_millis(250),
            completed_capacity: 10_000,
            completed_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Where a newly queued item landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub id: Uuid,

    /// 1-based position within the item's tier
    pub position: usize,
    pub eta_ms: Option<u64>,
    pub priority_score: f64,
}

/// A work item handed to an executor, holding its tier slot.
#[derive(Debug)]
pub struct Dispatch {
    pub item: WorkItem,
    _permit: OwnedSemaphorePermit,
}

/// How a dispatched item finished.
#[derive(Debug, Clone)]
pub enum Completion {
    Completed(WorkResult),
    Failed(GovernanceError),

    /// Transient failure; re-queue with a priority boost
    Retry,
}

/// Status of one work item.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub id: Uuid,
    pub status: WorkStatus,
    pub position: Option<usize>,
    pub eta_ms: Option<u64>,
    pub retry_count: u32,
    pub result: Option<WorkResult>,
    pub error: Option<GovernanceError>,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub queued: usize,
    pub processing: usize,
    pub queued_by_tier: BTreeMap<Tier, usize>,
    pub processing_by_tier: BTreeMap<Tier, usize>,
    pub enqueued: u64,
    pub completed: u64,

    /// Includes expired items
    pub failed: u64,
    pub expired: u64,
    pub retried: u64,
    pub rejected: u64,
    pub average_wait_ms: f64,
    pub average_execution_ms: Option<f64>,
}

#[derive(Debug)]
struct Tracked {
    item: WorkItem,
    seq: u64,
}

#[derive(Debug)]
struct TierSlots {
    semaphore: Arc<Semaphore>,
    size: usize,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    completed: u64,
    failed: u64,
    expired: u64,
    retried: u64,
    rejected: u64,
    dispatched: u64,
    total_wait_ms: f64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    items: HashMap<Uuid, Tracked>,
    queues: BTreeMap<Tier, BinaryHeap<QueueEntry>>,
    processing: BTreeMap<Tier, usize>,
    slots: HashMap<Tier, TierSlots>,
    next_seq: u64,
    counters: Counters,
    ewma_execution_ms: Option<f64>,
}

impl SchedulerState {
    fn queued_len(&self) -> usize {
        self.items
            .values()
            .filter(|t| t.item.status == WorkStatus::Queued)
            .count()
    }

    fn processing_for(&self, tier: Tier) -> usize {
        self.processing.get(&tier).copied().unwrap_or(0)
    }

    fn push(&mut self, item: WorkItem, weights: &PriorityWeights, epoch: DateTime<Utc>) -> QueueEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = QueueEntry {
            key: weights.ordering_key(&item, epoch),
            submitted_at: item.submitted_at,
            seq,
            id: item.id,
        };
        self.queues.entry(item.tier).or_default().push(entry.clone());
        self.items.insert(item.id, Tracked { item, seq });
        entry
    }

    /// Whether a heap entry still refers to a queued item.
    fn is_live(&self, entry: &QueueEntry) -> bool {
        self.items
            .get(&entry.id)
            .is_some_and(|t| t.seq == entry.seq && t.item.status == WorkStatus::Queued)
    }

    fn position_of(&self, tier: Tier, entry: &QueueEntry) -> usize {
        self.queues
            .get(&tier)
            .map(|heap| {
                heap.iter()
                    .filter(|other| *other > entry && self.is_live(other))
                    .count()
            })
            .unwrap_or(0)
            + 1
    }

    fn eta_ms(&self, position: usize, slots: usize) -> Option<u64> {
        let per_item = self.ewma_execution_ms?;
        let rounds = position.div_ceil(slots.max(1));
        Some((per_item * rounds as f64).round() as u64)
    }

    fn try_slot(&mut self, tier: Tier, limit: usize) -> Option<OwnedSemaphorePermit> {
        if self.processing_for(tier) >= limit {
            return None;
        }
        let slot = self.slots.entry(tier).or_insert_with(|| TierSlots {
            semaphore: Arc::new(Semaphore::new(limit)),
            size: limit,
        });
        if limit > slot.size {
            slot.semaphore.add_permits(limit - slot.size);
            slot.size = limit;
        }
        slot.semaphore.clone().try_acquire_owned().ok()
    }
}

/// Tiered priority queue with bounded per-tier concurrency.
pub struct PriorityScheduler {
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    epoch: DateTime<Utc>,
    tiers: Arc<TierRegistry>,
    rate_limiter: Arc<RateLimiter>,
    governor: Arc<BudgetGovernor>,
    state: Mutex<SchedulerState>,
    results: ResultsTable,
    notify: Notify,
}

impl PriorityScheduler {
    pub fn new(
        config: SchedulerConfig,
        tiers: Arc<TierRegistry>,
        rate_limiter: Arc<RateLimiter>,
        governor: Arc<BudgetGovernor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let results = ResultsTable::new(config.completed_capacity, config.completed_retention);
        Self {
            epoch: clock.now(),
            clock,
            config,
            tiers,
            rate_limiter,
            governor,
            state: Mutex::new(SchedulerState::default()),
            results,
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Wakes whenever new work is queued or a slot frees up.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Admit a work item into its tier queue.
    ///
    /// Gates, in order: queue capacity, rate limit, budget. A budget
    /// reservation is taken for admitted work.
    pub fn enqueue(&self, mut item: WorkItem) -> Result<EnqueueOutcome, GovernanceError> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if state.queued_len() >= self.config.queue_capacity {
            state.counters.rejected += 1;
            tracing::debug!(caller = %item.caller_id, capacity = self.config.queue_capacity, "Queue full");
            return Err(GovernanceError::QueueFull {
                capacity: self.config.queue_capacity,
            });
        }

        if let Err(err) = self.rate_limiter.try_acquire(&item.caller_id, item.operation) {
            state.counters.rejected += 1;
            return Err(err);
        }

        if let Err(err) = self
            .governor
            .admit(item.id, &item.caller_id, item.estimated_cost)
        {
            self.rate_limiter.refund(&item.caller_id, item.operation);
            state.counters.rejected += 1;
            return Err(err);
        }

        item.status = WorkStatus::Queued;
        item.priority_score = self.config.weights.score_at(&item, now);
        let id = item.id;
        let tier = item.tier;
        let priority_score = item.priority_score;

        let entry = state.push(item, &self.config.weights, self.epoch);
        state.counters.enqueued += 1;

        let position = state.position_of(tier, &entry);
        let slots = self.tiers.get_limits(tier).max_concurrency;
        let eta_ms = state.eta_ms(position, slots);
        drop(state);

        tracing::debug!(item = %id, tier = %tier, position, priority_score, "Work queued");
        self.notify.notify_one();

        Ok(EnqueueOutcome {
            id,
            position,
            eta_ms,
            priority_score,
        })
    }

    /// Pop every item that can start now, marking it processing.
    ///
    /// Expired items met on the way are finalized instead of dispatched.
    pub async fn next_dispatches(&self) -> Vec<Dispatch> {
        let now = self.clock.now();
        let mut dispatches = Vec::new();
        let mut expired = Vec::new();

        {
            let mut state = self.state.lock();
            let tiers: Vec<Tier> = state.queues.keys().copied().collect();

            for tier in tiers {
                let limit = self.tiers.get_limits(tier).max_concurrency;
                loop {
                    let Some(entry) = state.queues.get_mut(&tier).and_then(|heap| heap.pop()) else {
                        break;
                    };
                    if !state.is_live(&entry) {
                        continue;
                    }

                    let Some(tracked) = state.items.get(&entry.id) else {
                        continue;
                    };
                    if tracked.item.is_expired_at(now) {
                        if let Some(tracked) = state.items.remove(&entry.id) {
                            expired.push(self.expire_locked(&mut state, tracked.item, now));
                        }
                        continue;
                    }

                    let Some(permit) = state.try_slot(tier, limit) else {
                        // No slot: put it back and move to the next tier.
                        if let Some(heap) = state.queues.get_mut(&tier) {
                            heap.push(entry);
                        }
                        break;
                    };

                    let Some(tracked) = state.items.get_mut(&entry.id) else {
                        continue;
                    };
                    let waited = tracked.item.waited(now);
                    tracked.item.status = WorkStatus::Processing;
                    tracked.item.priority_score = self.config.weights.score_at(&tracked.item, now);
                    let item = tracked.item.clone();

                    *state.processing.entry(tier).or_insert(0) += 1;
                    state.counters.dispatched += 1;
                    state.counters.total_wait_ms += waited.as_secs_f64() * 1000.0;

                    tracing::debug!(item = %item.id, tier = %tier, waited_ms = waited.as_millis() as u64, "Work dispatched");
                    dispatches.push(Dispatch {
                        item,
                        _permit: permit,
                    });
                }
            }
        }

        for work in expired {
            self.results.insert(work).await;
        }
        dispatches
    }

    /// Expire every queued item past its wait allowance.
    pub async fn expire_stale(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<CompletedWork> = {
            let mut state = self.state.lock();
            let stale: Vec<Uuid> = state
                .items
                .values()
                .filter(|t| t.item.status == WorkStatus::Queued && t.item.is_expired_at(now))
                .map(|t| t.item.id)
                .collect();

            let mut expired = Vec::with_capacity(stale.len());
            for id in stale {
                if let Some(tracked) = state.items.remove(&id) {
                    expired.push(self.expire_locked(&mut state, tracked.item, now));
                }
            }
            expired
        };

        let count = expired.len();
        for work in expired {
            self.results.insert(work).await;
        }
        count
    }

    fn expire_locked(
        &self,
        state: &mut SchedulerState,
        mut item: WorkItem,
        now: DateTime<Utc>,
    ) -> CompletedWork {
        let waited = item.waited(now);
        item.status = WorkStatus::Expired;
        state.counters.expired += 1;
        state.counters.failed += 1;
        self.governor.release(item.id);

        tracing::info!(
            item = %item.id,
            caller = %item.caller_id,
            tier = %item.tier,
            waited_ms = waited.as_millis() as u64,
            "Queued work expired"
        );

        CompletedWork {
            item,
            result: None,
            error: Some(GovernanceError::QueueTimeout { waited }),
            finished_at: now,
        }
    }

    /// Report how a dispatched item finished and free its slot.
    pub async fn complete(&self, dispatch: Dispatch, outcome: Completion, elapsed: Duration) {
        let now = self.clock.now();
        let id = dispatch.item.id;
        let tier = dispatch.item.tier;

        let finished = {
            let mut state = self.state.lock();
            if let Some(count) = state.processing.get_mut(&tier) {
                *count = count.saturating_sub(1);
            }

            let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
            state.ewma_execution_ms = Some(match state.ewma_execution_ms {
                Some(avg) => avg + EWMA_ALPHA * (elapsed_ms - avg),
                None => elapsed_ms,
            });

            let Some(tracked) = state.items.remove(&id) else {
                drop(state);
                self.notify.notify_one();
                return;
            };
            let mut item = tracked.item;

            match outcome {
                Completion::Retry => {
                    item.retry_count += 1;
                    item.status = WorkStatus::Queued;
                    item.priority_score = self.config.weights.score_at(&item, now);
                    state.counters.retried += 1;
                    tracing::info!(item = %id, retry = item.retry_count, "Work re-queued after transient failure");
                    state.push(item, &self.config.weights, self.epoch);
                    None
                }
                Completion::Completed(result) => {
                    item.status = WorkStatus::Completed;
                    state.counters.completed += 1;
                    Some(CompletedWork {
                        item,
                        result: Some(result),
                        error: None,
                        finished_at: now,
                    })
                }
                Completion::Failed(error) => {
                    item.status = WorkStatus::Failed;
                    state.counters.failed += 1;
                    tracing::warn!(item = %id, error = %error, "Work failed");
                    Some(CompletedWork {
                        item,
                        result: None,
                        error: Some(error),
                        finished_at: now,
                    })
                }
            }
        };

        // Free the tier slot before waking the dispatcher.
        drop(dispatch);
        if let Some(work) = finished {
            self.results.insert(work).await;
        }
        self.notify.notify_one();
    }

    /// Fail every queued item, releasing reservations. Used on shutdown.
    pub async fn cancel_all(&self, reason: &str) -> usize {
        let now = self.clock.now();
        let cancelled: Vec<CompletedWork> = {
            let mut state = self.state.lock();
            let queued: Vec<Uuid> = state
                .items
                .values()
                .filter(|t| t.item.status == WorkStatus::Queued)
                .map(|t| t.item.id)
                .collect();

            let mut cancelled = Vec::with_capacity(queued.len());
            for id in queued {
                if let Some(tracked) = state.items.remove(&id) {
                    let mut item = tracked.item;
                    item.status = WorkStatus::Failed;
                    state.counters.failed += 1;
                    self.governor.release(id);
                    cancelled.push(CompletedWork {
                        item,
                        result: None,
                        error: Some(GovernanceError::Unknown(reason.to_string())),
                        finished_at: now,
                    });
                }
            }
            state.queues.clear();
            cancelled
        };

        let count = cancelled.len();
        for work in cancelled {
            self.results.insert(work).await;
        }
        if count > 0 {
            tracing::info!(count, reason, "Cancelled queued work");
        }
        count
    }

    /// Status of a queued, processing or recently finished item.
    pub async fn status(&self, id: Uuid) -> Option<StatusView> {
        let live = {
            let state = self.state.lock();
            state.items.get(&id).map(|tracked| {
                let item = &tracked.item;
                let (position, eta_ms) = if item.status == WorkStatus::Queued {
                    let entry = QueueEntry {
                        key: self.config.weights.ordering_key(item, self.epoch),
                        submitted_at: item.submitted_at,
                        seq: tracked.seq,
                        id,
                    };
                    let position = state.position_of(item.tier, &entry);
                    let slots = self.tiers.get_limits(item.tier).max_concurrency;
                    (Some(position), state.eta_ms(position, slots))
                } else {
                    (None, None)
                };
                StatusView {
                    id,
                    status: item.status,
                    position,
                    eta_ms,
                    retry_count: item.retry_count,
                    result: None,
                    error: None,
                }
            })
        };
        if live.is_some() {
            return live;
        }

        self.results.get(&id).await.map(|work| StatusView {
            id,
            status: work.item.status,
            position: None,
            eta_ms: None,
            retry_count: work.item.retry_count,
            result: work.result,
            error: work.error,
        })
    }

    pub fn processing_count(&self, tier: Tier) -> usize {
        self.state.lock().processing_for(tier)
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queued_len()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut queued_by_tier = BTreeMap::new();
        for tracked in state.items.values() {
            if tracked.item.status == WorkStatus::Queued {
                *queued_by_tier.entry(tracked.item.tier).or_insert(0) += 1;
            }
        }
        let processing_by_tier: BTreeMap<Tier, usize> = state
            .processing
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(t, n)| (*t, *n))
            .collect();

        let c = &state.counters;
        QueueStats {
            capacity: self.config.queue_capacity,
            queued: queued_by_tier.values().sum(),
            processing: processing_by_tier.values().sum(),
            queued_by_tier,
            processing_by_tier,
            enqueued: c.enqueued,
            completed: c.completed,
            failed: c.failed,
            expired: c.expired,
            retried: c.retried,
            rejected: c.rejected,
            average_wait_ms: if c.dispatched == 0 {
                0.0
            } else {
                c.total_wait_ms / c.dispatched as f64
            },
            average_execution_ms: state.ewma_execution_ms,
        }
    }

    /// Count a submission rejected before it reached the queue.
    pub fn record_rejection(&self) {
        self.state.lock().counters.rejected += 1;
    }
}
