//! Fallback orchestrator.
//!
//! Executes one dispatched work item:
//! - Rejects work the current degradation level no longer serves
//! - Serves cache or emergency content when the level is cache-only
//! - Skips the primary call while its circuit is open
//! - Runs the primary call under a timeout, settling cost and caching the
//!   result on success
//! - Falls through the fallback chain on failure, or asks the scheduler to
//!   retry when the failure is transient

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use spendguard_core::{
    Clock, GovernanceError, ResponseQuality, ResultSource, WorkItem, WorkResult,
};

use crate::budget::BudgetGovernor;
use crate::cache::{Fingerprint, ResponseCache};
use crate::executor::{ExecutionError, ExecutionRequest, ExecutorRegistry};
use crate::resilience::{
    CircuitBreaker, DegradationController, EmergencyContent, FallbackChain, FallbackStrategy,
    HealthWindow,
};

/// Primary execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on one primary call
    #[serde(with = "crate::config::duration_str")]
    pub call_timeout: Duration,

    /// Cache successful primary results
    pub cache_results: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            cache_results: true,
        }
    }
}

/// What the scheduler should do with a dispatched item.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed(WorkResult),

    /// Transient primary failure; the reservation is still held
    Retry,
    Failed(GovernanceError),
}

/// Orchestrator counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackStats {
    pub primary_successes: u64,
    pub primary_failures: u64,
    pub cache_hits: u64,
    pub emergency_served: u64,
    pub fallbacks_used: u64,
    pub retries_requested: u64,

    /// Calls skipped because a circuit was open
    pub short_circuits: u64,
    pub degraded_rejections: u64,

    /// Estimated spend avoided by serving fallbacks (USD)
    pub cost_savings: f64,
}

/// Why the fallback chain was entered.
#[derive(Debug, Clone)]
enum FallbackCause {
    CacheOnly,
    CircuitOpen(GovernanceError),
    PrimaryFailed(ExecutionError),
}

impl FallbackCause {
    fn into_error(self) -> GovernanceError {
        match self {
            FallbackCause::CacheOnly => GovernanceError::ServiceDegraded {
                level: spendguard_core::DegradationLevel::Emergency,
                detail: "no cached or emergency content available".to_string(),
            },
            FallbackCause::CircuitOpen(err) => err,
            FallbackCause::PrimaryFailed(err) => GovernanceError::GenerationFailure(err.to_string()),
        }
    }
}

/// Runs work items against the primary path with graceful fallback.
pub struct FallbackOrchestrator {
    clock: Arc<dyn Clock>,
    config: ExecutionConfig,
    executors: ExecutorRegistry,
    governor: Arc<BudgetGovernor>,
    cache: Arc<ResponseCache>,
    breaker: Arc<CircuitBreaker>,
    degradation: Arc<DegradationController>,
    health: Arc<HealthWindow>,
    chain: FallbackChain,
    emergency: EmergencyContent,
    stats: Mutex<FallbackStats>,
}

impl FallbackOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutionConfig,
        executors: ExecutorRegistry,
        governor: Arc<BudgetGovernor>,
        cache: Arc<ResponseCache>,
        breaker: Arc<CircuitBreaker>,
        degradation: Arc<DegradationController>,
        health: Arc<HealthWindow>,
        chain: FallbackChain,
        emergency: EmergencyContent,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clock,
            config,
            executors,
            governor,
            cache,
            breaker,
            degradation,
            health,
            chain,
            emergency,
            stats: Mutex::new(FallbackStats::default()),
        }
    }

    pub fn stats(&self) -> FallbackStats {
        self.stats.lock().clone()
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// Execute one work item. `allow_retry` is false once the item has used
    /// its retries.
    pub async fn execute(&self, item: &WorkItem, allow_retry: bool) -> ExecutionOutcome {
        // 1. Level no longer serves this tier or operation
        if let Err(err) = self.degradation.admits(item.tier, item.operation) {
            self.stats.lock().degraded_rejections += 1;
            self.governor.release(item.id);
            tracing::info!(item = %item.id, error = %err, "Dispatched work rejected by degradation level");
            return ExecutionOutcome::Failed(err);
        }

        // 2. Cache-only level
        let policy = self.degradation.current_policy();
        if policy.cache_only {
            return self.fall_back(item, FallbackCause::CacheOnly);
        }

        let executor = match self.executors.get(item.operation) {
            Ok(executor) => executor,
            Err(err) => {
                tracing::error!(item = %item.id, error = %err, "No executor for operation");
                return self.fall_back(item, FallbackCause::PrimaryFailed(err));
            }
        };
        let service = executor.service_name().to_string();

        // 3. Open circuit
        if let Err(err) = self.breaker.check(&service) {
            self.stats.lock().short_circuits += 1;
            tracing::debug!(item = %item.id, service = %service, "Circuit open, skipping primary");
            return self.fall_back(item, FallbackCause::CircuitOpen(err));
        }

        // 4. Primary
        let request = ExecutionRequest {
            caller_id: item.caller_id.clone(),
            operation: item.operation,
            payload: item.payload.clone(),
            quality: policy.quality,
        };

        let started = Instant::now();
        let call = AssertUnwindSafe(executor.execute(&request)).catch_unwind();
        let result = match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExecutionError::Upstream("executor panicked".to_string())),
            Err(_) => Err(ExecutionError::Timeout(self.config.call_timeout)),
        };
        let latency = started.elapsed();

        match result {
            Ok(output) => {
                self.breaker.record_success(&service);
                self.health.record(true, latency);

                let cost_charged = match self.governor.settle(
                    item.id,
                    &item.caller_id,
                    item.operation,
                    output.actual_cost,
                    output.units,
                ) {
                    Ok(record) => record.amount,
                    Err(err) => {
                        tracing::error!(item = %item.id, error = %err, "Failed to record spend");
                        self.governor.release(item.id);
                        0.0
                    }
                };

                if self.config.cache_results {
                    self.cache.put(
                        Fingerprint::of(&item.caller_id, item.operation, &item.payload),
                        &item.caller_id,
                        item.operation,
                        output.content.clone(),
                        cost_charged,
                        None,
                    );
                }

                self.stats.lock().primary_successes += 1;
                tracing::debug!(
                    item = %item.id,
                    service = %service,
                    cost = cost_charged,
                    latency_ms = latency.as_millis() as u64,
                    "Primary execution succeeded"
                );

                ExecutionOutcome::Completed(WorkResult {
                    content: output.content,
                    source: ResultSource::Primary,
                    quality: policy.quality,
                    cost_charged,
                    completed_at: self.clock.now(),
                })
            }
            Err(err) => {
                self.breaker.record_failure(&service);
                self.health.record(false, latency);
                self.stats.lock().primary_failures += 1;
                tracing::warn!(item = %item.id, service = %service, error = %err, "Primary execution failed");

                if err.is_transient() && allow_retry {
                    self.stats.lock().retries_requested += 1;
                    return ExecutionOutcome::Retry;
                }
                self.fall_back(item, FallbackCause::PrimaryFailed(err))
            }
        }
    }

    /// Walk the fallback chain. The reservation is always released.
    fn fall_back(&self, item: &WorkItem, cause: FallbackCause) -> ExecutionOutcome {
        self.governor.release(item.id);

        for strategy in self.chain.strategies() {
            match strategy {
                FallbackStrategy::Cache => {
                    let fingerprint = Fingerprint::of(&item.caller_id, item.operation, &item.payload);
                    if let Some(entry) = self.cache.get(&fingerprint) {
                        let mut stats = self.stats.lock();
                        stats.cache_hits += 1;
                        stats.fallbacks_used += 1;
                        stats.cost_savings += entry.cost;
                        drop(stats);

                        tracing::info!(item = %item.id, cause = ?cause, "Served cached result");
                        return ExecutionOutcome::Completed(WorkResult {
                            content: entry.payload,
                            source: ResultSource::Cache,
                            quality: ResponseQuality::CachedOnly,
                            cost_charged: 0.0,
                            completed_at: self.clock.now(),
                        });
                    }
                }
                FallbackStrategy::EmergencyContent => {
                    if let Some(content) = self.emergency.get(item.operation) {
                        let mut stats = self.stats.lock();
                        stats.emergency_served += 1;
                        stats.fallbacks_used += 1;
                        stats.cost_savings += item.estimated_cost.max(0.0);
                        drop(stats);

                        tracing::info!(item = %item.id, cause = ?cause, "Served emergency content");
                        return ExecutionOutcome::Completed(WorkResult {
                            content: content.clone(),
                            source: ResultSource::Emergency,
                            quality: ResponseQuality::CachedOnly,
                            cost_charged: 0.0,
                            completed_at: self.clock.now(),
                        });
                    }
                }
                FallbackStrategy::Fail => break,
            }
        }

        tracing::warn!(item = %item.id, cause = ?cause, "Fallbacks exhausted");
        ExecutionOutcome::Failed(cause.into_error())
    }
}
