//! Governance service façade.
//!
//! [`GovernanceService`] wires every component together and exposes the
//! caller-facing operations (`submit`, `status`, `budget_analytics`,
//! `system_health`), administrative overrides, and the background tasks
//! that dispatch work and run periodic maintenance.
//!
//! # Architecture
//! - Admission: degradation pre-check, then the scheduler's capacity, rate
//!   and budget gates
//! - Dispatch: one loop pops ready work per tier and runs each item on a
//!   `JoinSet` task while it holds its tier slot
//! - Maintenance: health sweep, cleanup and snapshot tasks wait on
//!   [`Ticker`]s so tests can drive them by hand
//! - Shutdown: a `CancellationToken` stops every task, queued work is
//!   cancelled and a final snapshot is saved

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use spendguard_core::{
    validate_caller_id, AlertBook, Clock, CostLedger, DegradationLevel, GovernanceError,
    LedgerError, OperationType, Scope, SystemClock, Tier, TierLimits, TierRegistry, WorkItem,
};

use crate::budget::{BudgetAnalytics, BudgetGovernor, GlobalHealth};
use crate::cache::{CacheStats, ResponseCache};
use crate::config::{ConfigError, IntervalConfig, RuntimeConfig};
use crate::executor::{ExecutorRegistry, PrimaryExecutor};
use crate::orchestrator::{ExecutionOutcome, FallbackOrchestrator, FallbackStats};
use crate::rate_limiter::RateLimiter;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerState, DegradationController, DegradationTransition,
    HealthSample, HealthSummary, HealthWindow,
};
use crate::scheduler::{Completion, Dispatch, PriorityScheduler, QueueStats, StatusView};
use crate::store::{save_with_retry, StateSnapshot, StateStore, StoreError, SNAPSHOT_VERSION};
use crate::ticker::{IntervalTicker, Ticker};

/// Attempts per snapshot save.
const SAVE_ATTEMPTS: usize = 3;

/// Errors building or persisting the service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to restore ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("No primary executor registered")]
    NoExecutor,
}

/// A unit of work offered by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub caller_id: String,
    pub operation: OperationType,
    pub estimated_cost: f64,
    pub payload: serde_json::Value,

    /// Overrides the configured default wait allowance
    #[serde(default)]
    pub max_wait: Option<Duration>,
}

impl SubmitRequest {
    pub fn new(
        caller_id: impl Into<String>,
        operation: OperationType,
        estimated_cost: f64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            caller_id: caller_id.into(),
            operation,
            estimated_cost,
            payload,
            max_wait: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

/// An accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub queue_id: Uuid,
    pub tier: Tier,
    pub position: usize,
    pub eta_ms: Option<u64>,
}

/// Operational snapshot for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub degradation_level: DegradationLevel,
    pub degraded_since: DateTime<Utc>,
    pub circuit_breakers: Vec<CircuitBreakerState>,
    pub cache: CacheStats,
    pub queue: QueueStats,
    pub fallback: FallbackStats,
    pub primary: HealthSummary,

    /// Result of the latest budget sweep
    pub global_budget: Option<GlobalHealth>,
    pub in_flight: usize,
    pub checked_at: DateTime<Utc>,
}

/// What one health sweep saw and did.
#[derive(Debug, Clone)]
pub struct HealthCheckReport {
    pub global: GlobalHealth,
    pub sample: HealthSample,
    pub transition: Option<DegradationTransition>,
}

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub cache_entries_purged: usize,
    pub rate_windows_purged: usize,
    pub work_expired: usize,
    pub alert_keys_pruned: usize,
}

/// Tick sources for the maintenance tasks.
pub struct BackgroundTickers {
    pub health_check: Box<dyn Ticker>,
    pub cleanup: Box<dyn Ticker>,

    /// Only used when a state store is configured
    pub snapshot: Box<dyn Ticker>,
}

impl BackgroundTickers {
    pub fn from_intervals(intervals: &IntervalConfig) -> Self {
        Self {
            health_check: Box::new(IntervalTicker::new(intervals.health_check)),
            cleanup: Box::new(IntervalTicker::new(intervals.cleanup)),
            snapshot: Box::new(IntervalTicker::new(intervals.snapshot)),
        }
    }
}

/// Builds a [`GovernanceService`].
pub struct GovernanceServiceBuilder {
    config: RuntimeConfig,
    clock: Option<Arc<dyn Clock>>,
    executors: ExecutorRegistry,
    store: Option<Arc<dyn StateStore>>,
}

impl GovernanceServiceBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            clock: None,
            executors: ExecutorRegistry::new(),
            store: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Serve every operation without its own executor.
    pub fn default_executor(mut self, executor: Arc<dyn PrimaryExecutor>) -> Self {
        self.executors.set_default(executor);
        self
    }

    pub fn executor(mut self, operation: OperationType, executor: Arc<dyn PrimaryExecutor>) -> Self {
        self.executors.register(operation, executor);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the config, wire the components and restore saved state.
    pub async fn build(self) -> Result<Arc<GovernanceService>, ServiceError> {
        let config = self.config;
        config.validate()?;
        if self.executors.is_empty() {
            return Err(ServiceError::NoExecutor);
        }

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let calendar = config.calendar();

        let tiers = Arc::new(config.tier_registry()?);
        let ledger = Arc::new(CostLedger::new(clock.clone(), calendar));
        let alerts = Arc::new(AlertBook::new(clock.clone(), calendar));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limits.clone(),
            tiers.clone(),
            clock.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(config.cache.clone(), clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            clock.clone(),
        ));
        let governor = Arc::new(BudgetGovernor::new(
            config.global.clone(),
            ledger.clone(),
            tiers.clone(),
            alerts.clone(),
        ));
        let degradation = Arc::new(DegradationController::new(
            config.degradation.clone(),
            alerts.clone(),
            clock.clone(),
        ));
        let health = Arc::new(HealthWindow::new(
            config.degradation.health_window,
            clock.clone(),
        ));
        let scheduler = Arc::new(PriorityScheduler::new(
            config.scheduler.clone(),
            tiers.clone(),
            rate_limiter.clone(),
            governor.clone(),
            clock.clone(),
        ));
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            config.execution.clone(),
            self.executors,
            governor.clone(),
            cache.clone(),
            breaker.clone(),
            degradation.clone(),
            health.clone(),
            config.fallback_chain.clone(),
            config.emergency_content.clone(),
            clock.clone(),
        ));

        let service = Arc::new(GovernanceService {
            clock,
            config,
            tiers,
            ledger,
            alerts,
            rate_limiter,
            cache,
            breaker,
            governor,
            degradation,
            health,
            scheduler,
            orchestrator,
            store: self.store,
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        if let Some(store) = &service.store {
            if let Some(snapshot) = store.load().await? {
                service.restore(snapshot)?;
            }
        }

        tracing::info!(
            services = ?service.orchestrator.executors().services(),
            "Governance service ready"
        );
        Ok(service)
    }
}

/// Cost-aware admission control and graceful degradation.
pub struct GovernanceService {
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
    tiers: Arc<TierRegistry>,
    ledger: Arc<CostLedger>,
    alerts: Arc<AlertBook>,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    breaker: Arc<CircuitBreaker>,
    governor: Arc<BudgetGovernor>,
    degradation: Arc<DegradationController>,
    health: Arc<HealthWindow>,
    scheduler: Arc<PriorityScheduler>,
    orchestrator: Arc<FallbackOrchestrator>,
    store: Option<Arc<dyn StateStore>>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GovernanceService {
    pub fn builder(config: RuntimeConfig) -> GovernanceServiceBuilder {
        GovernanceServiceBuilder::new(config)
    }

    // ---- caller-facing ----

    /// Offer work for admission.
    ///
    /// Budget, rate, capacity and degradation denials are returned
    /// immediately; they are never retried on the caller's behalf.
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, GovernanceError> {
        validate_caller_id(&request.caller_id)?;
        if !request.estimated_cost.is_finite() || request.estimated_cost < 0.0 {
            return Err(GovernanceError::InvalidRequest(format!(
                "estimated cost must be finite and non-negative, got {}",
                request.estimated_cost
            )));
        }

        let tier = self.tiers.get_tier(&request.caller_id);
        if let Err(err) = self.degradation.admits(tier, request.operation) {
            self.scheduler.record_rejection();
            tracing::debug!(caller = %request.caller_id, error = %err, "Submission rejected by degradation level");
            return Err(err);
        }

        let item = WorkItem::new(
            request.caller_id,
            tier,
            request.operation,
            request.estimated_cost,
            request.payload,
            self.clock.now(),
            request.max_wait.unwrap_or(self.config.scheduler.default_max_wait),
        );
        let caller = item.caller_id.clone();

        match self.scheduler.enqueue(item) {
            Ok(outcome) => Ok(SubmitReceipt {
                queue_id: outcome.id,
                tier,
                position: outcome.position,
                eta_ms: outcome.eta_ms,
            }),
            Err(err) => {
                tracing::info!(caller = %caller, kind = err.kind(), reason = %err, "Submission denied");
                Err(err)
            }
        }
    }

    pub async fn status(&self, queue_id: Uuid) -> Option<StatusView> {
        self.scheduler.status(queue_id).await
    }

    pub fn budget_analytics(&self, scope: &Scope) -> BudgetAnalytics {
        self.governor.analytics(scope)
    }

    pub fn system_health(&self) -> SystemHealth {
        SystemHealth {
            degradation_level: self.degradation.level(),
            degraded_since: self.degradation.since(),
            circuit_breakers: self.breaker.states(),
            cache: self.cache.stats(),
            queue: self.scheduler.stats(),
            fallback: self.orchestrator.stats(),
            primary: self.health.summary(),
            global_budget: self.governor.last_health(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            checked_at: self.clock.now(),
        }
    }

    // ---- administration ----

    pub fn acknowledge_alert(&self, alert_id: Uuid) -> bool {
        self.alerts.acknowledge(alert_id)
    }

    pub fn resolve_intervention(&self, intervention_id: Uuid) -> bool {
        self.alerts.resolve(intervention_id)
    }

    /// Takes effect on the caller's next admission check.
    pub fn set_tier(&self, caller_id: &str, tier: Tier) -> Result<(), GovernanceError> {
        validate_caller_id(caller_id)?;
        self.tiers.set_tier(caller_id, tier);
        Ok(())
    }

    pub fn override_tier_limits(&self, tier: Tier, limits: TierLimits) -> Result<(), GovernanceError> {
        let amounts = [limits.daily_budget, limits.monthly_budget, limits.max_overage];
        if amounts.iter().any(|a| !a.is_finite() || *a < 0.0) || limits.max_concurrency == 0 {
            return Err(GovernanceError::InvalidRequest(format!(
                "invalid limits for {} tier",
                tier
            )));
        }
        self.tiers.override_limits(tier, limits);
        Ok(())
    }

    pub fn force_degradation(
        &self,
        level: DegradationLevel,
        reason: impl Into<String>,
    ) -> Option<DegradationTransition> {
        self.degradation.force_level(level, reason)
    }

    pub fn reset_circuit(&self, service: &str) -> bool {
        self.breaker.reset(service)
    }

    // ---- maintenance ----

    /// Budget sweep followed by a degradation sample.
    pub fn run_health_check(&self) -> HealthCheckReport {
        let global = self.governor.health_check();
        let primary = self.health.summary();
        let sample = HealthSample {
            budget_pct: global.percentage,
            error_rate: primary.error_rate,
            average_latency_ms: primary.average_latency_ms,
            samples: primary.samples,
            emergency: global.is_emergency(),
            taken_at: self.clock.now(),
        };
        let transition = self.degradation.observe(sample.clone());

        tracing::debug!(
            status = ?global.status,
            budget_pct = global.percentage,
            error_rate = sample.error_rate,
            level = %self.degradation.level(),
            "Health check complete"
        );
        HealthCheckReport {
            global,
            sample,
            transition,
        }
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        let report = CleanupReport {
            cache_entries_purged: self.cache.purge_expired(),
            rate_windows_purged: self.rate_limiter.purge_idle(),
            work_expired: self.scheduler.expire_stale().await,
            alert_keys_pruned: self.alerts.prune_dedup_index(),
        };
        if report != CleanupReport::default() {
            tracing::debug!(?report, "Cleanup complete");
        }
        report
    }

    /// Run one dispatch round to completion. Returns the items executed.
    pub async fn process_ready(&self) -> usize {
        let dispatches = self.scheduler.next_dispatches().await;
        let count = dispatches.len();
        futures::future::join_all(dispatches.into_iter().map(|d| self.execute_dispatch(d))).await;
        count
    }

    /// Process rounds until nothing more can be dispatched.
    pub async fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            self.scheduler.expire_stale().await;
            let processed = self.process_ready().await;
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }

    async fn execute_dispatch(&self, dispatch: Dispatch) {
        let started = tokio::time::Instant::now();
        let allow_retry = dispatch.item.retry_count < self.config.scheduler.max_retries;

        let outcome = AssertUnwindSafe(self.orchestrator.execute(&dispatch.item, allow_retry))
            .catch_unwind()
            .await;
        let completion = match outcome {
            Ok(ExecutionOutcome::Completed(result)) => Completion::Completed(result),
            Ok(ExecutionOutcome::Retry) => Completion::Retry,
            Ok(ExecutionOutcome::Failed(err)) => Completion::Failed(err),
            Err(_) => {
                tracing::error!(item = %dispatch.item.id, "Work execution panicked");
                self.governor.release(dispatch.item.id);
                Completion::Failed(GovernanceError::Unknown("execution panicked".to_string()))
            }
        };

        self.scheduler
            .complete(dispatch, completion, started.elapsed())
            .await;
    }

    // ---- persistence ----

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: self.clock.now(),
            ledger: self.ledger.snapshot(),
            alerts: self.alerts.snapshot(),
            circuits: self.breaker.states(),
            cache: self.cache.snapshot(),
            degradation: Some(self.degradation.snapshot()),
            tier_assignments: self.tiers.assignments(),
        }
    }

    pub fn restore(&self, snapshot: StateSnapshot) -> Result<(), ServiceError> {
        snapshot.check_version()?;
        self.ledger.restore(snapshot.ledger)?;
        self.alerts.restore(snapshot.alerts);
        self.breaker.restore(snapshot.circuits);
        self.cache.restore(snapshot.cache);
        if let Some(degradation) = snapshot.degradation {
            self.degradation.restore(degradation);
        }
        self.tiers.restore_assignments(snapshot.tier_assignments);
        tracing::info!(taken_at = %snapshot.taken_at, "Restored governance state");
        Ok(())
    }

    /// Save a snapshot to the configured store, if any.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        save_with_retry(store.as_ref(), &snapshot, SAVE_ATTEMPTS).await?;
        tracing::debug!(records = self.ledger.record_count(), "Saved governance snapshot");
        Ok(())
    }

    // ---- lifecycle ----

    /// Start the dispatch loop and maintenance tasks on interval tickers.
    pub fn start(self: &Arc<Self>) {
        let tickers = BackgroundTickers::from_intervals(&self.config.intervals);
        self.start_with(tickers);
    }

    pub fn start_with(self: &Arc<Self>, tickers: BackgroundTickers) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().dispatch_loop()));
        tasks.push(self.spawn_periodic("health_check", tickers.health_check, |service| async move {
            service.run_health_check();
        }));
        tasks.push(self.spawn_periodic("cleanup", tickers.cleanup, |service| async move {
            service.run_cleanup().await;
        }));
        if self.store.is_some() {
            tasks.push(self.spawn_periodic("snapshot", tickers.snapshot, |service| async move {
                if let Err(err) = service.persist().await {
                    tracing::error!(error = %err, "Failed to save governance snapshot");
                }
            }));
        }
        tracing::info!("Governance service started");
    }

    fn spawn_periodic<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        mut ticker: Box<dyn Ticker>,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    more = ticker.tick() => {
                        if !more {
                            break;
                        }
                        task(service.clone()).await;
                    }
                }
            }
            tracing::debug!(task = name, "Background task stopped");
        })
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut join_set: JoinSet<()> = JoinSet::new();
        let interval = self.config.scheduler.dispatch_interval;

        loop {
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "Dispatch task failed");
                }
            }

            for dispatch in self.scheduler.next_dispatches().await {
                let service = self.clone();
                let in_flight = self.in_flight.clone();
                in_flight.fetch_add(1, Ordering::Relaxed);

                join_set.spawn(async move {
                    let _guard = scopeguard::guard((), |_| {
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                    });
                    service.execute_dispatch(dispatch).await;
                });
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.scheduler.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }

        // Let in-flight work finish and settle.
        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Dispatch task failed");
            }
        }
        tracing::debug!("Dispatch loop stopped");
    }

    /// Stop background tasks, cancel queued work and save a final snapshot.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Background task ended abnormally");
            }
        }

        self.scheduler.cancel_all("service shutting down").await;
        self.persist().await?;
        tracing::info!("Governance service stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tasks.lock().is_empty()
    }

    // ---- accessors ----

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn tiers(&self) -> &Arc<TierRegistry> {
        &self.tiers
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn alerts(&self) -> &Arc<AlertBook> {
        &self.alerts
    }

    pub fn governor(&self) -> &Arc<BudgetGovernor> {
        &self.governor
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn degradation(&self) -> &Arc<DegradationController> {
        &self.degradation
    }

    pub fn scheduler(&self) -> &Arc<PriorityScheduler> {
        &self.scheduler
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionOutput, ExecutionRequest, FnExecutor};
    use crate::store::MemoryStore;
    use crate::ticker::ManualTicker;
    use chrono::TimeZone;
    use serde_json::json;
    use spendguard_core::{ManualClock, ResultSource, WorkStatus};

    fn echo() -> Arc<dyn PrimaryExecutor> {
        Arc::new(FnExecutor::new("gen", |request: ExecutionRequest| async move {
            Ok(ExecutionOutput::new(json!({"echo": request.payload})).with_cost(0.02, 10))
        }))
    }

    fn clock() -> Arc<ManualClock> {
        ManualClock::shared(Utc.with_ymd_and_hms(2026, 4, 14, 10, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_build_requires_executor() {
        let result = GovernanceService::builder(RuntimeConfig::default()).build().await;
        assert!(matches!(result, Err(ServiceError::NoExecutor)));
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let clock = clock();
        let service = GovernanceService::builder(RuntimeConfig::default())
            .clock(clock.clone())
            .default_executor(echo())
            .build()
            .await
            .unwrap();

        let receipt = service
            .submit(SubmitRequest::new("alice", OperationType::ContentGeneration, 0.05, json!({"q": 1})))
            .unwrap();
        assert_eq!(receipt.tier, Tier::Free);
        assert_eq!(receipt.position, 1);

        assert_eq!(service.drain().await, 1);
        let status = service.status(receipt.queue_id).await.unwrap();
        assert_eq!(status.status, WorkStatus::Completed);
        assert_eq!(status.result.unwrap().source, ResultSource::Primary);

        let analytics = service.budget_analytics(&Scope::caller("alice"));
        assert!((analytics.spend.today - 0.02).abs() < 1e-9);
        assert_eq!(analytics.reserved, 0.0);

        let health = service.system_health();
        assert_eq!(health.degradation_level, DegradationLevel::Normal);
        assert_eq!(health.queue.completed, 1);
        assert_eq!(health.cache.entries, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_input() {
        let service = GovernanceService::builder(RuntimeConfig::default())
            .clock(clock())
            .default_executor(echo())
            .build()
            .await
            .unwrap();

        assert!(matches!(
            service.submit(SubmitRequest::new("", OperationType::Analytics, 0.1, json!({}))),
            Err(GovernanceError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.submit(SubmitRequest::new("bob", OperationType::Analytics, f64::NAN, json!({}))),
            Err(GovernanceError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_prunes_yesterdays_alert_keys() {
        let clock = clock();
        let service = GovernanceService::builder(RuntimeConfig::default())
            .clock(clock.clone())
            .default_executor(echo())
            .build()
            .await
            .unwrap();
        service.alerts().raise_alert(
            Scope::caller("alice"),
            spendguard_core::AlertKind::Overage,
            105.0,
            "overage",
        );
        assert_eq!(service.run_cleanup().await.alert_keys_pruned, 0);

        clock.advance(Duration::from_secs(24 * 3600));
        let report = service.run_cleanup().await;
        assert_eq!(report.alert_keys_pruned, 1);
        assert_eq!(service.alerts().alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_level_rejects_at_submission() {
        let service = GovernanceService::builder(RuntimeConfig::default())
            .clock(clock())
            .default_executor(echo())
            .build()
            .await
            .unwrap();
        service.force_degradation(DegradationLevel::Minimal, "load test");

        let err = service
            .submit(SubmitRequest::new("carol", OperationType::ContentGeneration, 0.1, json!({})))
            .unwrap_err();
        assert!(matches!(err, GovernanceError::ServiceDegraded { .. }));
        assert_eq!(service.system_health().queue.rejected, 1);

        service.set_tier("carol", Tier::Premium).unwrap();
        assert!(service
            .submit(SubmitRequest::new("carol", OperationType::ContentGeneration, 0.1, json!({})))
            .is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let clock = clock();
        let store = Arc::new(MemoryStore::new());
        let first = GovernanceService::builder(RuntimeConfig::default())
            .clock(clock.clone())
            .default_executor(echo())
            .store(store.clone())
            .build()
            .await
            .unwrap();

        first.set_tier("dave", Tier::Enterprise).unwrap();
        first
            .submit(SubmitRequest::new("dave", OperationType::ContentGeneration, 0.05, json!({"n": 1})))
            .unwrap();
        first.drain().await;
        first.shutdown().await.unwrap();
        assert_eq!(store.save_count(), 1);

        let second = GovernanceService::builder(RuntimeConfig::default())
            .clock(clock.clone())
            .default_executor(echo())
            .store(store.clone())
            .build()
            .await
            .unwrap();
        assert_eq!(second.tiers().get_tier("dave"), Tier::Enterprise);
        assert!((second.ledger().today_spend(&Scope::caller("dave")) - 0.02).abs() < 1e-9);
        assert_eq!(second.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_background_tasks_run_on_manual_ticks() {
        let clock = clock();
        let store = Arc::new(MemoryStore::new());
        let service = GovernanceService::builder(RuntimeConfig::default())
            .clock(clock.clone())
            .default_executor(echo())
            .store(store.clone())
            .build()
            .await
            .unwrap();

        let (health_ticker, health_tick) = ManualTicker::new();
        let (cleanup_ticker, _cleanup_tick) = ManualTicker::new();
        let (snapshot_ticker, snapshot_tick) = ManualTicker::new();
        service.start_with(BackgroundTickers {
            health_check: Box::new(health_ticker),
            cleanup: Box::new(cleanup_ticker),
            snapshot: Box::new(snapshot_ticker),
        });
        assert!(service.is_running());

        let receipt = service
            .submit(SubmitRequest::new("erin", OperationType::Analytics, 0.01, json!({})))
            .unwrap();
        for _ in 0..200 {
            if service
                .status(receipt.queue_id)
                .await
                .is_some_and(|s| s.status == WorkStatus::Completed)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            service.status(receipt.queue_id).await.unwrap().status,
            WorkStatus::Completed
        );

        health_tick.tick();
        snapshot_tick.tick();
        for _ in 0..200 {
            if service.governor().last_health().is_some() && store.save_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(service.governor().last_health().is_some());
        assert!(store.save_count() >= 1);

        service.shutdown().await.unwrap();
        assert!(!service.is_running());
    }
}
