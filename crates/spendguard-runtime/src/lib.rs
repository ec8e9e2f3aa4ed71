//! # spendguard-runtime
//!
//! Async admission control and graceful degradation for metered
//! generation backends.
//!
//! Built on the deterministic accounting in `spendguard-core`, this crate
//! decides which work may run, when, and what to serve when the primary
//! path cannot be used:
//! - Budget admission with reservations, overage and global emergency caps
//! - Sliding-window rate limits per caller and operation
//! - Tiered priority queues with bounded concurrency and expiry
//! - Circuit breakers, a response cache and emergency content as fallbacks
//! - A global degradation level driven by periodic health samples
//!
//! ## Important
//!
//! The runtime never calls a model itself. The hosting application
//! supplies the generation call as a [`PrimaryExecutor`] and, optionally,
//! a [`StateStore`] for persistence.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spendguard_runtime::{FnExecutor, GovernanceService, RuntimeConfig, SubmitRequest};
//!
//! let config = RuntimeConfig::from_file("spendguard.yaml")?;
//! let service = GovernanceService::builder(config)
//!     .default_executor(Arc::new(FnExecutor::new("gen", |request| async move {
//!         generate(request).await
//!     })))
//!     .build()
//!     .await?;
//! service.start();
//!
//! let receipt = service.submit(SubmitRequest::new(
//!     "alice",
//!     OperationType::ContentGeneration,
//!     0.20,
//!     json!({"prompt": "Summarize this profile"}),
//! ))?;
//! let status = service.status(receipt.queue_id).await;
//! ```

pub mod budget;
pub mod cache;
pub mod config;
pub mod executor;
pub mod orchestrator;
pub mod rate_limiter;
pub mod resilience;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod ticker;

pub use budget::{
    BudgetAnalytics, BudgetDecision, BudgetForecast, BudgetGovernor, BudgetLimits,
    GlobalBudgetConfig, GlobalHealth, GlobalStatus, Trend,
};
pub use cache::{CacheConfig, CacheEntry, CacheStats, Fingerprint, ResponseCache};
pub use config::{CalendarConfig, ConfigError, IntervalConfig, RuntimeConfig};
pub use executor::{
    ExecutionError, ExecutionOutput, ExecutionRequest, ExecutorRegistry, FnExecutor,
    PrimaryExecutor,
};
pub use orchestrator::{ExecutionConfig, ExecutionOutcome, FallbackOrchestrator, FallbackStats};
pub use rate_limiter::{DomainLimit, RateDecision, RateLimitConfig, RateLimiter};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState, DegradationConfig,
    DegradationController, DegradationRule, DegradationTransition, EmergencyContent,
    FallbackChain, FallbackStrategy, HealthSample, HealthWindow, LevelPolicy,
};
pub use scheduler::{PriorityScheduler, PriorityWeights, QueueStats, SchedulerConfig, StatusView};
pub use service::{
    BackgroundTickers, CleanupReport, GovernanceService, GovernanceServiceBuilder,
    HealthCheckReport, ServiceError, SubmitReceipt, SubmitRequest, SystemHealth,
};
pub use store::{JsonFileStore, MemoryStore, StateSnapshot, StateStore, StoreError};
pub use ticker::{IntervalTicker, ManualTicker, TickHandle, Ticker};
