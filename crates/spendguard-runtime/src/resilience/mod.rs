//! Resilience patterns for spendguard-runtime.
//!
//! This module provides:
//! - Circuit breaker per downstream service
//! - Sliding health window of primary outcomes
//! - Global degradation state machine
//! - Fallback strategies and emergency content

mod circuit_breaker;
mod degradation;
mod fallback;
mod health;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState};
pub use degradation::{
    DegradationConfig, DegradationController, DegradationRule, DegradationSnapshot,
    DegradationTransition, HealthSample, LevelPolicy,
};
pub use fallback::{EmergencyContent, FallbackChain, FallbackStrategy};
pub use health::{HealthSummary, HealthWindow};
