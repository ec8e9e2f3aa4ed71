//! Circuit breaker to prevent cascade failures.
//!
//! When a downstream service fails repeatedly, its circuit opens and
//! subsequent calls short-circuit straight to the fallback chain until the
//! cool-down expires. Failures older than the decay window are forgotten
//! even while the circuit is closed.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use spendguard_core::{Clock, GovernanceError};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time before attempting recovery
    #[serde(with = "crate::config::duration_str")]
    pub recovery_timeout: Duration,

    /// Consecutive half-open successes needed to close circuit
    pub success_threshold: u32,

    /// Failures older than this no longer count toward the threshold
    #[serde(with = "crate::config::duration_str")]
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            failure_window: Duration::from_secs(60),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// All calls bypass the service
    Open,

    /// Testing if circuit can close, one trial call at a time
    HalfOpen,
}

/// Externally visible state of one service's circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ServiceCircuit {
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl Default for ServiceCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            successes: 0,
            last_failure_at: None,
            next_retry_at: None,
            trial_in_flight: false,
        }
    }
}

impl ServiceCircuit {
    fn decay(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        while self.failures.front().is_some_and(|t| *t <= cutoff) {
            self.failures.pop_front();
        }
    }

    fn open(&mut self, now: DateTime<Utc>, cool_down: Duration) {
        self.state = CircuitState::Open;
        self.successes = 0;
        self.trial_in_flight = false;
        self.next_retry_at =
            Some(now + chrono::Duration::from_std(cool_down).unwrap_or(chrono::Duration::zero()));
    }

    fn view(&self, service_name: &str) -> CircuitBreakerState {
        CircuitBreakerState {
            service_name: service_name.to_string(),
            state: self.state,
            failure_count: u32::try_from(self.failures.len()).unwrap_or(u32::MAX),
            success_count: self.successes,
            last_failure_at: self.last_failure_at,
            next_retry_at: self.next_retry_at,
        }
    }
}

/// Circuit breaker prevents cascade failures.
///
/// Each downstream service has its own circuit to allow independent recovery.
pub struct CircuitBreaker {
    clock: Arc<dyn Clock>,
    states: RwLock<HashMap<String, ServiceCircuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            states: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Gate a call to `service`.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and
    /// lets exactly one trial through; concurrent callers keep
    /// short-circuiting until that trial reports back.
    pub fn check(&self, service: &str) -> Result<(), GovernanceError> {
        let now = self.clock.now();
        let mut states = self.states.write();
        let Some(circuit) = states.get_mut(service) else {
            return Ok(());
        };

        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let retry_at = circuit.next_retry_at.unwrap_or(now);
                if now >= retry_at {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.successes = 0;
                    circuit.trial_in_flight = true;
                    tracing::info!(service, "Circuit transitioning to half-open for recovery test");
                    Ok(())
                } else {
                    Err(GovernanceError::CircuitOpen {
                        service: service.to_string(),
                        retry_at,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    Err(GovernanceError::CircuitOpen {
                        service: service.to_string(),
                        retry_at: circuit.next_retry_at.unwrap_or(now),
                    })
                } else {
                    circuit.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Whether calls to `service` currently short-circuit.
    pub fn is_open(&self, service: &str) -> bool {
        let now = self.clock.now();
        match self.states.read().get(service) {
            Some(circuit) => match circuit.state {
                CircuitState::Open => circuit.next_retry_at.map_or(true, |at| now < at),
                CircuitState::HalfOpen => circuit.trial_in_flight,
                CircuitState::Closed => false,
            },
            None => false,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, service: &str) {
        let mut states = self.states.write();
        let Some(circuit) = states.get_mut(service) else {
            return;
        };

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.trial_in_flight = false;
                circuit.successes += 1;
                if circuit.successes >= self.config.success_threshold {
                    // Close the circuit
                    circuit.state = CircuitState::Closed;
                    circuit.successes = 0;
                    circuit.failures.clear();
                    circuit.next_retry_at = None;
                    tracing::info!(service, "Circuit closed after successful recovery");
                }
            }
            CircuitState::Closed => {
                // Failures must be consecutive
                circuit.failures.clear();
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, service: &str) {
        let now = self.clock.now();
        let mut states = self.states.write();
        let circuit = states.entry(service.to_string()).or_default();
        circuit.last_failure_at = Some(now);

        match circuit.state {
            CircuitState::Closed => {
                circuit.decay(now, self.config.failure_window);
                circuit.failures.push_back(now);
                let failures = circuit.failures.len();
                if failures >= self.config.failure_threshold.max(1) as usize {
                    circuit.open(now, self.config.recovery_timeout);
                    tracing::warn!(service, failures, "Circuit opened after repeated failures");
                }
            }
            CircuitState::HalfOpen => {
                circuit.failures.push_back(now);
                circuit.open(now, self.config.recovery_timeout);
                tracing::warn!(service, "Circuit reopened after failed recovery attempt");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of a circuit; unknown services are closed.
    pub fn state(&self, service: &str) -> CircuitState {
        self.states
            .read()
            .get(service)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of every tracked circuit, sorted by service name.
    pub fn states(&self) -> Vec<CircuitBreakerState> {
        let now = self.clock.now();
        let mut states = self.states.write();
        let mut views: Vec<CircuitBreakerState> = states
            .iter_mut()
            .map(|(name, circuit)| {
                if circuit.state == CircuitState::Closed {
                    circuit.decay(now, self.config.failure_window);
                }
                circuit.view(name)
            })
            .collect();
        views.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        views
    }

    /// Reload persisted circuit states.
    pub fn restore(&self, snapshot: Vec<CircuitBreakerState>) {
        let mut states = self.states.write();
        for saved in snapshot {
            let at = saved.last_failure_at.unwrap_or_else(|| self.clock.now());
            let circuit = ServiceCircuit {
                state: saved.state,
                failures: std::iter::repeat(at)
                    .take(saved.failure_count as usize)
                    .collect(),
                successes: saved.success_count,
                last_failure_at: saved.last_failure_at,
                next_retry_at: saved.next_retry_at,
                trial_in_flight: false,
            };
            states.insert(saved.service_name, circuit);
        }
    }

    /// Administrative reset of one circuit to closed.
    pub fn reset(&self, service: &str) -> bool {
        let removed = self.states.write().remove(service).is_some();
        if removed {
            tracing::info!(service, "Circuit manually reset");
        }
        removed
    }

    /// Reset all circuits to closed.
    pub fn reset_all(&self) {
        self.states.write().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            CircuitBreakerConfig::default(),
            Arc::new(spendguard_core::SystemClock),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spendguard_core::ManualClock;

    fn breaker(config: CircuitBreakerConfig) -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap());
        (clock.clone(), CircuitBreaker::new(config, clock))
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::default();
        assert!(!cb.is_open("gen"));
        assert!(cb.check("gen").is_ok());
    }

    #[test]
    fn test_circuit_opens_after_failures() {
        let (_, cb) = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });

        cb.record_failure("gen");
        assert!(!cb.is_open("gen"));

        cb.record_failure("gen");
        assert!(cb.is_open("gen"));
        assert!(matches!(
            cb.check("gen"),
            Err(GovernanceError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_success_resets_failures() {
        let (_, cb) = breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        cb.record_failure("gen");
        cb.record_failure("gen");

        // Success should reset
        cb.record_success("gen");

        // Need 3 more failures to open
        cb.record_failure("gen");
        cb.record_failure("gen");
        assert!(!cb.is_open("gen"));
    }

    #[test]
    fn test_old_failures_decay() {
        let (clock, cb) = breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            ..Default::default()
        });

        cb.record_failure("gen");
        cb.record_failure("gen");
        clock.advance(Duration::from_secs(61));
        cb.record_failure("gen");

        assert_eq!(cb.state("gen"), CircuitState::Closed);
        assert_eq!(cb.states()[0].failure_count, 1);
    }

    #[test]
    fn test_half_open_recovery() {
        let (clock, cb) = breaker(CircuitBreakerConfig::default());
        for _ in 0..5 {
            cb.record_failure("gen");
        }
        assert_eq!(cb.state("gen"), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        assert!(cb.check("gen").is_ok());
        assert_eq!(cb.state("gen"), CircuitState::HalfOpen);

        // Only one trial at a time.
        assert!(cb.check("gen").is_err());

        cb.record_success("gen");
        assert!(cb.check("gen").is_ok());
        cb.record_success("gen");
        assert_eq!(cb.state("gen"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (clock, cb) = breaker(CircuitBreakerConfig::default());
        for _ in 0..5 {
            cb.record_failure("gen");
        }
        clock.advance(Duration::from_secs(30));
        assert!(cb.check("gen").is_ok());

        cb.record_failure("gen");
        assert_eq!(cb.state("gen"), CircuitState::Open);

        // Fresh cool-down from the failed trial.
        clock.advance(Duration::from_secs(29));
        assert!(cb.is_open("gen"));
        clock.advance(Duration::from_secs(1));
        assert!(!cb.is_open("gen"));
    }

    #[test]
    fn test_services_are_independent() {
        let (_, cb) = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });

        cb.record_failure("gen");
        cb.record_failure("gen");

        assert!(cb.is_open("gen"));
        assert!(!cb.is_open("verify"));
    }

    #[test]
    fn test_restore_keeps_open_circuit() {
        let (clock, cb) = breaker(CircuitBreakerConfig::default());
        for _ in 0..5 {
            cb.record_failure("gen");
        }
        let saved = cb.states();

        let restored = CircuitBreaker::new(CircuitBreakerConfig::default(), clock);
        restored.restore(saved);
        assert!(restored.is_open("gen"));
        assert!(restored.reset("gen"));
        assert!(!restored.is_open("gen"));
    }
}
