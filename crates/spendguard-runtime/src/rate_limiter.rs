//! Sliding-window request throttle.
//!
//! Each (caller, operation) pair keeps the timestamps of its recent calls.
//! Entries older than the window are discarded before every decision, and
//! the remaining count is compared against the tier's allowance. Operations
//! can be mapped onto named domains so that different downstream
//! dependencies carry their own windows and thresholds.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use spendguard_core::{Clock, GovernanceError, OperationType, Tier, TierRegistry};

/// Window and per-tier limits for one downstream domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainLimit {
    #[serde(with = "crate::config::duration_str")]
    pub window: Duration,

    /// Requests per window by tier; missing tiers use the tier's own allowance
    #[serde(default)]
    pub limits: BTreeMap<Tier, u32>,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window for operations not mapped to a domain
    #[serde(with = "crate::config::duration_str")]
    pub default_window: Duration,

    pub domains: BTreeMap<String, DomainLimit>,

    /// Operation → domain name
    pub operation_domains: BTreeMap<OperationType, String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(
            "verification".to_string(),
            DomainLimit {
                window: Duration::from_secs(60),
                limits: BTreeMap::from([
                    (Tier::Free, 5),
                    (Tier::Premium, 30),
                    (Tier::Enterprise, 300),
                ]),
            },
        );

        Self {
            default_window: Duration::from_secs(60),
            domains,
            operation_domains: BTreeMap::from([(
                OperationType::Verification,
                "verification".to_string(),
            )]),
        }
    }
}

/// Outcome of an atomic check-and-record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,

    /// When the oldest call in the window falls out of it
    pub reset_at: DateTime<Utc>,
}

type WindowKey = (String, OperationType);

/// Per-caller, per-operation sliding window limiter.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    tiers: Arc<TierRegistry>,
    config: RateLimitConfig,
    windows: DashMap<WindowKey, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, tiers: Arc<TierRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tiers,
            config,
            windows: DashMap::new(),
        }
    }

    /// Window length and request allowance for a caller on an operation.
    pub fn limit_for(&self, caller_id: &str, operation: OperationType) -> (Duration, u32) {
        let (tier, limits) = self.tiers.limits_for_caller(caller_id);
        let domain = self
            .config
            .operation_domains
            .get(&operation)
            .and_then(|name| self.config.domains.get(name));

        match domain {
            Some(domain) => (
                domain.window,
                domain
                    .limits
                    .get(&tier)
                    .copied()
                    .unwrap_or(limits.requests_per_window),
            ),
            None => (self.config.default_window, limits.requests_per_window),
        }
    }

    /// Whether another call would be allowed right now. Does not record.
    pub fn allow(&self, caller_id: &str, operation: OperationType) -> bool {
        self.check(caller_id, operation).allowed
    }

    /// Inspect the window without recording a call.
    pub fn check(&self, caller_id: &str, operation: OperationType) -> RateDecision {
        let now = self.clock.now();
        let (window, limit) = self.limit_for(caller_id, operation);
        let key = (caller_id.to_string(), operation);

        match self.windows.get_mut(&key) {
            Some(mut calls) => {
                prune(&mut calls, now, window);
                decide(&calls, now, window, limit)
            }
            None => decide(&VecDeque::new(), now, window, limit),
        }
    }

    /// Record a call unconditionally.
    pub fn record(&self, caller_id: &str, operation: OperationType) {
        let now = self.clock.now();
        let (window, _) = self.limit_for(caller_id, operation);
        let mut calls = self
            .windows
            .entry((caller_id.to_string(), operation))
            .or_default();
        prune(&mut calls, now, window);
        calls.push_back(now);
    }

    /// Check and record in one step under the per-key lock.
    pub fn try_acquire(
        &self,
        caller_id: &str,
        operation: OperationType,
    ) -> Result<RateDecision, GovernanceError> {
        let now = self.clock.now();
        let (window, limit) = self.limit_for(caller_id, operation);
        let mut calls = self
            .windows
            .entry((caller_id.to_string(), operation))
            .or_default();
        prune(&mut calls, now, window);

        let decision = decide(&calls, now, window, limit);
        if !decision.allowed {
            tracing::debug!(
                caller = caller_id,
                operation = %operation,
                limit,
                reset_at = %decision.reset_at,
                "Rate limit exceeded"
            );
            return Err(GovernanceError::RateLimited {
                caller: caller_id.to_string(),
                operation,
                reset_at: decision.reset_at,
            });
        }

        calls.push_back(now);
        Ok(RateDecision {
            remaining: decision.remaining.saturating_sub(1),
            ..decision
        })
    }

    /// Give back the most recent call, used when a later gate rejects the
    /// request that consumed it.
    pub fn refund(&self, caller_id: &str, operation: OperationType) {
        if let Some(mut calls) = self.windows.get_mut(&(caller_id.to_string(), operation)) {
            calls.pop_back();
        }
    }

    /// Drop windows with no calls left in them. Returns how many were removed.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|(caller, operation), calls| {
            let (window, _) = self.limit_for(caller, *operation);
            prune(calls, now, window);
            !calls.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

fn window_delta(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
}

fn prune(calls: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
    let cutoff = now - window_delta(window);
    while calls.front().is_some_and(|t| *t <= cutoff) {
        calls.pop_front();
    }
}

fn decide(
    calls: &VecDeque<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
    limit: u32,
) -> RateDecision {
    let used = u32::try_from(calls.len()).unwrap_or(u32::MAX);
    let reset_at = calls.front().copied().unwrap_or(now) + window_delta(window);
    RateDecision {
        allowed: used < limit,
        limit,
        remaining: limit.saturating_sub(used),
        reset_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spendguard_core::ManualClock;

    fn limiter() -> (Arc<ManualClock>, Arc<TierRegistry>, RateLimiter) {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 2, 3, 10, 0, 0).unwrap());
        let tiers = Arc::new(TierRegistry::default());
        let limiter = RateLimiter::new(RateLimitConfig::default(), tiers.clone(), clock.clone());
        (clock, tiers, limiter)
    }

    #[test]
    fn test_window_slides() {
        let (clock, _, limiter) = limiter();
        // Free tier: 10 requests per 60s window
        for _ in 0..10 {
            assert!(limiter
                .try_acquire("alice", OperationType::ContentGeneration)
                .is_ok());
            clock.advance(Duration::from_secs(1));
        }

        let err = limiter
            .try_acquire("alice", OperationType::ContentGeneration)
            .unwrap_err();
        match err {
            GovernanceError::RateLimited { reset_at, .. } => {
                assert_eq!(reset_at, Utc.with_ymd_and_hms(2026, 2, 3, 10, 1, 0).unwrap());
            }
            other => panic!("unexpected error {other:?}"),
        }

        // First call leaves the window at t=60s.
        clock.advance(Duration::from_secs(50));
        assert!(limiter.allow("alice", OperationType::ContentGeneration));
    }

    #[test]
    fn test_operations_have_separate_windows() {
        let (_, _, limiter) = limiter();
        for _ in 0..10 {
            limiter.record("alice", OperationType::ContentGeneration);
        }
        assert!(!limiter.allow("alice", OperationType::ContentGeneration));
        assert!(limiter.allow("alice", OperationType::Analytics));
        assert!(limiter.allow("bob", OperationType::ContentGeneration));
    }

    #[test]
    fn test_domain_limits_override_tier_allowance() {
        let (_, tiers, limiter) = limiter();
        assert_eq!(
            limiter.limit_for("alice", OperationType::Verification),
            (Duration::from_secs(60), 5)
        );

        tiers.set_tier("alice", Tier::Premium);
        assert_eq!(
            limiter.limit_for("alice", OperationType::Verification).1,
            30
        );
        assert_eq!(
            limiter.limit_for("alice", OperationType::ContentGeneration).1,
            60
        );
    }

    #[test]
    fn test_refund_and_purge() {
        let (clock, _, limiter) = limiter();
        let decision = limiter
            .try_acquire("alice", OperationType::Analytics)
            .unwrap();
        assert_eq!(decision.remaining, 9);

        limiter.refund("alice", OperationType::Analytics);
        assert_eq!(limiter.check("alice", OperationType::Analytics).remaining, 10);

        limiter.record("bob", OperationType::Analytics);
        clock.advance(Duration::from_secs(61));
        assert_eq!(limiter.purge_idle(), 2);
        assert_eq!(limiter.tracked_windows(), 0);
    }
}
