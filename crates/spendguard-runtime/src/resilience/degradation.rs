//! Global degradation state machine.
//!
//! A periodic [`HealthSample`] (global budget percentage, error rate,
//! latency) is matched against a rule table from most to least restrictive.
//! Escalation moves one level per sample, except that an emergency trigger
//! or a matched emergency rule jumps straight to `Emergency`. Recovery moves
//! one level down only after `recovery_samples` consecutive calmer samples.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use spendguard_core::{
    AlertBook, Clock, DegradationLevel, GovernanceError, InterventionKind, OperationType,
    ResponseQuality, Scope, Severity, Tier,
};

/// Trigger thresholds for one level. Any threshold met or exceeded fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationRule {
    pub level: DegradationLevel,

    /// Global spend as a percentage of the global daily budget
    #[serde(default)]
    pub budget_pct: Option<f64>,

    /// Fraction of failed primary calls in the health window
    #[serde(default)]
    pub error_rate: Option<f64>,

    /// Mean primary latency in milliseconds
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

impl DegradationRule {
    fn matches(&self, sample: &HealthSample, min_samples: usize) -> Option<String> {
        if let Some(threshold) = self.budget_pct {
            if sample.budget_pct >= threshold {
                return Some(format!(
                    "global budget at {:.0}% (threshold {:.0}%)",
                    sample.budget_pct, threshold
                ));
            }
        }

        if sample.samples < min_samples {
            return None;
        }

        if let Some(threshold) = self.error_rate {
            if sample.error_rate >= threshold {
                return Some(format!(
                    "error rate {:.0}% (threshold {:.0}%)",
                    sample.error_rate * 100.0,
                    threshold * 100.0
                ));
            }
        }
        if let Some(threshold) = self.latency_ms {
            if sample.average_latency_ms >= threshold {
                return Some(format!(
                    "average latency {:.0}ms (threshold {:.0}ms)",
                    sample.average_latency_ms, threshold
                ));
            }
        }
        None
    }
}

/// What may still be served at a level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelPolicy {
    pub allowed_operations: Vec<OperationType>,
    pub allowed_tiers: Vec<Tier>,
    pub quality: ResponseQuality,

    /// Responses may only come from cache or emergency content
    #[serde(default)]
    pub cache_only: bool,
}

impl LevelPolicy {
    pub fn default_for(level: DegradationLevel) -> Self {
        match level {
            DegradationLevel::Normal => Self {
                allowed_operations: OperationType::ALL.to_vec(),
                allowed_tiers: Tier::ALL.to_vec(),
                quality: ResponseQuality::Full,
                cache_only: false,
            },
            DegradationLevel::Degraded => Self {
                allowed_operations: vec![
                    OperationType::ContentGeneration,
                    OperationType::ProfileAnalysis,
                    OperationType::Verification,
                ],
                allowed_tiers: Tier::ALL.to_vec(),
                quality: ResponseQuality::Reduced,
                cache_only: false,
            },
            DegradationLevel::Minimal => Self {
                allowed_operations: vec![OperationType::ContentGeneration],
                allowed_tiers: vec![Tier::Premium, Tier::Enterprise],
                quality: ResponseQuality::Reduced,
                cache_only: false,
            },
            DegradationLevel::Emergency => Self {
                allowed_operations: vec![OperationType::ContentGeneration],
                allowed_tiers: vec![Tier::Premium, Tier::Enterprise],
                quality: ResponseQuality::CachedOnly,
                cache_only: true,
            },
        }
    }

    pub fn allows(&self, tier: Tier, operation: OperationType) -> bool {
        self.allowed_tiers.contains(&tier) && self.allowed_operations.contains(&operation)
    }
}

/// Degradation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub rules: Vec<DegradationRule>,
    pub policies: BTreeMap<DegradationLevel, LevelPolicy>,

    /// Consecutive calmer samples required before stepping down one level
    pub recovery_samples: u32,

    /// Error rate and latency are ignored below this many window samples
    pub min_samples: usize,

    /// Length of the primary-outcome window feeding samples
    #[serde(with = "crate::config::duration_str")]
    pub health_window: Duration,

    /// Transitions kept in history
    pub history_limit: usize,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                DegradationRule {
                    level: DegradationLevel::Emergency,
                    budget_pct: Some(180.0),
                    error_rate: Some(0.75),
                    latency_ms: None,
                },
                DegradationRule {
                    level: DegradationLevel::Minimal,
                    budget_pct: Some(120.0),
                    error_rate: Some(0.5),
                    latency_ms: Some(20_000.0),
                },
                DegradationRule {
                    level: DegradationLevel::Degraded,
                    budget_pct: Some(90.0),
                    error_rate: Some(0.25),
                    latency_ms: Some(8_000.0),
                },
            ],
            policies: DegradationLevel::ALL
                .into_iter()
                .map(|level| (level, LevelPolicy::default_for(level)))
                .collect(),
            recovery_samples: 3,
            min_samples: 5,
            health_window: Duration::from_secs(300),
            history_limit: 100,
        }
    }
}

/// One periodic health reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub budget_pct: f64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub samples: usize,

    /// Set by the budget sweep when the global emergency cap is crossed
    pub emergency: bool,
    pub taken_at: DateTime<Utc>,
}

/// A level change with its cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationTransition {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub reason: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub forced: bool,
}

/// Persisted controller state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationSnapshot {
    pub level: DegradationLevel,
    pub since: DateTime<Utc>,
    pub history: Vec<DegradationTransition>,
}

#[derive(Debug)]
struct ControllerInner {
    level: DegradationLevel,
    since: DateTime<Utc>,
    calm_samples: u32,
    history: VecDeque<DegradationTransition>,
    last_sample: Option<HealthSample>,
}

/// Single authoritative degradation level.
pub struct DegradationController {
    clock: Arc<dyn Clock>,
    alerts: Arc<AlertBook>,
    config: DegradationConfig,
    inner: RwLock<ControllerInner>,
}

impl DegradationController {
    pub fn new(config: DegradationConfig, alerts: Arc<AlertBook>, clock: Arc<dyn Clock>) -> Self {
        let since = clock.now();
        Self {
            clock,
            alerts,
            config,
            inner: RwLock::new(ControllerInner {
                level: DegradationLevel::Normal,
                since,
                calm_samples: 0,
                history: VecDeque::new(),
                last_sample: None,
            }),
        }
    }

    pub fn config(&self) -> &DegradationConfig {
        &self.config
    }

    pub fn level(&self) -> DegradationLevel {
        self.inner.read().level
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.inner.read().since
    }

    pub fn last_sample(&self) -> Option<HealthSample> {
        self.inner.read().last_sample.clone()
    }

    /// Policy in effect at `level`.
    pub fn policy(&self, level: DegradationLevel) -> LevelPolicy {
        self.config
            .policies
            .get(&level)
            .cloned()
            .unwrap_or_else(|| LevelPolicy::default_for(level))
    }

    pub fn current_policy(&self) -> LevelPolicy {
        self.policy(self.level())
    }

    /// Reject work the current level no longer serves.
    pub fn admits(&self, tier: Tier, operation: OperationType) -> Result<(), GovernanceError> {
        let level = self.level();
        let policy = self.policy(level);

        if !policy.allowed_tiers.contains(&tier) {
            return Err(GovernanceError::ServiceDegraded {
                level,
                detail: format!("{} tier is not served while {}", tier, level),
            });
        }
        if !policy.allowed_operations.contains(&operation) {
            return Err(GovernanceError::ServiceDegraded {
                level,
                detail: format!("{} is suspended while {}", operation, level),
            });
        }
        Ok(())
    }

    /// The level the rule table asks for, with the matching reason.
    pub fn evaluate(&self, sample: &HealthSample) -> (DegradationLevel, String) {
        if sample.emergency {
            return (
                DegradationLevel::Emergency,
                "global emergency spend cap exceeded".to_string(),
            );
        }

        let mut rules: Vec<&DegradationRule> = self.config.rules.iter().collect();
        rules.sort_by(|a, b| b.level.cmp(&a.level));

        rules
            .into_iter()
            .find_map(|rule| {
                rule.matches(sample, self.config.min_samples)
                    .map(|reason| (rule.level, reason))
            })
            .unwrap_or((DegradationLevel::Normal, "all signals healthy".to_string()))
    }

    /// Feed a health sample. Returns the transition it caused, if any.
    pub fn observe(&self, sample: HealthSample) -> Option<DegradationTransition> {
        let (target, reason) = self.evaluate(&sample);
        let mut inner = self.inner.write();
        inner.last_sample = Some(sample);
        let current = inner.level;

        if target > current {
            inner.calm_samples = 0;
            let next = if target == DegradationLevel::Emergency {
                DegradationLevel::Emergency
            } else {
                current.step_up()
            };
            return Some(self.transition(&mut inner, next, reason, false));
        }

        if target < current {
            inner.calm_samples += 1;
            if inner.calm_samples >= self.config.recovery_samples.max(1) {
                inner.calm_samples = 0;
                let reason = format!(
                    "recovered after {} calm samples: {}",
                    self.config.recovery_samples, reason
                );
                return Some(self.transition(&mut inner, current.step_down(), reason, false));
            }
            return None;
        }

        inner.calm_samples = 0;
        None
    }

    /// Administrative override.
    pub fn force_level(
        &self,
        level: DegradationLevel,
        reason: impl Into<String>,
    ) -> Option<DegradationTransition> {
        let mut inner = self.inner.write();
        if inner.level == level {
            return None;
        }
        inner.calm_samples = 0;
        Some(self.transition(&mut inner, level, reason.into(), true))
    }

    fn transition(
        &self,
        inner: &mut ControllerInner,
        to: DegradationLevel,
        reason: String,
        forced: bool,
    ) -> DegradationTransition {
        let now = self.clock.now();
        let from = inner.level;
        let transition = DegradationTransition {
            from,
            to,
            reason,
            at: now,
            forced,
        };

        if to > from {
            tracing::warn!(from = %from, to = %to, reason = %transition.reason, forced, "Degradation level raised");
        } else {
            tracing::info!(from = %from, to = %to, reason = %transition.reason, forced, "Degradation level lowered");
        }

        inner.level = to;
        inner.since = now;
        inner.history.push_back(transition.clone());
        while inner.history.len() > self.config.history_limit.max(1) {
            inner.history.pop_front();
        }

        self.sync_interventions(from, to, &transition.reason);
        transition
    }

    fn sync_interventions(&self, from: DegradationLevel, to: DegradationLevel, reason: &str) {
        let notifying = |level: DegradationLevel| level >= DegradationLevel::Minimal;

        if to == DegradationLevel::Normal {
            self.alerts
                .resolve_matching(&Scope::Global, InterventionKind::ServiceDegrade);
            self.alerts
                .resolve_matching(&Scope::Global, InterventionKind::Notify);
            return;
        }

        let severity = match to {
            DegradationLevel::Emergency => Severity::Critical,
            DegradationLevel::Minimal => Severity::High,
            _ => Severity::Medium,
        };
        self.alerts.record_intervention(
            Scope::Global,
            InterventionKind::ServiceDegrade,
            severity,
            format!("service degraded to {}: {}", to, reason),
        );

        if notifying(to) {
            self.alerts.record_intervention(
                Scope::Global,
                InterventionKind::Notify,
                severity,
                format!("degradation level {}: {}", to, reason),
            );
        } else if notifying(from) {
            self.alerts
                .resolve_matching(&Scope::Global, InterventionKind::Notify);
        }
    }

    /// Transitions, oldest first.
    pub fn history(&self) -> Vec<DegradationTransition> {
        self.inner.read().history.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> DegradationSnapshot {
        let inner = self.inner.read();
        DegradationSnapshot {
            level: inner.level,
            since: inner.since,
            history: inner.history.iter().cloned().collect(),
        }
    }

    pub fn restore(&self, snapshot: DegradationSnapshot) {
        let mut inner = self.inner.write();
        inner.level = snapshot.level;
        inner.since = snapshot.since;
        inner.calm_samples = 0;
        inner.history = snapshot.history.into_iter().collect();
        tracing::info!(level = %inner.level, "Degradation level restored from snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spendguard_core::{Calendar, ManualClock};

    fn controller() -> (Arc<AlertBook>, DegradationController) {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 4, 2, 15, 0, 0).unwrap());
        let alerts = Arc::new(AlertBook::new(clock.clone(), Calendar::utc()));
        let controller = DegradationController::new(DegradationConfig::default(), alerts.clone(), clock);
        (alerts, controller)
    }

    fn sample(budget_pct: f64, error_rate: f64, samples: usize) -> HealthSample {
        HealthSample {
            budget_pct,
            error_rate,
            average_latency_ms: 0.0,
            samples,
            emergency: false,
            taken_at: Utc.with_ymd_and_hms(2026, 4, 2, 15, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_escalates_one_step_per_sample() {
        let (_, controller) = controller();
        let hot = sample(130.0, 0.0, 0);

        let first = controller.observe(hot.clone()).unwrap();
        assert_eq!(first.to, DegradationLevel::Degraded);
        let second = controller.observe(hot.clone()).unwrap();
        assert_eq!(second.to, DegradationLevel::Minimal);
        assert!(controller.observe(hot).is_none());
    }

    #[test]
    fn test_emergency_trigger_jumps_directly() {
        let (alerts, controller) = controller();
        let transition = controller
            .observe(HealthSample {
                emergency: true,
                ..sample(50.0, 0.0, 0)
            })
            .unwrap();

        assert_eq!(transition.from, DegradationLevel::Normal);
        assert_eq!(transition.to, DegradationLevel::Emergency);

        let kinds: Vec<InterventionKind> = alerts
            .active_interventions(Some(&Scope::Global))
            .iter()
            .map(|i| i.kind)
            .collect();
        assert!(kinds.contains(&InterventionKind::Notify));
        assert!(kinds.contains(&InterventionKind::ServiceDegrade));
    }

    #[test]
    fn test_recovery_requires_calm_samples() {
        let (alerts, controller) = controller();
        controller.observe(sample(95.0, 0.0, 0));
        assert_eq!(controller.level(), DegradationLevel::Degraded);

        let calm = sample(10.0, 0.0, 10);
        assert!(controller.observe(calm.clone()).is_none());
        assert!(controller.observe(calm.clone()).is_none());
        let recovered = controller.observe(calm).unwrap();
        assert_eq!(recovered.to, DegradationLevel::Normal);
        assert!(alerts.active_interventions(None).is_empty());
    }

    #[test]
    fn test_error_rate_needs_minimum_samples() {
        let (_, controller) = controller();
        assert_eq!(controller.evaluate(&sample(0.0, 1.0, 1)).0, DegradationLevel::Normal);
        assert_eq!(controller.evaluate(&sample(0.0, 1.0, 8)).0, DegradationLevel::Emergency);
        assert_eq!(controller.evaluate(&sample(0.0, 0.3, 8)).0, DegradationLevel::Degraded);
    }

    #[test]
    fn test_policies_restrict_tiers_and_operations() {
        let (_, controller) = controller();
        assert!(controller.admits(Tier::Free, OperationType::Analytics).is_ok());

        controller.force_level(DegradationLevel::Minimal, "maintenance");
        assert!(matches!(
            controller.admits(Tier::Free, OperationType::ContentGeneration),
            Err(GovernanceError::ServiceDegraded { .. })
        ));
        assert!(controller
            .admits(Tier::Premium, OperationType::ContentGeneration)
            .is_ok());
        assert!(controller
            .admits(Tier::Premium, OperationType::Analytics)
            .is_err());

        controller.force_level(DegradationLevel::Emergency, "drill");
        assert!(controller.current_policy().cache_only);
        assert!(controller
            .admits(Tier::Free, OperationType::ContentGeneration)
            .is_err());
        assert_eq!(controller.history().len(), 2);
        assert!(controller.history().iter().all(|t| t.forced));
    }

    #[test]
    fn test_stricter_levels_never_widen_admission() {
        for pair in DegradationLevel::ALL.windows(2) {
            let looser = LevelPolicy::default_for(pair[0]);
            let stricter = LevelPolicy::default_for(pair[1]);
            for tier in &stricter.allowed_tiers {
                assert!(looser.allowed_tiers.contains(tier), "{} admits {tier}", pair[1]);
            }
            for operation in &stricter.allowed_operations {
                assert!(
                    looser.allowed_operations.contains(operation),
                    "{} admits {operation}",
                    pair[1]
                );
            }
        }
    }
}
