//! Budget admission decisions, reservations and the global health sweep.
//!
//! Admission runs under a single admission lock: the caller's committed
//! spend is what the ledger holds for today plus every outstanding
//! reservation, so concurrently admitted work can never jointly exceed
//! `daily_budget + max_overage`. Reservations are settled into the ledger
//! when work completes on the primary path and released otherwise.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use spendguard_core::{
    AlertBook, AlertKind, BudgetAlert, CostLedger, GovernanceError, Intervention,
    InterventionKind, LedgerError, OperationType, Scope, Severity, SpendRecord, SpendSummary,
    Suggestion, Tier, TierRegistry,
};

use super::forecast::{forecast, BudgetForecast, MonthPosition};

/// Float tolerance for budget comparisons, so that 0.2 + 0.2 + 0.2 fits 0.6.
const EPS: f64 = 1e-9;

/// System-wide budget thresholds.
///
/// Defaults are illustrative and meant to be configured per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalBudgetConfig {
    /// Nominal global daily spend (USD)
    pub daily_budget: f64,

    /// Global monthly budget (USD), used for forecasting
    pub monthly_budget: f64,

    /// Percent of the global daily budget that raises a warning
    pub warning_pct: f64,

    /// Percent that records a rate-limit intervention
    pub rate_limit_pct: f64,

    /// Percent that triggers global emergency
    pub emergency_pct: f64,

    /// Absolute daily spend that triggers global emergency (USD)
    pub emergency_cap: f64,

    /// Percent of a caller's daily budget that raises a caller warning
    pub caller_warning_pct: f64,

    /// Trailing days averaged by forecasts
    pub forecast_window_days: u32,
}

impl Default for GlobalBudgetConfig {
    fn default() -> Self {
        Self {
            daily_budget: 1.67,
            monthly_budget: 50.0,
            warning_pct: 80.0,
            rate_limit_pct: 100.0,
            emergency_pct: 180.0,
            emergency_cap: 3.00,
            caller_warning_pct: 80.0,
            forecast_window_days: 7,
        }
    }
}

/// Result of a budget check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub allowed: bool,

    /// Admitted beyond the nominal daily budget
    pub overage: bool,
    pub reason: Option<String>,
    pub alert: Option<BudgetAlert>,
    pub intervention: Option<Intervention>,

    /// Set when denied
    pub error: Option<GovernanceError>,
}

impl BudgetDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            overage: false,
            reason: None,
            alert: None,
            intervention: None,
            error: None,
        }
    }

    fn deny(error: GovernanceError) -> Self {
        Self {
            allowed: false,
            overage: false,
            reason: Some(error.to_string()),
            alert: None,
            intervention: None,
            error: Some(error),
        }
    }

    /// Convert into a `Result`, surfacing the denial error.
    pub fn into_result(self) -> Result<Self, GovernanceError> {
        match self.error.clone() {
            Some(err) if !self.allowed => Err(err),
            _ => Ok(self),
        }
    }
}

/// Global budget status as of the last sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalStatus {
    Healthy,
    Warning,
    RateLimited,
    Emergency,
}

/// Outcome of a global health sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalHealth {
    pub status: GlobalStatus,
    pub today_spend: f64,
    pub percentage: f64,
    pub checked_at: DateTime<Utc>,
}

impl GlobalHealth {
    pub fn is_emergency(&self) -> bool {
        self.status == GlobalStatus::Emergency
    }
}

/// Budget limits reported with analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// `None` for the global scope
    pub tier: Option<Tier>,
    pub daily_budget: f64,
    pub monthly_budget: f64,
    pub max_overage: f64,
}

/// Everything a dashboard shows for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAnalytics {
    pub scope: Scope,
    pub spend: SpendSummary,

    /// Admitted but not yet settled
    pub reserved: f64,
    pub limits: BudgetLimits,
    pub forecast: BudgetForecast,
    pub active_alerts: Vec<BudgetAlert>,
    pub active_interventions: Vec<Intervention>,
}

#[derive(Debug, Clone)]
struct Reservation {
    caller_id: String,
    amount: f64,
}

#[derive(Debug, Default)]
struct Reservations {
    by_item: HashMap<Uuid, Reservation>,
}

impl Reservations {
    fn for_caller(&self, caller_id: &str) -> f64 {
        self.by_item
            .values()
            .filter(|r| r.caller_id == caller_id)
            .map(|r| r.amount)
            .sum()
    }

    fn total(&self) -> f64 {
        self.by_item.values().map(|r| r.amount).sum()
    }
}

/// Decides admission against tier and global budgets.
pub struct BudgetGovernor {
    ledger: Arc<CostLedger>,
    tiers: Arc<TierRegistry>,
    alerts: Arc<AlertBook>,
    config: GlobalBudgetConfig,
    admission: Mutex<Reservations>,
    last_health: RwLock<Option<GlobalHealth>>,
}

impl BudgetGovernor {
    pub fn new(
        config: GlobalBudgetConfig,
        ledger: Arc<CostLedger>,
        tiers: Arc<TierRegistry>,
        alerts: Arc<AlertBook>,
    ) -> Self {
        Self {
            ledger,
            tiers,
            alerts,
            config,
            admission: Mutex::new(Reservations::default()),
            last_health: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &GlobalBudgetConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    /// Check whether `caller_id` may spend `estimated_cost` now.
    ///
    /// Outstanding reservations count as spent. Nothing is reserved.
    pub fn can_proceed(&self, caller_id: &str, estimated_cost: f64) -> BudgetDecision {
        let reservations = self.admission.lock();
        self.decide(&reservations, caller_id, estimated_cost)
    }

    /// Check and, if allowed, reserve `estimated_cost` for `item_id`.
    pub fn admit(
        &self,
        item_id: Uuid,
        caller_id: &str,
        estimated_cost: f64,
    ) -> Result<BudgetDecision, GovernanceError> {
        let mut reservations = self.admission.lock();
        let decision = self
            .decide(&reservations, caller_id, estimated_cost)
            .into_result()?;

        reservations.by_item.insert(
            item_id,
            Reservation {
                caller_id: caller_id.to_string(),
                amount: estimated_cost,
            },
        );
        tracing::debug!(item = %item_id, caller = caller_id, amount = estimated_cost, "Budget reserved");
        Ok(decision)
    }

    /// Record the actual cost of completed work and drop its reservation.
    ///
    /// Without a reported cost the reserved estimate is charged. The charge
    /// is capped at what the caller's daily ceiling and monthly budget still
    /// allow once their other reservations are held back; any amount cut
    /// off is reported through a `LimitReached` alert.
    pub fn settle(
        &self,
        item_id: Uuid,
        caller_id: &str,
        operation: OperationType,
        actual_cost: Option<f64>,
        units: u64,
    ) -> Result<SpendRecord, LedgerError> {
        let mut reservations = self.admission.lock();
        let reserved = reservations.by_item.remove(&item_id).map(|r| r.amount);
        let requested = match (actual_cost, reserved) {
            (Some(actual), _) => actual,
            (None, Some(reserved)) => reserved,
            (None, None) => 0.0,
        };

        let scope = Scope::caller(caller_id);
        let limits = self.tiers.limits_for_caller(caller_id).1;
        let summary = self.ledger.summary(&scope);
        let held_back = reservations.for_caller(caller_id);
        let headroom = (limits.daily_ceiling() - summary.today - held_back)
            .min(limits.monthly_budget - summary.this_month - held_back)
            .max(0.0);
        let amount = if requested.is_finite() && requested > headroom + EPS {
            headroom
        } else {
            requested
        };

        let record = match self.ledger.record_spend(caller_id, amount, units, operation) {
            Ok(record) => record,
            Err(err) => {
                // Keep the reservation so the budget stays held.
                if let Some(reserved) = reserved {
                    reservations.by_item.insert(
                        item_id,
                        Reservation {
                            caller_id: caller_id.to_string(),
                            amount: reserved,
                        },
                    );
                }
                return Err(err);
            }
        };
        drop(reservations);

        if amount < requested {
            let dropped = requested - amount;
            tracing::warn!(
                item = %item_id,
                caller = caller_id,
                reserved = reserved.unwrap_or(0.0),
                actual = requested,
                charged = amount,
                "Actual cost exceeded the caller's remaining budget"
            );
            self.alerts.raise_alert(
                scope,
                AlertKind::LimitReached,
                percent(summary.today + amount + dropped, limits.daily_budget),
                format!(
                    "{} reported ${:.2} but only ${:.2} fit under the ${:.2} daily limit; ${:.2} was not charged",
                    caller_id,
                    requested,
                    amount,
                    limits.daily_ceiling(),
                    dropped
                ),
            );
        } else if let Some(reserved) = reserved {
            if amount > reserved + EPS {
                tracing::debug!(item = %item_id, caller = caller_id, reserved, actual = amount, "Actual cost exceeded reserved estimate");
            }
        }

        self.check_caller_warning(caller_id);
        Ok(record)
    }

    /// Drop a reservation without charging. Returns the released amount.
    pub fn release(&self, item_id: Uuid) -> Option<f64> {
        let released = self
            .admission
            .lock()
            .by_item
            .remove(&item_id)
            .map(|r| r.amount);
        if let Some(amount) = released {
            tracing::debug!(item = %item_id, amount, "Budget reservation released");
        }
        released
    }

    pub fn reserved_for(&self, caller_id: &str) -> f64 {
        self.admission.lock().for_caller(caller_id)
    }

    pub fn outstanding_reservations(&self) -> usize {
        self.admission.lock().by_item.len()
    }

    fn decide(&self, reservations: &Reservations, caller_id: &str, cost: f64) -> BudgetDecision {
        if !cost.is_finite() || cost < 0.0 {
            return BudgetDecision::deny(GovernanceError::InvalidRequest(format!(
                "estimated cost must be finite and non-negative, got {}",
                cost
            )));
        }

        let scope = Scope::caller(caller_id);
        let (tier, limits) = self.tiers.limits_for_caller(caller_id);
        let summary = self.ledger.summary(&scope);
        let reserved = reservations.for_caller(caller_id);
        let today = summary.today + reserved;
        let month = summary.this_month + reserved;
        let pct_after = percent(today + cost, limits.daily_budget);

        // Monthly cap
        if month + cost > limits.monthly_budget + EPS {
            let alert = self.alerts.raise_alert(
                scope.clone(),
                AlertKind::Emergency,
                percent(month + cost, limits.monthly_budget),
                format!(
                    "{} monthly budget of ${:.2} exhausted ({} tier)",
                    caller_id, limits.monthly_budget, tier
                ),
            );
            let intervention = self.alerts.record_intervention(
                scope.clone(),
                InterventionKind::CircuitBreak,
                Severity::Critical,
                format!("monthly budget exhausted for {}", caller_id),
            );
            return BudgetDecision {
                alert: Some(alert),
                intervention: Some(intervention),
                ..BudgetDecision::deny(GovernanceError::BudgetExceeded {
                    scope,
                    detail: format!("monthly budget of ${:.2} exhausted", limits.monthly_budget),
                    remaining: (limits.monthly_budget - month).max(0.0),
                    suggestion: Suggestion::UpgradeTier,
                })
            };
        }

        let daily_remaining = limits.daily_budget - today;
        let mut decision = if cost <= daily_remaining + EPS {
            BudgetDecision::allow()
        } else if limits.allows_overage() && today + cost <= limits.daily_ceiling() + EPS {
            BudgetDecision {
                overage: true,
                ..BudgetDecision::allow()
            }
        } else {
            let ceiling = limits.daily_ceiling();
            let alert = self.alerts.raise_alert(
                scope.clone(),
                AlertKind::LimitReached,
                pct_after,
                format!(
                    "{} reached the daily limit of ${:.2}",
                    caller_id, ceiling
                ),
            );
            let intervention = if today + EPS < ceiling {
                self.alerts.record_intervention(
                    scope.clone(),
                    InterventionKind::RateLimit,
                    Severity::Medium,
                    format!("{} is close to the daily limit", caller_id),
                )
            } else {
                self.alerts.record_intervention(
                    scope.clone(),
                    InterventionKind::CircuitBreak,
                    Severity::High,
                    format!("{} exhausted the daily limit including overage", caller_id),
                )
            };
            return BudgetDecision {
                alert: Some(alert),
                intervention: Some(intervention),
                ..BudgetDecision::deny(GovernanceError::BudgetExceeded {
                    scope,
                    detail: format!(
                        "daily budget of ${:.2} (plus ${:.2} overage) exhausted",
                        limits.daily_budget, limits.max_overage
                    ),
                    remaining: (ceiling - today).max(0.0),
                    suggestion: Suggestion::WaitForReset,
                })
            };
        };

        // Global emergency cap
        let global_today = self.ledger.today_spend(&Scope::Global) + reservations.total();
        if global_today + cost > self.config.emergency_cap + EPS {
            return BudgetDecision::deny(GovernanceError::BudgetExceeded {
                scope: Scope::Global,
                detail: format!(
                    "global emergency cap of ${:.2} reached",
                    self.config.emergency_cap
                ),
                remaining: (self.config.emergency_cap - global_today).max(0.0),
                suggestion: Suggestion::UseCachedResult,
            });
        }

        // Only admitted overage is alerted.
        if decision.overage {
            decision.alert = Some(self.alerts.raise_alert(
                scope,
                AlertKind::Overage,
                pct_after,
                format!(
                    "{} is using overage: ${:.2} of ${:.2} daily budget plus ${:.2} overage",
                    caller_id,
                    today + cost,
                    limits.daily_budget,
                    limits.max_overage
                ),
            ));
        }

        decision
    }

    fn check_caller_warning(&self, caller_id: &str) {
        let limits = self.tiers.limits_for_caller(caller_id).1;
        let today = self.ledger.today_spend(&Scope::caller(caller_id));
        let pct = percent(today, limits.daily_budget);
        if pct >= self.config.caller_warning_pct {
            self.alerts.raise_alert(
                Scope::caller(caller_id),
                AlertKind::Warning,
                pct,
                format!(
                    "{} has used {:.0}% of the ${:.2} daily budget",
                    caller_id, pct, limits.daily_budget
                ),
            );
        }
    }

    /// Recompute global spend against the global thresholds.
    pub fn health_check(&self) -> GlobalHealth {
        let today = self.ledger.today_spend(&Scope::Global);
        let pct = percent(today, self.config.daily_budget);

        let status = if today >= self.config.emergency_cap || pct >= self.config.emergency_pct {
            GlobalStatus::Emergency
        } else if pct >= self.config.rate_limit_pct {
            GlobalStatus::RateLimited
        } else if pct >= self.config.warning_pct {
            GlobalStatus::Warning
        } else {
            GlobalStatus::Healthy
        };

        match status {
            GlobalStatus::Emergency => {
                self.alerts.raise_alert(
                    Scope::Global,
                    AlertKind::Emergency,
                    pct,
                    format!(
                        "global spend ${:.2} crossed the emergency threshold (cap ${:.2})",
                        today, self.config.emergency_cap
                    ),
                );
                self.alerts.record_intervention(
                    Scope::Global,
                    InterventionKind::CircuitBreak,
                    Severity::Critical,
                    format!("global spend ${:.2} at {:.0}% of daily budget", today, pct),
                );
            }
            GlobalStatus::RateLimited => {
                self.alerts.raise_alert(
                    Scope::Global,
                    AlertKind::LimitReached,
                    pct,
                    format!(
                        "global spend ${:.2} reached the ${:.2} daily budget",
                        today, self.config.daily_budget
                    ),
                );
                self.alerts.record_intervention(
                    Scope::Global,
                    InterventionKind::RateLimit,
                    Severity::High,
                    format!("global spend at {:.0}% of daily budget", pct),
                );
            }
            GlobalStatus::Warning => {
                self.alerts.raise_alert(
                    Scope::Global,
                    AlertKind::Warning,
                    pct,
                    format!("global spend at {:.0}% of daily budget", pct),
                );
            }
            GlobalStatus::Healthy => {}
        }

        if status < GlobalStatus::Emergency {
            self.alerts
                .resolve_matching(&Scope::Global, InterventionKind::CircuitBreak);
        }
        if status < GlobalStatus::RateLimited {
            self.alerts
                .resolve_matching(&Scope::Global, InterventionKind::RateLimit);
        }

        let health = GlobalHealth {
            status,
            today_spend: today,
            percentage: pct,
            checked_at: self.ledger.now(),
        };

        let previous = self.last_health.write().replace(health.clone());
        if previous.map(|p| p.status) != Some(status) {
            tracing::info!(status = ?status, today, percentage = pct, "Global budget status changed");
        }
        health
    }

    pub fn last_health(&self) -> Option<GlobalHealth> {
        self.last_health.read().clone()
    }

    /// Forecast for a caller or the whole system.
    pub fn forecast(&self, scope: &Scope) -> BudgetForecast {
        let now = self.ledger.now();
        let calendar = self.ledger.calendar();
        let history = self
            .ledger
            .history(scope, self.config.forecast_window_days.max(1));
        let monthly_budget = self.limits_for(scope).monthly_budget;

        forecast(
            &history,
            MonthPosition {
                month_to_date: self.ledger.month_spend(scope),
                days_elapsed: calendar.days_elapsed_in_month(now),
                days_in_month: calendar.days_in_month(now),
            },
            monthly_budget,
        )
    }

    pub fn limits_for(&self, scope: &Scope) -> BudgetLimits {
        match scope {
            Scope::Global => BudgetLimits {
                tier: None,
                daily_budget: self.config.daily_budget,
                monthly_budget: self.config.monthly_budget,
                max_overage: 0.0,
            },
            Scope::Caller(caller_id) => {
                let (tier, limits) = self.tiers.limits_for_caller(caller_id);
                BudgetLimits {
                    tier: Some(tier),
                    daily_budget: limits.daily_budget,
                    monthly_budget: limits.monthly_budget,
                    max_overage: limits.max_overage,
                }
            }
        }
    }

    pub fn analytics(&self, scope: &Scope) -> BudgetAnalytics {
        let reserved = {
            let reservations = self.admission.lock();
            match scope {
                Scope::Global => reservations.total(),
                Scope::Caller(caller_id) => reservations.for_caller(caller_id),
            }
        };

        BudgetAnalytics {
            scope: scope.clone(),
            spend: self.ledger.summary(scope),
            reserved,
            limits: self.limits_for(scope),
            forecast: self.forecast(scope),
            active_alerts: self.alerts.active_alerts(Some(scope)),
            active_interventions: self.alerts.active_interventions(Some(scope)),
        }
    }
}

fn percent(amount: f64, budget: f64) -> f64 {
    if budget <= 0.0 {
        if amount > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        amount / budget * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use spendguard_core::{Calendar, ManualClock, TierLimits};

    struct Fixture {
        alerts: Arc<AlertBook>,
        ledger: Arc<CostLedger>,
        tiers: Arc<TierRegistry>,
        governor: BudgetGovernor,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
        let ledger = Arc::new(CostLedger::new(clock.clone(), Calendar::utc()));
        let alerts = Arc::new(AlertBook::new(clock, Calendar::utc()));
        let tiers = Arc::new(TierRegistry::default());
        let governor = BudgetGovernor::new(
            GlobalBudgetConfig {
                emergency_cap: 100.0,
                daily_budget: 50.0,
                ..Default::default()
            },
            ledger.clone(),
            tiers.clone(),
            alerts.clone(),
        );
        Fixture {
            alerts,
            ledger,
            tiers,
            governor,
        }
    }

    fn run(f: &Fixture, caller: &str, cost: f64) -> Result<BudgetDecision, GovernanceError> {
        let id = Uuid::new_v4();
        let decision = f.governor.admit(id, caller, cost)?;
        f.governor
            .settle(id, caller, OperationType::ContentGeneration, None, 100)
            .unwrap();
        Ok(decision)
    }

    #[test]
    fn test_free_tier_overage_sequence() {
        let f = fixture();

        assert!(!run(&f, "alice", 0.20).unwrap().overage);
        assert!(!run(&f, "alice", 0.20).unwrap().overage);

        let third = run(&f, "alice", 0.20).unwrap();
        assert!(third.overage);
        assert_eq!(third.alert.unwrap().kind, AlertKind::Overage);

        let fourth = run(&f, "alice", 0.20).unwrap_err();
        assert!(matches!(
            fourth,
            GovernanceError::BudgetExceeded {
                suggestion: Suggestion::WaitForReset,
                ..
            }
        ));
        assert!((f.ledger.today_spend(&Scope::caller("alice")) - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_reservations_count_as_spent() {
        let f = fixture();
        for _ in 0..3 {
            f.governor.admit(Uuid::new_v4(), "alice", 0.20).unwrap();
        }
        assert!(f.governor.admit(Uuid::new_v4(), "alice", 0.20).is_err());
        assert!((f.governor.reserved_for("alice") - 0.60).abs() < 1e-9);
        assert_eq!(f.ledger.record_count(), 0);
    }

    #[test]
    fn test_release_frees_budget() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.governor.admit(id, "alice", 0.60).unwrap();
        assert!(!f.governor.can_proceed("alice", 0.10).allowed);

        assert_eq!(f.governor.release(id), Some(0.60));
        assert!(f.governor.can_proceed("alice", 0.10).allowed);
        assert_eq!(f.governor.release(id), None);
    }

    #[test]
    fn test_monthly_cap_suggests_upgrade() {
        let f = fixture();
        f.tiers.override_limits(
            Tier::Free,
            TierLimits {
                daily_budget: 5.0,
                monthly_budget: 1.0,
                max_overage: 0.0,
                max_concurrency: 2,
                requests_per_window: 10,
            },
        );
        f.ledger
            .record_spend("alice", 0.95, 0, OperationType::ContentGeneration)
            .unwrap();

        let decision = f.governor.can_proceed("alice", 0.10);
        assert!(!decision.allowed);
        assert_eq!(decision.intervention.unwrap().kind, InterventionKind::CircuitBreak);
        assert!(matches!(
            decision.error,
            Some(GovernanceError::BudgetExceeded {
                suggestion: Suggestion::UpgradeTier,
                ..
            })
        ));
    }

    #[test]
    fn test_caller_warning_after_settle() {
        let f = fixture();
        run(&f, "alice", 0.41).unwrap();
        let warnings: Vec<_> = f
            .alerts
            .active_alerts(Some(&Scope::caller("alice")))
            .into_iter()
            .filter(|a| a.kind == AlertKind::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_invalid_cost_rejected() {
        let f = fixture();
        assert!(matches!(
            f.governor.admit(Uuid::new_v4(), "alice", -0.1),
            Err(GovernanceError::InvalidRequest(_))
        ));
        assert!(!f.governor.can_proceed("alice", f64::NAN).allowed);
    }

    #[test]
    fn test_settle_caps_cost_above_estimate_at_ceiling() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.governor.admit(id, "alice", 0.20).unwrap();

        let record = f
            .governor
            .settle(id, "alice", OperationType::ContentGeneration, Some(0.70), 1)
            .unwrap();
        assert!((record.amount - 0.60).abs() < 1e-9);
        assert!((f.ledger.today_spend(&Scope::caller("alice")) - 0.60).abs() < 1e-9);

        let limit_alert = f
            .alerts
            .active_alerts(Some(&Scope::caller("alice")))
            .into_iter()
            .find(|a| a.kind == AlertKind::LimitReached)
            .unwrap();
        assert!(limit_alert.message.contains("$0.10 was not charged"));
    }

    #[test]
    fn test_settle_overrun_leaves_room_for_other_reservations() {
        let f = fixture();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        f.governor.admit(first, "alice", 0.20).unwrap();
        f.governor.admit(second, "alice", 0.30).unwrap();

        let record = f
            .governor
            .settle(first, "alice", OperationType::ContentGeneration, Some(0.50), 1)
            .unwrap();
        assert!((record.amount - 0.30).abs() < 1e-9);

        f.governor
            .settle(second, "alice", OperationType::ContentGeneration, None, 1)
            .unwrap();
        assert!((f.ledger.today_spend(&Scope::caller("alice")) - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_cheaper_actual_cost_is_charged_as_reported() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.governor.admit(id, "alice", 0.20).unwrap();
        let record = f
            .governor
            .settle(id, "alice", OperationType::ContentGeneration, Some(0.05), 1)
            .unwrap();
        assert!((record.amount - 0.05).abs() < 1e-9);
        assert!(f
            .alerts
            .active_alerts(Some(&Scope::caller("alice")))
            .iter()
            .all(|a| a.kind != AlertKind::LimitReached));
    }

    #[test]
    fn test_global_cap_denial_raises_no_overage_alert() {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
        let ledger = Arc::new(CostLedger::new(clock.clone(), Calendar::utc()));
        let alerts = Arc::new(AlertBook::new(clock, Calendar::utc()));
        let governor = BudgetGovernor::new(
            GlobalBudgetConfig::default(),
            ledger.clone(),
            Arc::new(TierRegistry::default()),
            alerts.clone(),
        );
        ledger.record_spend("alice", 0.45, 0, OperationType::ContentGeneration).unwrap();
        ledger.record_spend("bulk", 2.50, 0, OperationType::Analytics).unwrap();

        // 0.55 would be overage for alice, but 3.05 crosses the global cap.
        let err = governor.admit(Uuid::new_v4(), "alice", 0.10).unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::BudgetExceeded {
                scope: Scope::Global,
                suggestion: Suggestion::UseCachedResult,
                ..
            }
        ));
        assert!(alerts
            .alerts()
            .iter()
            .all(|a| a.kind != AlertKind::Overage));
        assert_eq!(governor.outstanding_reservations(), 0);
    }

    #[test]
    fn test_health_check_thresholds() {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
        let ledger = Arc::new(CostLedger::new(clock.clone(), Calendar::utc()));
        let alerts = Arc::new(AlertBook::new(clock, Calendar::utc()));
        let governor = BudgetGovernor::new(
            GlobalBudgetConfig::default(),
            ledger.clone(),
            Arc::new(TierRegistry::default()),
            alerts.clone(),
        );

        assert_eq!(governor.health_check().status, GlobalStatus::Healthy);

        ledger.record_spend("a", 1.40, 0, OperationType::Analytics).unwrap();
        assert_eq!(governor.health_check().status, GlobalStatus::Warning);

        ledger.record_spend("b", 0.30, 0, OperationType::Analytics).unwrap();
        assert_eq!(governor.health_check().status, GlobalStatus::RateLimited);

        ledger.record_spend("c", 1.31, 0, OperationType::Analytics).unwrap();
        let health = governor.health_check();
        assert!(health.is_emergency());
        assert!(alerts
            .active_interventions(Some(&Scope::Global))
            .iter()
            .any(|i| i.kind == InterventionKind::CircuitBreak && i.severity == Severity::Critical));
    }

    #[test]
    fn test_analytics_reports_forecast() {
        let f = fixture();
        run(&f, "alice", 0.30).unwrap();
        let analytics = f.governor.analytics(&Scope::caller("alice"));
        assert_eq!(analytics.limits.tier, Some(Tier::Free));
        assert!((analytics.spend.today - 0.30).abs() < 1e-9);
        assert_eq!(analytics.forecast.window_days, 7);
        assert_eq!(analytics.reserved, 0.0);
    }

    proptest! {
        #[test]
        fn prop_admitted_spend_never_exceeds_ceiling(costs in proptest::collection::vec(0.0f64..0.35, 1..30)) {
            let f = fixture();
            for cost in costs {
                let _ = run(&f, "alice", cost);
            }
            let limits = f.tiers.get_limits(Tier::Free);
            let today = f.ledger.today_spend(&Scope::caller("alice"));
            prop_assert!(today <= limits.daily_ceiling() + 1e-6);
        }

        #[test]
        fn prop_reported_costs_never_exceed_ceiling(
            calls in proptest::collection::vec((0.0f64..0.35, 0.0f64..1.0), 1..30),
            settle_early in any::<bool>(),
        ) {
            let f = fixture();
            let mut admitted = Vec::new();
            for (estimate, actual) in calls {
                let id = Uuid::new_v4();
                if f.governor.admit(id, "alice", estimate).is_ok() {
                    if settle_early {
                        f.governor
                            .settle(id, "alice", OperationType::ContentGeneration, Some(actual), 1)
                            .unwrap();
                    } else {
                        admitted.push((id, actual));
                    }
                }
            }
            for (id, actual) in admitted {
                f.governor
                    .settle(id, "alice", OperationType::ContentGeneration, Some(actual), 1)
                    .unwrap();
            }
            let limits = f.tiers.get_limits(Tier::Free);
            let today = f.ledger.today_spend(&Scope::caller("alice"));
            prop_assert!(today <= limits.daily_ceiling() + 1e-6);
            prop_assert_eq!(f.governor.outstanding_reservations(), 0);
        }
    }
}
