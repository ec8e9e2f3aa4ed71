//! Budget alerts and interventions.
//!
//! Both lists are append-only. Alerts leave the active set only when a
//! caller acknowledges them; interventions only when resolved. Repeated
//! raises of the same alert within one local day return the existing entry
//! instead of appending a duplicate.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::{Calendar, Clock};
use crate::types::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Warning,
    LimitReached,
    Overage,
    Emergency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub id: Uuid,
    pub scope: Scope,
    pub kind: AlertKind,
    pub percentage_of_budget: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    RateLimit,
    ServiceDegrade,
    CircuitBreak,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub id: Uuid,
    pub scope: Scope,
    pub kind: InterventionKind,
    pub severity: Severity,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertBookSnapshot {
    pub alerts: Vec<BudgetAlert>,
    pub interventions: Vec<Intervention>,
}

#[derive(Debug, Default)]
struct AlertBookInner {
    alerts: Vec<BudgetAlert>,
    interventions: Vec<Intervention>,
    raised_today: HashSet<(Scope, AlertKind, NaiveDate)>,
}

/// Shared store of alerts and interventions.
#[derive(Debug)]
pub struct AlertBook {
    clock: Arc<dyn Clock>,
    calendar: Calendar,
    inner: Mutex<AlertBookInner>,
}

impl AlertBook {
    pub fn new(clock: Arc<dyn Clock>, calendar: Calendar) -> Self {
        Self {
            clock,
            calendar,
            inner: Mutex::new(AlertBookInner::default()),
        }
    }

    /// Raise an alert, or return today's existing alert of the same kind.
    pub fn raise_alert(
        &self,
        scope: Scope,
        kind: AlertKind,
        percentage_of_budget: f64,
        message: impl Into<String>,
    ) -> BudgetAlert {
        let now = self.clock.now();
        let key = (scope.clone(), kind, self.calendar.date_of(now));
        let mut inner = self.inner.lock();

        if inner.raised_today.contains(&key) {
            if let Some(existing) = inner
                .alerts
                .iter()
                .rev()
                .find(|a| a.scope == scope && a.kind == kind)
            {
                return existing.clone();
            }
        }

        let alert = BudgetAlert {
            id: Uuid::new_v4(),
            scope,
            kind,
            percentage_of_budget,
            message: message.into(),
            timestamp: now,
            acknowledged: false,
        };
        tracing::warn!(
            scope = %alert.scope,
            kind = ?alert.kind,
            percentage = alert.percentage_of_budget,
            message = %alert.message,
            "Budget alert raised"
        );

        inner.raised_today.insert(key);
        inner.alerts.push(alert.clone());
        alert
    }

    /// Record an intervention unless an unresolved one of the same kind is
    /// already active for the scope, in which case that one is returned.
    pub fn record_intervention(
        &self,
        scope: Scope,
        kind: InterventionKind,
        severity: Severity,
        reason: impl Into<String>,
    ) -> Intervention {
        let mut inner = self.inner.lock();

        if let Some(active) = inner
            .interventions
            .iter()
            .find(|i| !i.resolved && i.scope == scope && i.kind == kind)
        {
            return active.clone();
        }

        let intervention = Intervention {
            id: Uuid::new_v4(),
            scope,
            kind,
            severity,
            reason: reason.into(),
            timestamp: self.clock.now(),
            resolved: false,
            resolved_at: None,
        };
        tracing::warn!(
            scope = %intervention.scope,
            kind = ?intervention.kind,
            severity = ?intervention.severity,
            reason = %intervention.reason,
            "Intervention recorded"
        );

        inner.interventions.push(intervention.clone());
        intervention
    }

    /// Mark an alert acknowledged. Returns false for unknown ids.
    pub fn acknowledge(&self, alert_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        match inner.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Resolve an intervention. Returns false for unknown or resolved ids.
    pub fn resolve(&self, intervention_id: Uuid) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner
            .interventions
            .iter_mut()
            .find(|i| i.id == intervention_id && !i.resolved)
        {
            Some(intervention) => {
                intervention.resolved = true;
                intervention.resolved_at = Some(now);
                tracing::info!(id = %intervention_id, kind = ?intervention.kind, "Intervention resolved");
                true
            }
            None => false,
        }
    }

    /// Resolve every active intervention of `kind` for `scope`.
    pub fn resolve_matching(&self, scope: &Scope, kind: InterventionKind) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut resolved = 0;
        for intervention in inner
            .interventions
            .iter_mut()
            .filter(|i| !i.resolved && &i.scope == scope && i.kind == kind)
        {
            intervention.resolved = true;
            intervention.resolved_at = Some(now);
            resolved += 1;
        }
        resolved
    }

    /// Unacknowledged alerts, optionally filtered by scope.
    pub fn active_alerts(&self, scope: Option<&Scope>) -> Vec<BudgetAlert> {
        self.inner
            .lock()
            .alerts
            .iter()
            .filter(|a| !a.acknowledged && scope.map_or(true, |s| &a.scope == s))
            .cloned()
            .collect()
    }

    /// Unresolved interventions, optionally filtered by scope.
    pub fn active_interventions(&self, scope: Option<&Scope>) -> Vec<Intervention> {
        self.inner
            .lock()
            .interventions
            .iter()
            .filter(|i| !i.resolved && scope.map_or(true, |s| &i.scope == s))
            .cloned()
            .collect()
    }

    pub fn alerts(&self) -> Vec<BudgetAlert> {
        self.inner.lock().alerts.clone()
    }

    pub fn interventions(&self) -> Vec<Intervention> {
        self.inner.lock().interventions.clone()
    }

    /// Drop dedup keys from days before today. Returns the number removed.
    pub fn prune_dedup_index(&self) -> usize {
        let today = self.calendar.date_of(self.clock.now());
        let mut inner = self.inner.lock();
        let before = inner.raised_today.len();
        inner.raised_today.retain(|(_, _, date)| *date >= today);
        before - inner.raised_today.len()
    }

    pub fn snapshot(&self) -> AlertBookSnapshot {
        let inner = self.inner.lock();
        AlertBookSnapshot {
            alerts: inner.alerts.clone(),
            interventions: inner.interventions.clone(),
        }
    }

    pub fn restore(&self, snapshot: AlertBookSnapshot) {
        let today = self.calendar.date_of(self.clock.now());
        let raised_today = snapshot
            .alerts
            .iter()
            .map(|a| (a.scope.clone(), a.kind, self.calendar.date_of(a.timestamp)))
            .filter(|(_, _, date)| *date >= today)
            .collect();

        let mut inner = self.inner.lock();
        inner.alerts = snapshot.alerts;
        inner.interventions = snapshot.interventions;
        inner.raised_today = raised_today;
    }
}
