//! Append-only spend ledger with calendar rollups.
//!
//! Every recorded spend updates the caller's rollup and the global rollup
//! in the same critical section. Rollups are keyed by local calendar date,
//! so day and month boundaries fall out of the keys themselves and a
//! reloaded snapshot continues the running totals.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::clock::{Calendar, Clock};
use crate::types::{OperationType, Scope};

/// Errors from the ledger.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Spend amount must be finite and non-negative, got {0}")]
    InvalidAmount(f64),

    #[error("Snapshot version {found} is not supported (expected {expected})")]
    UnsupportedSnapshot { found: u32, expected: u32 },
}

/// One immutable spend entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendRecord {
    pub caller_id: String,
    pub amount: f64,
    pub units: u64,
    pub operation: OperationType,
    pub timestamp: DateTime<Utc>,
}

/// Spend totals for one scope at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendSummary {
    pub today: f64,
    pub this_month: f64,
    pub all_time: f64,
    pub requests_today: u64,
}

/// Total spend on one local calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTotal {
    pub date: NaiveDate,
    pub amount: f64,
    pub units: u64,
    pub requests: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyTotal {
    pub year: i32,
    pub month: u32,
    pub amount: f64,
}

#[derive(Debug, Clone, Default)]
struct DayBucket {
    amount: f64,
    units: u64,
    requests: u64,
}

#[derive(Debug, Clone, Default)]
struct Rollup {
    daily: BTreeMap<NaiveDate, DayBucket>,
    monthly: BTreeMap<(i32, u32), f64>,
    all_time: f64,
}

impl Rollup {
    fn add(&mut self, date: NaiveDate, month: (i32, u32), amount: f64, units: u64) {
        let bucket = self.daily.entry(date).or_default();
        bucket.amount += amount;
        bucket.units += units;
        bucket.requests += 1;
        *self.monthly.entry(month).or_insert(0.0) += amount;
        self.all_time += amount;
    }
}

/// Rollups for one scope as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupSnapshot {
    pub scope: Scope,
    pub daily: Vec<DailyTotal>,
    pub monthly: Vec<MonthlyTotal>,
    pub all_time: f64,
}

/// Persisted ledger state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u32,
    pub records: Vec<SpendRecord>,
    pub rollups: Vec<RollupSnapshot>,
}

pub const LEDGER_SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default)]
struct LedgerInner {
    records: Vec<SpendRecord>,
    rollups: HashMap<Scope, Rollup>,
}

/// Record of money spent per caller and globally.
#[derive(Debug)]
pub struct CostLedger {
    clock: Arc<dyn Clock>,
    calendar: Calendar,
    inner: Mutex<LedgerInner>,
}

impl CostLedger {
    pub fn new(clock: Arc<dyn Clock>, calendar: Calendar) -> Self {
        Self {
            clock,
            calendar,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    pub fn calendar(&self) -> Calendar {
        self.calendar
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Append a spend record and update caller and global rollups.
    pub fn record_spend(
        &self,
        caller_id: &str,
        amount: f64,
        units: u64,
        operation: OperationType,
    ) -> Result<SpendRecord, LedgerError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let timestamp = self.clock.now();
        let date = self.calendar.date_of(timestamp);
        let month = self.calendar.month_of(timestamp);

        let record = SpendRecord {
            caller_id: caller_id.to_string(),
            amount,
            units,
            operation,
            timestamp,
        };

        let mut inner = self.inner.lock();
        inner
            .rollups
            .entry(Scope::caller(caller_id))
            .or_default()
            .add(date, month, amount, units);
        inner
            .rollups
            .entry(Scope::Global)
            .or_default()
            .add(date, month, amount, units);
        inner.records.push(record.clone());

        tracing::debug!(
            caller = caller_id,
            amount,
            units,
            operation = %operation,
            "Spend recorded"
        );

        Ok(record)
    }

    /// Today's and this month's spend for a scope.
    pub fn summary(&self, scope: &Scope) -> SpendSummary {
        let now = self.clock.now();
        let date = self.calendar.date_of(now);
        let month = self.calendar.month_of(now);

        let inner = self.inner.lock();
        match inner.rollups.get(scope) {
            Some(rollup) => {
                let day = rollup.daily.get(&date).cloned().unwrap_or_default();
                SpendSummary {
                    today: day.amount,
                    this_month: rollup.monthly.get(&month).copied().unwrap_or(0.0),
                    all_time: rollup.all_time,
                    requests_today: day.requests,
                }
            }
            None => SpendSummary::default(),
        }
    }

    pub fn today_spend(&self, scope: &Scope) -> f64 {
        self.summary(scope).today
    }

    pub fn month_spend(&self, scope: &Scope) -> f64 {
        self.summary(scope).this_month
    }

    /// Daily totals for the last `days` local days, oldest first, ending today.
    ///
    /// Days without spend are reported as zero.
    pub fn history(&self, scope: &Scope, days: u32) -> Vec<DailyTotal> {
        let today = self.calendar.date_of(self.clock.now());
        let inner = self.inner.lock();
        let rollup = inner.rollups.get(scope);

        (0..days)
            .rev()
            .filter_map(|back| today.checked_sub_days(chrono::Days::new(u64::from(back))))
            .map(|date| {
                let bucket = rollup
                    .and_then(|r| r.daily.get(&date))
                    .cloned()
                    .unwrap_or_default();
                DailyTotal {
                    date,
                    amount: bucket.amount,
                    units: bucket.units,
                    requests: bucket.requests,
                }
            })
            .collect()
    }

    /// Records for a caller, in insertion order.
    pub fn records_for(&self, caller_id: &str) -> Vec<SpendRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| r.caller_id == caller_id)
            .cloned()
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.inner.lock();
        let mut rollups: Vec<RollupSnapshot> = inner
            .rollups
            .iter()
            .map(|(scope, rollup)| RollupSnapshot {
                scope: scope.clone(),
                daily: rollup
                    .daily
                    .iter()
                    .map(|(date, bucket)| DailyTotal {
                        date: *date,
                        amount: bucket.amount,
                        units: bucket.units,
                        requests: bucket.requests,
                    })
                    .collect(),
                monthly: rollup
                    .monthly
                    .iter()
                    .map(|((year, month), amount)| MonthlyTotal {
                        year: *year,
                        month: *month,
                        amount: *amount,
                    })
                    .collect(),
                all_time: rollup.all_time,
            })
            .collect();
        rollups.sort_by(|a, b| a.scope.cmp(&b.scope));

        LedgerSnapshot {
            version: LEDGER_SNAPSHOT_VERSION,
            records: inner.records.clone(),
            rollups,
        }
    }

    /// Replace ledger contents with a persisted snapshot.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> Result<(), LedgerError> {
        if snapshot.version != LEDGER_SNAPSHOT_VERSION {
            return Err(LedgerError::UnsupportedSnapshot {
                found: snapshot.version,
                expected: LEDGER_SNAPSHOT_VERSION,
            });
        }

        let rollups = snapshot
            .rollups
            .into_iter()
            .map(|r| {
                let rollup = Rollup {
                    daily: r
                        .daily
                        .into_iter()
                        .map(|d| {
                            (
                                d.date,
                                DayBucket {
                                    amount: d.amount,
                                    units: d.units,
                                    requests: d.requests,
                                },
                            )
                        })
                        .collect(),
                    monthly: r
                        .monthly
                        .into_iter()
                        .map(|m| ((m.year, m.month), m.amount))
                        .collect(),
                    all_time: r.all_time,
                };
                (r.scope, rollup)
            })
            .collect();

        let mut inner = self.inner.lock();
        inner.records = snapshot.records;
        inner.rollups = rollups;

        tracing::info!(records = inner.records.len(), "Ledger restored from snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::time::Duration;

    fn ledger_at(start: DateTime<Utc>) -> (Arc<ManualClock>, CostLedger) {
        let clock = ManualClock::shared(start);
        let ledger = CostLedger::new(clock.clone(), Calendar::utc());
        (clock, ledger)
    }

    #[test]
    fn test_record_updates_caller_and_global() {
        let (_, ledger) = ledger_at(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());

        ledger
            .record_spend("alice", 0.20, 100, OperationType::ContentGeneration)
            .unwrap();
        ledger
            .record_spend("bob", 0.30, 150, OperationType::Analytics)
            .unwrap();

        let alice = ledger.summary(&Scope::caller("alice"));
        assert!((alice.today - 0.20).abs() < 1e-9);
        assert_eq!(alice.requests_today, 1);

        let global = ledger.summary(&Scope::Global);
        assert!((global.today - 0.50).abs() < 1e-9);
        assert!((global.this_month - 0.50).abs() < 1e-9);
    }

    #[test]
    fn test_negative_amount_rejected() {
        let (_, ledger) = ledger_at(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
        assert_eq!(
            ledger.record_spend("alice", -1.0, 0, OperationType::Analytics),
            Err(LedgerError::InvalidAmount(-1.0))
        );
        assert!(ledger
            .record_spend("alice", f64::NAN, 0, OperationType::Analytics)
            .is_err());
        assert_eq!(ledger.record_count(), 0);
    }

    #[test]
    fn test_day_rollover_keeps_month() {
        let (clock, ledger) = ledger_at(Utc.with_ymd_and_hms(2026, 3, 10, 23, 30, 0).unwrap());
        ledger
            .record_spend("alice", 1.0, 10, OperationType::ContentGeneration)
            .unwrap();

        clock.advance(Duration::from_secs(3600));
        ledger
            .record_spend("alice", 0.5, 10, OperationType::ContentGeneration)
            .unwrap();

        let summary = ledger.summary(&Scope::caller("alice"));
        assert!((summary.today - 0.5).abs() < 1e-9);
        assert!((summary.this_month - 1.5).abs() < 1e-9);

        let history = ledger.history(&Scope::caller("alice"), 3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].amount, 0.0);
        assert!((history[1].amount - 1.0).abs() < 1e-9);
        assert!((history[2].amount - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_month_rollover_resets_month_total() {
        let (clock, ledger) = ledger_at(Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap());
        ledger
            .record_spend("alice", 2.0, 10, OperationType::ContentGeneration)
            .unwrap();

        clock.set(Utc.with_ymd_and_hms(2026, 4, 1, 0, 5, 0).unwrap());
        let summary = ledger.summary(&Scope::caller("alice"));
        assert_eq!(summary.today, 0.0);
        assert_eq!(summary.this_month, 0.0);
        assert!((summary.all_time - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_restore_keeps_totals() {
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        let (_, ledger) = ledger_at(start);
        ledger
            .record_spend("alice", 0.75, 10, OperationType::ContentGeneration)
            .unwrap();

        let snapshot = ledger.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();

        let (_, restored) = ledger_at(start + chrono::Duration::hours(2));
        restored
            .restore(serde_json::from_str(&json).unwrap())
            .unwrap();

        assert!((restored.today_spend(&Scope::caller("alice")) - 0.75).abs() < 1e-9);
        assert!((restored.today_spend(&Scope::Global) - 0.75).abs() < 1e-9);
        assert_eq!(restored.records_for("alice").len(), 1);
    }

    #[test]
    fn test_restore_rejects_unknown_version() {
        let (_, ledger) = ledger_at(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
        let snapshot = LedgerSnapshot {
            version: 99,
            ..Default::default()
        };
        assert!(matches!(
            ledger.restore(snapshot),
            Err(LedgerError::UnsupportedSnapshot { found: 99, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_global_total_equals_sum_of_records(amounts in proptest::collection::vec(0.0f64..5.0, 1..40)) {
            let (_, ledger) = ledger_at(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
            for (i, amount) in amounts.iter().enumerate() {
                let caller = format!("caller-{}", i % 3);
                ledger.record_spend(&caller, *amount, 1, OperationType::Analytics).unwrap();
            }

            let expected: f64 = amounts.iter().sum();
            let global = ledger.summary(&Scope::Global);
            prop_assert!((global.today - expected).abs() < 1e-6);
            prop_assert!(global.today >= 0.0);
        }
    }
}
