//! Time sources.
//!
//! Every component reads time through [`Clock`] so tests can drive it with
//! [`ManualClock`] instead of sleeping.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Source of the current instant.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Convenience constructor returning a shareable handle.
    pub fn shared(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self::new(start))
    }

    pub fn advance(&self, by: std::time::Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        *self.now.write() += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Maps instants onto the operator's local calendar.
///
/// Daily and monthly rollups key on calendar dates in this offset, so a
/// restart never resets a day in progress.
#[derive(Debug, Clone, Copy)]
pub struct Calendar {
    offset: FixedOffset,
}

impl Calendar {
    /// Calendar at the given offset from UTC, clamped to ±23:59.
    pub fn with_offset_minutes(minutes: i32) -> Self {
        let seconds = minutes.clamp(-1439, 1439) * 60;
        let offset = FixedOffset::east_opt(seconds).unwrap_or_else(utc_offset);
        Self { offset }
    }

    pub fn utc() -> Self {
        Self {
            offset: utc_offset(),
        }
    }

    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    /// `(year, month)` of an instant in local time.
    pub fn month_of(&self, instant: DateTime<Utc>) -> (i32, u32) {
        let date = self.date_of(instant);
        (date.year(), date.month())
    }

    /// Day of month of `instant`, starting at 1.
    pub fn days_elapsed_in_month(&self, instant: DateTime<Utc>) -> u32 {
        self.date_of(instant).day()
    }

    pub fn days_in_month(&self, instant: DateTime<Utc>) -> u32 {
        let date = self.date_of(instant);
        days_in_month(date.year(), date.month())
    }
}

impl Default for Calendar {
    fn default() -> Self {
        Self::utc()
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// Number of days in a month of the proleptic Gregorian calendar.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(start), Some(end)) => (end - start).num_days() as u32,
        _ => 30,
    }
}
