//! Sliding window of primary execution outcomes.
//!
//! Feeds the error rate and average latency into degradation samples.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use spendguard_core::Clock;

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: DateTime<Utc>,
    success: bool,
    latency: Duration,
}

/// Aggregates over the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub samples: usize,

    /// Failures / samples, zero when empty
    pub error_rate: f64,

    /// Mean latency in milliseconds, zero when empty
    pub average_latency_ms: f64,
}

/// Recent primary outcomes within a fixed time window.
pub struct HealthWindow {
    clock: Arc<dyn Clock>,
    window: Duration,
    outcomes: Mutex<VecDeque<Outcome>>,
}

impl HealthWindow {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            window,
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, success: bool, latency: Duration) {
        let now = self.clock.now();
        let mut outcomes = self.outcomes.lock();
        prune(&mut outcomes, now, self.window);
        outcomes.push_back(Outcome {
            at: now,
            success,
            latency,
        });
    }

    pub fn summary(&self) -> HealthSummary {
        let now = self.clock.now();
        let mut outcomes = self.outcomes.lock();
        prune(&mut outcomes, now, self.window);

        if outcomes.is_empty() {
            return HealthSummary::default();
        }

        let samples = outcomes.len();
        let failures = outcomes.iter().filter(|o| !o.success).count();
        let total_ms: f64 = outcomes
            .iter()
            .map(|o| o.latency.as_secs_f64() * 1000.0)
            .sum();

        HealthSummary {
            samples,
            error_rate: failures as f64 / samples as f64,
            average_latency_ms: total_ms / samples as f64,
        }
    }

    pub fn error_rate(&self) -> f64 {
        self.summary().error_rate
    }

    pub fn average_latency(&self) -> Duration {
        Duration::from_secs_f64(self.summary().average_latency_ms / 1000.0)
    }

    pub fn sample_count(&self) -> usize {
        self.summary().samples
    }
}

fn prune(outcomes: &mut VecDeque<Outcome>, now: DateTime<Utc>, window: Duration) {
    let cutoff = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
    while outcomes.front().is_some_and(|o| o.at <= cutoff) {
        outcomes.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spendguard_core::ManualClock;

    #[test]
    fn test_error_rate_and_latency() {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());
        let window = HealthWindow::new(Duration::from_secs(60), clock.clone());
        assert_eq!(window.summary(), HealthSummary::default());

        window.record(true, Duration::from_millis(100));
        window.record(false, Duration::from_millis(300));
        let summary = window.summary();
        assert_eq!(summary.samples, 2);
        assert!((summary.error_rate - 0.5).abs() < 1e-9);
        assert!((summary.average_latency_ms - 200.0).abs() < 1e-6);

        clock.advance(Duration::from_secs(61));
        assert_eq!(window.sample_count(), 0);
        assert_eq!(window.error_rate(), 0.0);
    }
}
