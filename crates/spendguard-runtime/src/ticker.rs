//! Tick sources for background maintenance.
//!
//! Periodic work (health sweeps, cleanup, snapshots) waits on a [`Ticker`]
//! instead of sleeping directly, so tests can fire ticks by hand.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// Source of periodic wake-ups.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. Returns false once the source is exhausted.
    async fn tick(&mut self) -> bool;
}

/// Ticks on a fixed tokio interval. The first tick fires after one period.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks only when its [`TickHandle`] fires.
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Fires a [`ManualTicker`]. Dropping every handle ends the ticker.
#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    pub fn new() -> (Self, TickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, TickHandle { tx })
    }
}

impl TickHandle {
    /// Queue one tick. Returns false if the ticker is gone.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}
