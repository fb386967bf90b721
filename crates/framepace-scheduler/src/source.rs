//! Wake-up sources that drive the scheduler's pacer.
//!
//! A source only says "now is a good moment to check"; the [`Pacer`](crate::pacer::Pacer)
//! decides whether the wake-up becomes a tick. Dropping the pending
//! `next_tick` future cancels the wake-up.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};

/// Host capability that yields per-frame wake-ups.
#[async_trait]
pub trait TickSource: Send + 'static {
    /// Wait for the next wake-up and return the time reading taken at it.
    ///
    /// `None` means the source is exhausted and will never wake again.
    async fn next_tick(&mut self) -> Option<Instant>;
}

/// Fixed-rate wake-ups from a Tokio interval.
///
/// Missed wake-ups are skipped rather than burst, the same way a display
/// refresh callback behaves when the page is busy.
pub struct IntervalTicks {
    interval: Interval,
}

impl IntervalTicks {
    /// A zero period is bumped to one millisecond; Tokio rejects zero-length intervals.
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

#[async_trait]
impl TickSource for IntervalTicks {
    async fn next_tick(&mut self) -> Option<Instant> {
        Some(self.interval.tick().await.into_std())
    }
}

/// Wake-ups delivered explicitly through a [`TickTrigger`].
///
/// Used by hosts that own their own frame callback (a vsync hook, a game
/// window's event loop) and by tests that need an exact number of wake-ups.
pub struct ManualTicks {
    rx: mpsc::UnboundedReceiver<Instant>,
}

/// Sending half of [`ManualTicks`]. Cloneable; the source is exhausted once
/// every trigger has been dropped and the queued wake-ups are consumed.
#[derive(Debug, Clone)]
pub struct TickTrigger {
    tx: mpsc::UnboundedSender<Instant>,
}

impl ManualTicks {
    pub fn channel() -> (Self, TickTrigger) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, TickTrigger { tx })
    }
}

#[async_trait]
impl TickSource for ManualTicks {
    async fn next_tick(&mut self) -> Option<Instant> {
        self.rx.recv().await
    }
}

impl TickTrigger {
    /// Queue a wake-up stamped with the current time.
    ///
    /// Returns `false` if the scheduler has already dropped the source.
    pub fn fire(&self) -> bool {
        self.fire_at(Instant::now())
    }

    /// Queue a wake-up with an explicit time reading.
    pub fn fire_at(&self, now: Instant) -> bool {
        self.tx.send(now).is_ok()
    }

    /// Whether the scheduler side is still listening.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}
