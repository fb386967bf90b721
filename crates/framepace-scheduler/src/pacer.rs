use std::time::{Duration, Instant};

/// Decides, per wake-up, whether enough time has passed to run a tick.
///
/// The pacer never sleeps: a wake-up that arrives too early is simply
/// declined and the driver waits for the next one. When a tick is
/// authorised, the remainder of the elapsed time modulo the frame delay is
/// carried into the next interval, so skipped wake-ups do not accumulate
/// drift.
#[derive(Debug, Clone, Default)]
pub struct Pacer {
    last_tick: Option<Instant>,
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one wake-up at `now`. Returns `true` if a tick should run.
    ///
    /// The first evaluation always authorises a tick.
    pub fn evaluate(&mut self, now: Instant, frame_delay: Duration) -> bool {
        let Some(last) = self.last_tick else {
            self.last_tick = Some(now);
            return true;
        };

        let elapsed = now.saturating_duration_since(last);
        if elapsed < frame_delay {
            return false;
        }

        self.last_tick = Some(now - remainder(elapsed, frame_delay));
        true
    }

    /// Reference point the next interval is measured from.
    #[cfg(test)]
    fn last_tick(&self) -> Option<Instant> {
        self.last_tick
    }
}

/// `elapsed % delay`, zero when `delay` is zero.
fn remainder(elapsed: Duration, delay: Duration) -> Duration {
    let delay_ns = delay.as_nanos();
    if delay_ns == 0 {
        return Duration::ZERO;
    }
    let rem = elapsed.as_nanos() % delay_ns;
    // rem < delay_ns, and delay_ns came from a Duration, so it fits in u64 nanos.
    Duration::from_nanos(rem as u64)
}
