use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a scheduler.
///
/// `Idle -> Running -> Stopping -> Stopped`, or `Running -> Faulted`.
/// `Stopped` and `Faulted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Constructed, not started.
    Idle,
    /// Ticking.
    Running,
    /// Stop requested; the in-flight tick is draining.
    Stopping,
    /// Stopped gracefully.
    Stopped,
    /// A job aborted, failed or panicked.
    Faulted,
}

impl SchedulerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SchedulerState::Stopped | SchedulerState::Faulted)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
            SchedulerState::Stopped => "stopped",
            SchedulerState::Faulted => "faulted",
        };
        write!(f, "{s}")
    }
}

/// Counters published after every completed tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickStats {
    /// Number of ticks that have fully drained.
    pub ticks: u64,
    /// Wall-clock time the last tick spent waiting on its jobs.
    pub last_tick_duration: Duration,
    /// Interval between the starts of the two most recent ticks.
    pub last_cycle_delta: Duration,
    /// How many jobs the last tick launched, children included.
    pub jobs_last_tick: usize,
    /// Barrier-separated sub-cycles in the last tick: 1 for root jobs only,
    /// plus one per level of children that ran.
    pub sub_cycles_last_tick: usize,
    /// When the first tick started.
    pub started_at: Option<DateTime<Utc>>,
}
