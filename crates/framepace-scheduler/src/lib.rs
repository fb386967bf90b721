//! `framepace-scheduler`: frame-paced cooperative job scheduler on Tokio.
//!
//! # Overview
//!
//! A [`Scheduler`] admits named [`Job`]s and, on every wake-up from its
//! [`TickSource`], asks the [`Pacer`] whether the configured frame delay has
//! elapsed. If so it runs one tick: every registered job's step is launched
//! concurrently and the tick only ends once all of them have returned.
//!
//! | Outcome  | Effect                                                     |
//! |----------|------------------------------------------------------------|
//! | `Resume` | Job runs again next tick                                   |
//! | `Detach` | Job is removed after this tick                             |
//! | `Abort`  | Scheduler drains the tick, then faults                     |
//!
//! Jobs may carry children ([`Job::schedule_child`]). After the root jobs of
//! a tick drain, their children run as a second sub-cycle, then the
//! grandchildren, each level behind its own barrier.
//!
//! A step that returns `Err` or panics is treated as `Abort`, with the
//! original error kept as the source of the reported [`SchedulerError`].
//! Observers await the outcome through the [`CompletionSignal`].

pub mod completion;
pub mod engine;
pub mod error;
pub mod job;
pub mod pacer;
pub mod queue;
pub mod scheduler;
pub mod source;
pub mod types;

pub use completion::{Completion, CompletionSignal};
pub use engine::{Engine, EngineError, EngineState, Service};
pub use error::{BoxError, Result, SchedulerError};
pub use job::{Job, JobOutcome, JobStep};
pub use pacer::Pacer;
pub use queue::{CommandQueue, CommandSender};
pub use scheduler::Scheduler;
pub use source::{IntervalTicks, ManualTicks, TickSource, TickTrigger};
pub use types::{SchedulerState, TickStats};
