use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use framepace_core::config::SchedulerConfig;
use framepace_core::types::{JobId, LoopId};
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    completion::CompletionSignal,
    error::{Result, SchedulerError},
    job::{Job, JobOutcome, JobStep},
    pacer::Pacer,
    source::{IntervalTicks, TickSource},
    types::{SchedulerState, TickStats},
};

/// Frame-paced cooperative scheduler.
///
/// Every authorised tick runs all registered jobs concurrently on the driver
/// task and waits for every one of them before the next wake-up is
/// considered. Any job fault stops the whole loop; the cause is delivered
/// through [`CompletionSignal`].
///
/// `Scheduler` is a cheap handle: clones drive the same loop, so a job may
/// capture one to schedule further jobs or to call [`signal_stop`](Self::signal_stop).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    loop_id: LoopId,
    jobs: DashMap<JobId, Job>,
    frame_delay_ns: AtomicU64,
    wakeup_interval: Duration,
    completion: CompletionSignal,
    lifecycle: Mutex<Lifecycle>,
    stats_tx: watch::Sender<TickStats>,
}

struct Lifecycle {
    state: SchedulerState,
    shutdown_tx: Option<watch::Sender<bool>>,
}

/// Why the driver loop ended.
enum Exit {
    Stopped,
    SourceExhausted,
    Faulted(SchedulerError),
}

impl Scheduler {
    pub fn new(frame_delay: Duration) -> Self {
        Self::with_intervals(frame_delay, SchedulerConfig::default().wakeup_interval())
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::with_intervals(config.frame_delay(), config.wakeup_interval())
    }

    fn with_intervals(frame_delay: Duration, wakeup_interval: Duration) -> Self {
        let (stats_tx, _) = watch::channel(TickStats::default());
        Self {
            inner: Arc::new(Inner {
                loop_id: LoopId::new(),
                jobs: DashMap::new(),
                frame_delay_ns: AtomicU64::new(duration_to_nanos(frame_delay)),
                wakeup_interval,
                completion: CompletionSignal::new(),
                lifecycle: Mutex::new(Lifecycle {
                    state: SchedulerState::Idle,
                    shutdown_tx: None,
                }),
                stats_tx,
            }),
        }
    }

    /// Bind a name to a step function.
    pub fn create_job(name: impl Into<String>, step: impl JobStep) -> Job {
        Job::new(name, step)
    }

    /// Start ticking on the built-in interval source.
    ///
    /// Returns immediately; the loop runs on a spawned Tokio task, so this
    /// must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.start_with(IntervalTicks::new(self.inner.wakeup_interval))
    }

    /// Start ticking on an injected wake-up source.
    ///
    /// Fails with [`SchedulerError::AlreadyStarted`] unless the scheduler is idle.
    pub fn start_with<S: TickSource>(&self, source: S) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.state != SchedulerState::Idle {
            return Err(SchedulerError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("scheduler", loop_id = %self.inner.loop_id);
        let inner = Arc::clone(&self.inner);

        lifecycle.state = SchedulerState::Running;
        lifecycle.shutdown_tx = Some(shutdown_tx);
        tokio::spawn(supervise(inner, source, shutdown_rx).instrument(span));

        info!(
            loop_id = %self.inner.loop_id,
            frame_delay_ms = self.frame_delay().as_secs_f64() * 1000.0,
            jobs = self.inner.jobs.len(),
            "scheduler started"
        );
        Ok(())
    }

    /// Stop gracefully and wait for the in-flight tick to drain.
    ///
    /// Every caller that finds the scheduler running or already stopping
    /// waits for the drain, including callers that race each other or follow
    /// a [`signal_stop`](Self::signal_stop). Calls while idle or terminal
    /// return immediately. Do not await this from inside a job step: the tick
    /// running that step is what it waits for. Use `signal_stop` there instead.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.inner.lifecycle();
            match lifecycle.state {
                SchedulerState::Running => {
                    lifecycle.request_stop();
                    info!(loop_id = %self.inner.loop_id, "scheduler stopping");
                }
                SchedulerState::Stopping => {
                    debug!(loop_id = %self.inner.loop_id, "stop already requested, waiting for drain");
                }
                state => {
                    debug!(state = %state, "stop ignored");
                    return;
                }
            }
        }

        // Settled by the driver once the in-flight tick has drained, or by
        // its supervisor if the driver panics.
        let _ = self.inner.completion.wait().await;
    }

    /// Request a stop without waiting. Safe to call from inside a job step.
    ///
    /// Returns `false` if the scheduler was not running.
    pub fn signal_stop(&self) -> bool {
        let requested = self.inner.lifecycle().request_stop();
        if requested {
            info!(loop_id = %self.inner.loop_id, "scheduler stop signalled");
        }
        requested
    }

    /// Register a job. Scheduling the same job twice is a no-op.
    ///
    /// Returns `true` if the job was newly added. Jobs scheduled after the
    /// scheduler reached a terminal state are ignored.
    pub fn schedule(&self, job: Job) -> bool {
        if self.state().is_terminal() {
            debug!(job = %job.name(), "schedule ignored on terminal scheduler");
            return false;
        }

        let mut added = false;
        self.inner.jobs.entry(job.id().clone()).or_insert_with(|| {
            added = true;
            job.clone()
        });
        if added {
            debug!(job = %job.name(), job_id = %job.id(), "job scheduled");
        }
        added
    }

    /// Remove a job before it detaches itself.
    ///
    /// A child job is detached from its parent; a root job is removed from
    /// the registry together with its subtree. A tick already in flight
    /// still runs the job once.
    pub fn unschedule(&self, job: &Job) -> Result<()> {
        let removed = match job.parent() {
            Some(parent) => parent.erase_child(job),
            None => self.inner.jobs.remove(job.id()).is_some(),
        };
        if !removed {
            return Err(SchedulerError::JobNotFound {
                id: job.id().clone(),
            });
        }
        debug!(job = %job.name(), job_id = %job.id(), "job unscheduled");
        Ok(())
    }

    /// Whether the job is registered, directly or beneath a registered job.
    pub fn contains(&self, job: &Job) -> bool {
        self.inner.jobs.contains_key(job.root().id())
    }

    /// Registered jobs including every descendant.
    pub fn job_count(&self) -> usize {
        self.inner
            .jobs
            .iter()
            .map(|entry| 1 + entry.value().descendant_count())
            .sum()
    }

    /// Minimum interval between ticks.
    pub fn frame_delay(&self) -> Duration {
        self.inner.frame_delay()
    }

    /// Change the minimum interval; applies from the next wake-up.
    pub fn set_frame_delay(&self, frame_delay: Duration) {
        self.inner
            .frame_delay_ns
            .store(duration_to_nanos(frame_delay), Ordering::Relaxed);
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lifecycle().state
    }

    /// Handle to the signal that settles when the loop ends.
    pub fn completion(&self) -> CompletionSignal {
        self.inner.completion.clone()
    }

    /// Snapshot of the counters published after the last drained tick.
    pub fn tick_stats(&self) -> TickStats {
        self.inner.stats_tx.borrow().clone()
    }

    /// Receiver that is notified after every drained tick.
    pub fn subscribe_ticks(&self) -> watch::Receiver<TickStats> {
        self.inner.stats_tx.subscribe()
    }

    pub fn loop_id(&self) -> &LoopId {
        &self.inner.loop_id
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("loop_id", &self.inner.loop_id)
            .field("state", &self.state())
            .field("jobs", &self.job_count())
            .field("frame_delay", &self.frame_delay())
            .finish()
    }
}

impl Lifecycle {
    /// Move `Running -> Stopping` and wake the driver.
    fn request_stop(&mut self) -> bool {
        if self.state != SchedulerState::Running {
            return false;
        }
        self.state = SchedulerState::Stopping;
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(true);
        }
        true
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        // Nothing panics while holding this lock; recover rather than propagate poison.
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn frame_delay(&self) -> Duration {
        Duration::from_nanos(self.frame_delay_ns.load(Ordering::Relaxed))
    }

    /// Run one tick: every registered job, then their children in
    /// successive sub-cycles, each behind a barrier. Returns the first fault.
    ///
    /// A job runs at most once per tick. Once a sub-cycle faults, no further
    /// sub-cycle is started.
    async fn run_tick(&self, last_start: &mut Option<Instant>) -> Option<SchedulerError> {
        let mut wave: Vec<Job> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        let started = Instant::now();
        let wall_start = Utc::now();

        let mut seen: HashSet<JobId> = HashSet::new();
        let mut launched = 0;
        let mut sub_cycles = 0;
        let mut fault: Option<SchedulerError> = None;

        while !wave.is_empty() && fault.is_none() {
            wave.retain(|job| seen.insert(job.id().clone()));
            if wave.is_empty() {
                break;
            }
            launched += wave.len();
            sub_cycles += 1;

            let mut next = Vec::new();
            let mut in_flight: FuturesUnordered<_> = wave
                .iter()
                .map(|job| async move { (job, run_step(job).await) })
                .collect();

            while let Some((job, result)) = in_flight.next().await {
                let err = match result {
                    Ok(JobOutcome::Resume) => {
                        next.extend(job.children());
                        continue;
                    }
                    Ok(JobOutcome::Detach) => {
                        // Children still run this tick; they leave with the parent.
                        next.extend(job.children());
                        self.detach(job);
                        continue;
                    }
                    Ok(JobOutcome::Abort) => SchedulerError::JobAborted {
                        name: job.name().to_string(),
                    },
                    Err(err) => err,
                };

                if fault.is_none() {
                    error!(job = %job.name(), error = %err, "job fault, draining tick");
                    fault = Some(err);
                } else {
                    warn!(job = %job.name(), error = %err, "additional job fault in faulted tick");
                }
            }
            drop(in_flight);
            wave = next;
        }

        let duration = started.elapsed();
        let cycle_delta = last_start.map(|prev| started - prev).unwrap_or_default();
        *last_start = Some(started);

        self.stats_tx.send_modify(|stats| {
            stats.ticks += 1;
            stats.last_tick_duration = duration;
            stats.last_cycle_delta = cycle_delta;
            stats.jobs_last_tick = launched;
            stats.sub_cycles_last_tick = sub_cycles;
            stats.started_at.get_or_insert(wall_start);
        });
        trace!(
            jobs = launched,
            sub_cycles,
            elapsed_ms = duration.as_secs_f64() * 1000.0,
            "tick drained"
        );

        fault
    }

    fn detach(&self, job: &Job) {
        match job.parent() {
            Some(parent) => {
                parent.erase_child(job);
            }
            None => {
                self.jobs.remove(job.id());
            }
        }
        debug!(job = %job.name(), job_id = %job.id(), "job detached");
    }

    /// Record the terminal state, then settle the completion signal.
    fn finish(&self, exit: Exit) {
        let state = match exit {
            Exit::Faulted(_) => SchedulerState::Faulted,
            Exit::Stopped | Exit::SourceExhausted => SchedulerState::Stopped,
        };
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state.is_terminal() {
                return;
            }
            lifecycle.state = state;
            lifecycle.shutdown_tx = None;
        }

        let ticks = self.stats_tx.borrow().ticks;
        match exit {
            Exit::Stopped => {
                info!(loop_id = %self.loop_id, ticks, "scheduler stopped");
                self.completion.resolve();
            }
            Exit::SourceExhausted => {
                warn!(loop_id = %self.loop_id, ticks, "tick source exhausted, scheduler stopped");
                self.completion.resolve();
            }
            Exit::Faulted(err) => {
                error!(loop_id = %self.loop_id, ticks, error = %err, "scheduler faulted");
                self.completion.reject(err);
            }
        }
    }
}

/// Run the driver loop, turning a panic outside any job step (a tick source,
/// the loop itself) into an internal fault so the completion still settles.
async fn supervise<S: TickSource>(
    inner: Arc<Inner>,
    source: S,
    shutdown: watch::Receiver<bool>,
) {
    let driver = AssertUnwindSafe(drive(Arc::clone(&inner), source, shutdown)).catch_unwind();
    if let Err(payload) = driver.await {
        let message = panic_message(payload.as_ref());
        error!(loop_id = %inner.loop_id, panic = %message, "scheduler driver panicked");
        inner.finish(Exit::Faulted(SchedulerError::Internal(message)));
    }
}

/// Driver loop: wait for a wake-up, let the pacer decide, run the tick.
async fn drive<S: TickSource>(
    inner: Arc<Inner>,
    mut source: S,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pacer = Pacer::new();
    let mut last_start = None;

    let exit = loop {
        // Shutdown is only observed between ticks; an in-flight tick always drains.
        let now = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Exit::Stopped;
                }
                continue;
            }
            woke = source.next_tick() => match woke {
                Some(now) => now,
                None => break Exit::SourceExhausted,
            },
        };

        if !pacer.evaluate(now, inner.frame_delay()) {
            continue;
        }

        if let Some(fault) = inner.run_tick(&mut last_start).await {
            break Exit::Faulted(fault);
        }
    };

    // Dropping the source cancels any pending wake-up.
    drop(source);
    inner.finish(exit);
}

/// Run one step, mapping errors and panics to fatal scheduler errors.
async fn run_step(job: &Job) -> Result<JobOutcome> {
    match AssertUnwindSafe(async { job.step().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(source)) => Err(SchedulerError::JobFailed {
            name: job.name().to_string(),
            source: source.into(),
        }),
        Err(payload) => Err(SchedulerError::JobPanicked {
            name: job.name().to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
