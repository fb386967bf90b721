// Behavioural tests for the tick loop. Most drive the scheduler with
// ManualTicks so the number of wake-ups is exact.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use framepace_scheduler::{
    Job, JobOutcome, ManualTicks, Scheduler, SchedulerError, SchedulerState, TickSource,
};
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(5);

fn counting_job(name: &str, calls: &Arc<AtomicU32>, outcome: JobOutcome) -> Job {
    let calls = Arc::clone(calls);
    Job::new(name, move || {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(outcome)
        }
    })
}

async fn wait_ticks(scheduler: &Scheduler, n: u64) {
    let mut rx = scheduler.subscribe_ticks();
    tokio::time::timeout(WAIT, rx.wait_for(|stats| stats.ticks >= n))
        .await
        .expect("timed out waiting for ticks")
        .expect("tick stats channel closed");
}

#[tokio::test]
async fn detached_job_is_gone_after_its_tick() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let a_calls = Arc::new(AtomicU32::new(0));
    let b_calls = Arc::new(AtomicU32::new(0));
    let a = counting_job("A", &a_calls, JobOutcome::Resume);
    let b = counting_job("B", &b_calls, JobOutcome::Detach);
    scheduler.schedule(a.clone());
    scheduler.schedule(b.clone());

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Running);

    trigger.fire();
    wait_ticks(&scheduler, 1).await;
    trigger.fire();
    wait_ticks(&scheduler, 2).await;

    assert_eq!(a_calls.load(Ordering::SeqCst), 2);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert!(scheduler.contains(&a));
    assert!(!scheduler.contains(&b));
    assert_eq!(scheduler.job_count(), 1);

    scheduler.stop().await;
    assert!(scheduler.completion().wait().await.is_ok());
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn abort_rejects_completion_with_job_name() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let calls = Arc::new(AtomicU32::new(0));
    let c = counting_job("C", &calls, JobOutcome::Abort);
    scheduler.schedule(c.clone());

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    trigger.fire();

    let err = tokio::time::timeout(WAIT, scheduler.completion().wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(*err, SchedulerError::JobAborted { ref name } if name == "C"));
    assert!(err.to_string().contains("C"));
    assert_eq!(err.job_name(), Some("C"));
    assert_eq!(scheduler.state(), SchedulerState::Faulted);

    // Abort is not detach: the job stays registered, but never runs again.
    assert!(scheduler.contains(&c));
    assert!(!trigger.fire());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.tick_stats().ticks, 1);
}

#[tokio::test]
async fn abort_drains_concurrent_jobs_before_settling() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let finished = Arc::new(AtomicBool::new(false));
    let slow_calls = Arc::new(AtomicU32::new(0));

    let slow = {
        let finished = Arc::clone(&finished);
        let slow_calls = Arc::clone(&slow_calls);
        Job::new("slow", move || {
            let finished = Arc::clone(&finished);
            let slow_calls = Arc::clone(&slow_calls);
            async move {
                slow_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.store(true, Ordering::SeqCst);
                anyhow::Ok(JobOutcome::Resume)
            }
        })
    };
    let aborter = Job::new("aborter", || async { anyhow::Ok(JobOutcome::Abort) });
    scheduler.schedule(slow);
    scheduler.schedule(aborter);

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    trigger.fire();
    trigger.fire();

    let err = tokio::time::timeout(WAIT, scheduler.completion().wait())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.job_name(), Some("aborter"));
    assert!(finished.load(Ordering::SeqCst), "in-flight job was not drained");
    assert_eq!(slow_calls.load(Ordering::SeqCst), 1, "a second tick ran after abort");
}

#[tokio::test]
async fn failing_step_keeps_original_cause() {
    let scheduler = Scheduler::new(Duration::ZERO);
    scheduler.schedule(Job::new("writer", || async {
        Err::<JobOutcome, _>(anyhow::Error::new(io::Error::new(
            io::ErrorKind::Other,
            "disk on fire",
        )))
    }));

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    trigger.fire();

    let err = tokio::time::timeout(WAIT, scheduler.completion().wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(*err, SchedulerError::JobFailed { ref name, .. } if name == "writer"));
    assert!(err.to_string().contains("writer"));

    let cause = std::error::Error::source(&*err).expect("cause chain is empty");
    assert_eq!(cause.to_string(), "disk on fire");
    assert_eq!(scheduler.state(), SchedulerState::Faulted);
}

#[tokio::test]
async fn panicking_step_faults_like_abort() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let steady = Arc::new(AtomicU32::new(0));
    scheduler.schedule(counting_job("steady", &steady, JobOutcome::Resume));
    scheduler.schedule(Job::new("wobbly", || async {
        if true {
            panic!("lost the frame");
        }
        anyhow::Ok(JobOutcome::Resume)
    }));

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    trigger.fire();

    let err = tokio::time::timeout(WAIT, scheduler.completion().wait())
        .await
        .unwrap()
        .unwrap_err();
    match &*err {
        SchedulerError::JobPanicked { name, message } => {
            assert_eq!(name, "wobbly");
            assert!(message.contains("lost the frame"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(steady.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_between_ticks_resolves_and_halts() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let calls = Arc::new(AtomicU32::new(0));
    scheduler.schedule(counting_job("loop", &calls, JobOutcome::Resume));

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    trigger.fire();
    wait_ticks(&scheduler, 1).await;

    scheduler.stop().await;
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert!(scheduler.completion().is_finished());
    assert!(scheduler.completion().wait().await.is_ok());

    // The pending wake-up was cancelled; nothing runs any more.
    assert!(!trigger.fire());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Second stop is harmless.
    scheduler.stop().await;
    assert!(!scheduler.signal_stop());
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn stop_waits_for_in_flight_tick() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let started = Arc::new(Notify::new());
    let done = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicU32::new(0));

    scheduler.schedule({
        let started = Arc::clone(&started);
        let done = Arc::clone(&done);
        let calls = Arc::clone(&calls);
        Job::new("long", move || {
            let started = Arc::clone(&started);
            let done = Arc::clone(&done);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(50)).await;
                done.store(true, Ordering::SeqCst);
                anyhow::Ok(JobOutcome::Resume)
            }
        })
    });

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    trigger.fire();
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();

    // Queue more wake-ups; none of them may turn into a tick.
    trigger.fire();
    trigger.fire();
    scheduler.stop().await;

    assert!(done.load(Ordering::SeqCst), "stop returned before the tick drained");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(scheduler.completion().wait().await.is_ok());
}

/// Sleeps for `nap`, announcing its start and marking completion.
fn slow_job(name: &str, nap: Duration, started: &Arc<Notify>, done: &Arc<AtomicBool>) -> Job {
    let started = Arc::clone(started);
    let done = Arc::clone(done);
    Job::new(name, move || {
        let started = Arc::clone(&started);
        let done = Arc::clone(&done);
        async move {
            started.notify_one();
            tokio::time::sleep(nap).await;
            done.store(true, Ordering::SeqCst);
            anyhow::Ok(JobOutcome::Resume)
        }
    })
}

#[tokio::test]
async fn stop_after_signal_stop_waits_for_drain() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let started = Arc::new(Notify::new());
    let done = Arc::new(AtomicBool::new(false));
    scheduler.schedule(slow_job("render", Duration::from_millis(100), &started, &done));

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    trigger.fire();
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();

    assert!(scheduler.signal_stop());
    assert_eq!(scheduler.state(), SchedulerState::Stopping);
    scheduler.stop().await;

    assert!(done.load(Ordering::SeqCst), "stop returned before the tick drained");
    assert!(scheduler.completion().is_finished());
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn concurrent_stops_all_wait_for_drain() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let started = Arc::new(Notify::new());
    let done = Arc::new(AtomicBool::new(false));
    scheduler.schedule(slow_job("render", Duration::from_millis(60), &started, &done));

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    trigger.fire();
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();

    let other = scheduler.clone();
    let first = async {
        scheduler.stop().await;
        done.load(Ordering::SeqCst)
    };
    let second = async {
        other.stop().await;
        done.load(Ordering::SeqCst)
    };
    let (first_saw_drain, second_saw_drain) = tokio::join!(first, second);

    assert!(first_saw_drain);
    assert!(second_saw_drain);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

/// Delivers one wake-up, then panics like a broken host frame callback.
struct BrokenSource {
    wakeups: u32,
}

#[async_trait]
impl TickSource for BrokenSource {
    async fn next_tick(&mut self) -> Option<Instant> {
        self.wakeups += 1;
        if self.wakeups > 1 {
            panic!("vsync callback lost");
        }
        Some(Instant::now())
    }
}

#[tokio::test]
async fn panicking_tick_source_faults_with_internal_error() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let calls = Arc::new(AtomicU32::new(0));
    scheduler.schedule(counting_job("frame", &calls, JobOutcome::Resume));

    scheduler.start_with(BrokenSource { wakeups: 0 }).unwrap();

    let err = tokio::time::timeout(WAIT, scheduler.completion().wait())
        .await
        .expect("completion never settled after driver panic")
        .unwrap_err();
    assert!(
        matches!(*err, SchedulerError::Internal(ref message) if message.contains("vsync callback lost")),
        "unexpected error: {err}"
    );
    assert!(err.is_fatal());
    assert_eq!(err.job_name(), None);
    assert_eq!(scheduler.state(), SchedulerState::Faulted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Nothing left to wait for.
    tokio::time::timeout(WAIT, scheduler.stop()).await.unwrap();
}

#[tokio::test]
async fn fault_during_stop_wins() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let started = Arc::new(Notify::new());
    scheduler.schedule({
        let started = Arc::clone(&started);
        Job::new("late-abort", move || {
            let started = Arc::clone(&started);
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(30)).await;
                anyhow::Ok(JobOutcome::Abort)
            }
        })
    });

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    trigger.fire();
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();
    scheduler.stop().await;

    assert_eq!(scheduler.state(), SchedulerState::Faulted);
    let err = scheduler.completion().wait().await.unwrap_err();
    assert_eq!(err.job_name(), Some("late-abort"));
}

#[tokio::test]
async fn signal_stop_from_inside_a_job() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let calls = Arc::new(AtomicU32::new(0));
    scheduler.schedule({
        let handle = scheduler.clone();
        let calls = Arc::clone(&calls);
        Job::new("quitter", move || {
            calls.fetch_add(1, Ordering::SeqCst);
            handle.signal_stop();
            async { anyhow::Ok(JobOutcome::Resume) }
        })
    });

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    for _ in 0..5 {
        trigger.fire();
    }

    let outcome = tokio::time::timeout(WAIT, scheduler.completion().wait())
        .await
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn start_is_only_productive_once() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let (source, _trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();

    let (again, _t) = ManualTicks::channel();
    assert!(matches!(
        scheduler.start_with(again),
        Err(SchedulerError::AlreadyStarted)
    ));

    scheduler.stop().await;
    let (after_stop, _t) = ManualTicks::channel();
    assert!(matches!(
        scheduler.start_with(after_stop),
        Err(SchedulerError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn schedule_after_terminal_has_no_effect() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let (source, _trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    scheduler.stop().await;

    let calls = Arc::new(AtomicU32::new(0));
    assert!(!scheduler.schedule(counting_job("late", &calls, JobOutcome::Resume)));
    assert_eq!(scheduler.job_count(), 0);
}

#[tokio::test]
async fn jobs_added_mid_tick_wait_for_next_tick() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let child_calls = Arc::new(AtomicU32::new(0));
    let child = counting_job("child", &child_calls, JobOutcome::Resume);

    scheduler.schedule({
        let handle = scheduler.clone();
        let child = child.clone();
        Job::new("spawner", move || {
            handle.schedule(child.clone());
            async { anyhow::Ok(JobOutcome::Detach) }
        })
    });

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();

    trigger.fire();
    wait_ticks(&scheduler, 1).await;
    assert_eq!(child_calls.load(Ordering::SeqCst), 0);
    assert!(scheduler.contains(&child));
    assert_eq!(scheduler.job_count(), 1);

    trigger.fire();
    wait_ticks(&scheduler, 2).await;
    assert_eq!(child_calls.load(Ordering::SeqCst), 1);

    scheduler.stop().await;
}

#[tokio::test]
async fn jobs_in_a_tick_overlap_but_never_reenter() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let active = Arc::new(AtomicU32::new(0));
    let reentered = Arc::new(AtomicBool::new(false));

    for name in ["left", "right"] {
        let active = Arc::clone(&active);
        let reentered = Arc::clone(&reentered);
        let running = Arc::new(AtomicBool::new(false));
        scheduler.schedule(Job::new(name, move || {
            let active = Arc::clone(&active);
            let reentered = Arc::clone(&reentered);
            let running = Arc::clone(&running);
            async move {
                if running.swap(true, Ordering::SeqCst) {
                    reentered.store(true, Ordering::SeqCst);
                }
                active.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                running.store(false, Ordering::SeqCst);
                anyhow::Ok(JobOutcome::Resume)
            }
        }));
    }

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    for _ in 0..3 {
        trigger.fire();
    }
    wait_ticks(&scheduler, 3).await;
    scheduler.stop().await;

    let stats = scheduler.tick_stats();
    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.jobs_last_tick, 2);
    // Two 40 ms steps overlapping take well under their 80 ms sum.
    assert!(
        stats.last_tick_duration < Duration::from_millis(75),
        "jobs were serialized: {:?}",
        stats.last_tick_duration
    );
    assert!(!reentered.load(Ordering::SeqCst));
    assert_eq!(active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn half_rate_wakeups_tick_every_other_time() {
    let scheduler = Scheduler::new(Duration::from_millis(16));
    let calls = Arc::new(AtomicU32::new(0));
    scheduler.schedule(counting_job("frame", &calls, JobOutcome::Resume));

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    let t0 = Instant::now();
    for i in 0..9 {
        trigger.fire_at(t0 + Duration::from_millis(8 * i));
    }
    // Exhausting the source ends the loop once the queued wake-ups are consumed.
    drop(trigger);

    let outcome = tokio::time::timeout(WAIT, scheduler.completion().wait())
        .await
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(scheduler.tick_stats().ticks, 5);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn frame_delay_change_applies_to_next_wakeup() {
    let scheduler = Scheduler::new(Duration::from_millis(100));
    let calls = Arc::new(AtomicU32::new(0));
    scheduler.schedule(counting_job("frame", &calls, JobOutcome::Resume));

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    let t0 = Instant::now();

    trigger.fire_at(t0);
    wait_ticks(&scheduler, 1).await;

    scheduler.set_frame_delay(Duration::from_millis(5));
    trigger.fire_at(t0 + Duration::from_millis(10));
    wait_ticks(&scheduler, 2).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    scheduler.stop().await;
}

#[tokio::test]
async fn interval_source_respects_frame_delay() {
    let scheduler = Scheduler::new(Duration::from_millis(20));
    let calls = Arc::new(AtomicU32::new(0));
    scheduler.schedule(counting_job("frame", &calls, JobOutcome::Resume));

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.stop().await;

    let ticks = calls.load(Ordering::SeqCst);
    assert!(ticks >= 2, "only {ticks} ticks in 200 ms");
    assert!(ticks <= 12, "{ticks} ticks in 200 ms exceeds 50 Hz");

    let stats = scheduler.tick_stats();
    assert_eq!(stats.ticks, u64::from(ticks));
    assert!(stats.started_at.is_some());
    assert!(stats.last_cycle_delta > Duration::ZERO);
}

#[tokio::test]
async fn zero_delay_ticks_on_every_wakeup() {
    let scheduler = Scheduler::new(Duration::ZERO);
    let calls = Arc::new(AtomicU32::new(0));
    scheduler.schedule(counting_job("frame", &calls, JobOutcome::Resume));

    let (source, trigger) = ManualTicks::channel();
    scheduler.start_with(source).unwrap();
    let t0 = Instant::now();
    for i in 0..10 {
        trigger.fire_at(t0 + Duration::from_micros(i));
    }
    drop(trigger);

    tokio::time::timeout(WAIT, scheduler.completion().wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}
