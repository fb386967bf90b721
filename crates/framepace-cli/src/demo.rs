//! Demonstration workload for `framepace run`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use framepace_scheduler::{Engine, Job, JobOutcome, Service};
use tracing::info;

/// Log cadence of the heartbeat, in ticks.
pub const HEARTBEAT_EVERY: u64 = 60;

/// Service that contributes a job logging every [`HEARTBEAT_EVERY`] ticks.
#[derive(Default)]
pub struct Heartbeat {
    beats: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Service for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn start(&self, engine: &Engine) -> anyhow::Result<()> {
        info!(frame_delay = ?engine.scheduler().frame_delay(), "heartbeat online");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        info!(beats = self.beats(), "heartbeat offline");
        Ok(())
    }

    fn job(self: Arc<Self>) -> Option<Job> {
        let beats = Arc::clone(&self.beats);
        Some(Job::new("heartbeat", move || {
            let n = beats.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                if n % HEARTBEAT_EVERY == 0 {
                    info!(beats = n, "heartbeat");
                }
                anyhow::Ok(JobOutcome::Resume)
            }
        }))
    }
}

/// One-shot job: runs on the first tick, then detaches.
pub fn warmup() -> Job {
    Job::new("warmup", || async {
        info!("warmup complete");
        anyhow::Ok(JobOutcome::Detach)
    })
}

/// Returns `Abort` on its `after`-th call. `after == 0` aborts on the first.
pub fn fault_injector(after: u64) -> Job {
    let calls = Arc::new(AtomicU64::new(0));
    Job::new("fault-injector", move || {
        let n = calls.fetch_add(1, Ordering::Relaxed) + 1;
        async move {
            if n >= after {
                return anyhow::Ok(JobOutcome::Abort);
            }
            anyhow::Ok(JobOutcome::Resume)
        }
    })
}
