use std::sync::Mutex;

use futures_util::future::{self, BoxFuture};
use tokio::sync::mpsc;
use tracing::trace;

use crate::job::{Job, JobOutcome, JobStep};

/// Deferred mutation queued for the next tick.
pub type Command = Box<dyn FnOnce() + Send + 'static>;

/// Job that applies queued commands at a tick boundary.
///
/// Code outside the loop (input handlers, network tasks) enqueues closures
/// through a [`CommandSender`]; they run in FIFO order during the queue's step,
/// so shared state is only written while the scheduler owns the frame. A
/// panicking command faults the scheduler like any other panicking step.
pub struct CommandQueue {
    rx: Mutex<mpsc::UnboundedReceiver<Command>>,
}

/// Cloneable handle for enqueueing commands from any thread.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandQueue {
    /// Build the queue job and its sender. The job always resumes.
    pub fn job(name: impl Into<String>) -> (Job, CommandSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = CommandQueue { rx: Mutex::new(rx) };
        (Job::new(name, queue), CommandSender { tx })
    }

    /// Run every command queued so far. Commands enqueued while draining wait
    /// for the next tick.
    fn drain(&self) -> usize {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        let pending = rx.len();
        let mut applied = 0;
        while applied < pending {
            match rx.try_recv() {
                Ok(command) => {
                    command();
                    applied += 1;
                }
                Err(_) => break,
            }
        }
        applied
    }
}

impl JobStep for CommandQueue {
    fn step(&self) -> BoxFuture<'_, anyhow::Result<JobOutcome>> {
        let applied = self.drain();
        if applied > 0 {
            trace!(applied, "command queue drained");
        }
        Box::pin(future::ready(anyhow::Ok(JobOutcome::Resume)))
    }
}

impl CommandSender {
    /// Queue a command. Returns `false` once the queue job has been dropped.
    pub fn enqueue(&self, command: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(command)).is_ok()
    }

    /// Whether the queue job is still alive.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}
