use std::sync::Arc;

use tokio::sync::watch;

use crate::error::SchedulerError;

/// Terminal outcome of a scheduler: `Ok` on a graceful stop, `Err` when a job
/// faulted. The error is shared so every observer sees the same value.
pub type Completion = std::result::Result<(), Arc<SchedulerError>>;

/// One-shot signal that settles when the scheduler stops or crashes.
///
/// Cheap to clone; all clones observe the same outcome. Only the owning
/// scheduler can settle it, and the first settlement wins.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    tx: Arc<watch::Sender<Option<Completion>>>,
}

impl CompletionSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Wait until the signal settles and return the outcome.
    pub async fn wait(&self) -> Completion {
        let mut rx = self.tx.subscribe();
        // The `watch::Ref` must be released before `rx` goes out of scope.
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone().unwrap_or(Ok(())),
            Err(_) => unreachable!("completion sender is owned by the signal itself"),
        };
        outcome
    }

    /// Synchronous check; never suspends.
    pub fn is_finished(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The settled outcome, or `None` while the scheduler is still live.
    pub fn outcome(&self) -> Option<Completion> {
        self.tx.borrow().clone()
    }

    /// Settle with success. Returns `false` if the signal was already settled.
    pub(crate) fn resolve(&self) -> bool {
        self.settle(Ok(()))
    }

    /// Settle with failure. Returns `false` if the signal was already settled.
    pub(crate) fn reject(&self, err: SchedulerError) -> bool {
        self.settle(Err(Arc::new(err)))
    }

    fn settle(&self, outcome: Completion) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }
}
