use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use framepace_core::types::JobId;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// What the scheduler should do with a job after its step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Keep the job scheduled for the next tick.
    Resume,
    /// The job is finished; remove it from the registry after this tick.
    Detach,
    /// Fatal error in the job; stop the whole scheduler and report failure.
    Abort,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobOutcome::Resume => "resume",
            JobOutcome::Detach => "detach",
            JobOutcome::Abort => "abort",
        };
        write!(f, "{s}")
    }
}

/// Per-tick work of a job.
///
/// Any `Fn() -> impl Future<Output = anyhow::Result<JobOutcome>>` closure
/// implements this, so most jobs never name the trait. Implement it directly
/// when the step needs to borrow state owned by the job.
pub trait JobStep: Send + Sync + 'static {
    fn step(&self) -> BoxFuture<'_, anyhow::Result<JobOutcome>>;
}

impl<F, Fut> JobStep for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
{
    fn step(&self) -> BoxFuture<'_, anyhow::Result<JobOutcome>> {
        Box::pin((self)())
    }
}

/// A named, schedulable unit of asynchronous work.
///
/// Cloning is a pointer bump; clones share identity, so scheduling a clone of
/// an already registered job is a no-op.
///
/// Jobs form a tree. Children attached with [`schedule_child`](Job::schedule_child)
/// run in a sub-cycle of the same tick, after every job of the previous
/// sub-cycle has returned. A parent owns its children; a child only keeps a
/// weak link back.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: JobId,
    name: String,
    step: Box<dyn JobStep>,
    links: Mutex<Links>,
}

#[derive(Default)]
struct Links {
    parent: Option<Weak<JobInner>>,
    children: Vec<Job>,
}

impl Job {
    pub fn new(name: impl Into<String>, step: impl JobStep) -> Self {
        Self {
            inner: Arc::new(JobInner {
                id: JobId::new(),
                name: name.into(),
                step: Box::new(step),
                links: Mutex::new(Links::default()),
            }),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run one step. The scheduler never calls this while a previous step of
    /// the same job is outstanding.
    pub fn step(&self) -> BoxFuture<'_, anyhow::Result<JobOutcome>> {
        self.inner.step.step()
    }

    /// Whether two handles refer to the same job.
    pub fn same_as(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach `child` beneath this job.
    ///
    /// Returns `Ok(false)` if it is already a child of this job. A child that
    /// belongs to another parent is moved here. Attaching a job beneath itself
    /// or one of its descendants fails with [`SchedulerError::CyclicDependency`].
    pub fn schedule_child(&self, child: Job) -> Result<bool> {
        if self.is_within(&child) {
            return Err(SchedulerError::CyclicDependency {
                name: child.name().to_string(),
            });
        }
        if let Some(previous) = child.parent() {
            if previous.same_as(self) {
                return Ok(false);
            }
            previous.erase_child(&child);
        }

        child.links().parent = Some(Arc::downgrade(&self.inner));
        self.links().children.push(child);
        Ok(true)
    }

    /// Detach `child` from this job. Returns `false` if it was not a child.
    pub fn erase_child(&self, child: &Job) -> bool {
        let removed = {
            let mut links = self.links();
            let before = links.children.len();
            links.children.retain(|c| !c.same_as(child));
            links.children.len() != before
        };
        if removed {
            child.links().parent = None;
        }
        removed
    }

    /// Snapshot of the direct children, in attach order.
    pub fn children(&self) -> Vec<Job> {
        self.links().children.clone()
    }

    /// The parent, if this job is attached and the parent is still alive.
    pub fn parent(&self) -> Option<Job> {
        let parent = self.links().parent.clone()?;
        parent.upgrade().map(|inner| Job { inner })
    }

    /// Number of jobs anywhere beneath this one.
    pub fn descendant_count(&self) -> usize {
        let mut count = 0;
        let mut pending = self.children();
        while let Some(job) = pending.pop() {
            count += 1;
            pending.extend(job.children());
        }
        count
    }

    /// The topmost ancestor, or this job if it has no parent.
    pub fn root(&self) -> Job {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Whether `other` is this job or one of its ancestors.
    fn is_within(&self, other: &Job) -> bool {
        let mut cursor = Some(self.clone());
        while let Some(job) = cursor {
            if job.same_as(other) {
                return true;
            }
            cursor = job.parent();
        }
        false
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        // No user code runs under this lock.
        self.inner.links.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("children", &self.links().children.len())
            .finish_non_exhaustive()
    }
}
