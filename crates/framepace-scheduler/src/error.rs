use framepace_core::types::JobId;
use thiserror::Error;

/// Boxed cause carried by a failing job step.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur within the scheduler subsystem.
///
/// The `Job*` variants are fatal: they terminate the whole loop and are
/// delivered through the completion signal. The rest are returned to the
/// caller of the offending operation only.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job returned `JobOutcome::Abort`.
    #[error("Job '{name}' aborted")]
    JobAborted { name: String },

    /// A job step returned an error. The original error is kept as the source.
    #[error("Job '{name}' failed")]
    JobFailed {
        name: String,
        #[source]
        source: BoxError,
    },

    /// A job step panicked.
    #[error("Job '{name}' panicked: {message}")]
    JobPanicked { name: String, message: String },

    /// No job with the given ID is registered.
    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    /// A job was attached beneath itself or one of its own descendants.
    #[error("Cyclic job dependency: '{name}'")]
    CyclicDependency { name: String },

    /// `start` was called on a scheduler that has already left the idle state.
    #[error("Scheduler already started")]
    AlreadyStarted,

    /// The driver task itself died; no job is to blame.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Name of the job responsible for a fatal error, if any.
    pub fn job_name(&self) -> Option<&str> {
        match self {
            SchedulerError::JobAborted { name }
            | SchedulerError::JobFailed { name, .. }
            | SchedulerError::JobPanicked { name, .. } => Some(name),
            SchedulerError::JobNotFound { .. }
            | SchedulerError::CyclicDependency { .. }
            | SchedulerError::AlreadyStarted
            | SchedulerError::Internal(_) => None,
        }
    }

    /// Whether this error terminates the loop.
    pub fn is_fatal(&self) -> bool {
        self.job_name().is_some() || matches!(self, SchedulerError::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
