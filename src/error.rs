use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobState;

#[derive(Error, Debug)]
pub enum CondorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job {job_id} is {state}, operation not allowed")]
    InvalidState { job_id: Uuid, state: JobState },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job queue is at capacity ({0} active jobs)")]
    QueueFull(usize),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Scheduler is not running")]
    SchedulerUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CondorError {
    /// Errors that are the caller's fault and must not be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CondorError::InvalidRequest(_)
                | CondorError::InvalidState { .. }
                | CondorError::JobNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CondorError>;
