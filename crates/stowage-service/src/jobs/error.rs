use thiserror::Error;

use crate::caching::CacheError;

/// An error produced by running a [`Job`](super::Job).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job observed a cancellation request at one of its check-ins.
    ///
    /// This is a cooperative abort rather than a true failure and should not be logged as an
    /// error.
    #[error("job was cancelled")]
    Cancelled,
    /// The job body returned an error.
    #[error("job failed: {0}")]
    Failed(String),
    /// The job body panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
    /// The output of a job was requested as a different type than it produced.
    #[error("job output is not a `{expected}`")]
    TypeMismatch { expected: &'static str },
    /// The executor shut down before the job could run.
    #[error("the background executor was shut down")]
    ShutDown,
    /// A cache the job depends on failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl JobError {
    /// Creates a [`JobError::Failed`] from any displayable message.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// Whether this is a cooperative cancellation rather than a real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// The single aggregated error of a [`ConcurrentJobRunner`](super::ConcurrentJobRunner) batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// The job at `index` failed, all of its siblings were asked to stop.
    #[error("job {index} of the batch failed: {message}")]
    JobFailed { index: usize, message: String },
    /// The batch was cancelled from the outside.
    #[error("batch was cancelled")]
    Cancelled,
    /// The thread pool for the batch could not be created.
    #[error("failed to spawn batch threads: {0}")]
    Spawn(String),
}

impl From<BatchError> for JobError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::Cancelled => Self::Cancelled,
            other => Self::Failed(other.to_string()),
        }
    }
}
