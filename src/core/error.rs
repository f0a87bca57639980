//! Error types for job queue operations.

use thiserror::Error;

/// Errors produced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Operation on an uninitialized or shut-down queue.
    #[error("job queue is not valid (uninitialized or shut down)")]
    Invalid,
    /// Target record was not found in the expected queue.
    #[error("job {0} not found in the waiting queue")]
    NotFound(u32),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker or scheduler-wait thread could not be created.
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
    /// A concurrency counter went negative on release.
    #[error("concurrency counter underflow on {resource}: {value}")]
    CounterUnderflow {
        /// Name of the resource whose counter underflowed.
        resource: String,
        /// The negative value observed.
        value: i64,
    },
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            QueueError::Invalid.to_string(),
            "job queue is not valid (uninitialized or shut down)"
        );
        assert_eq!(
            QueueError::NotFound(42).to_string(),
            "job 42 not found in the waiting queue"
        );
        let err = QueueError::CounterUnderflow {
            resource: "client-a".into(),
            value: -1,
        };
        assert_eq!(
            err.to_string(),
            "concurrency counter underflow on client-a: -1"
        );
    }
}
