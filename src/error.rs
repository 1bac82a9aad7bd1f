use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Job type already registered: {0}")]
    DuplicateJobType(String),

    #[error("No job type registered for: {0}")]
    UnregisteredJobType(String),

    #[error("Job execution failed: {0}")]
    Execution(String),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl From<redis::RedisError> for QueueError {
    fn from(value: redis::RedisError) -> Self {
        QueueError::Connection(value.to_string())
    }
}

impl From<deadpool_redis::PoolError> for QueueError {
    fn from(value: deadpool_redis::PoolError) -> Self {
        QueueError::Connection(format!("Failed to get Redis connection: {}", value))
    }
}
