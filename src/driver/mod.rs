pub mod file;
pub mod memory;
pub mod redis;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::job::Job;

pub use file::FileDriver;
pub use memory::MemoryDriver;
pub use redis::RedisDriver;
pub use sync::SyncDriver;

/// Pluggable storage backend for a queue.
///
/// Backends differ only in how jobs are queued, made durable and popped;
/// retry, dead-lettering and metrics behavior is shared through
/// [`JobExecutor`](crate::JobExecutor).
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Submit a job, optionally delayed. Backend failures here propagate to
    /// the caller so enqueue problems stay visible.
    async fn push(&self, job: Arc<dyn Job>, delay: Option<Duration>) -> Result<String>;

    /// Pop and execute at most one ready job. Returns whether a job ran.
    /// Job-level failures become state transitions, never errors; only
    /// backend faults surface as `Err`.
    async fn process(&self) -> Result<bool>;

    /// Drop all queued jobs.
    async fn clear(&self) -> Result<()>;

    /// `{driver, config, metrics?, deadLetters?}` merged with
    /// backend-specific keys.
    async fn stats(&self) -> Result<Value>;

    /// Backend reachability. Defaults to healthy for backends with no
    /// external connection.
    async fn is_healthy(&self) -> bool {
        true
    }
}
