use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use crate::driver::QueueDriver;
use crate::error::{QueueError, Result};
use crate::executor::DriverConfig;
use crate::job::Job;

/// Executes jobs inline at `push` time. No retries, dead-lettering or
/// metrics apply; failures surface directly to the pushing caller. Intended
/// for tests and deployments with no deferred execution need.
pub struct SyncDriver {
    config: DriverConfig,
    sequence: AtomicU64,
    executed: AtomicU64,
}

impl SyncDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            sequence: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        }
    }

    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueueDriver for SyncDriver {
    async fn push(&self, job: Arc<dyn Job>, delay: Option<Duration>) -> Result<String> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}_{}_{}", self.config.name, Utc::now().timestamp_millis(), seq);

        if delay.is_some() {
            debug!(job_id = %id, "Sync driver ignores push delays; executing inline");
        }

        job.handle().await.map_err(QueueError::Execution)?;
        // Only successful executions count.
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    async fn process(&self) -> Result<bool> {
        // Everything already ran inline during push.
        Ok(false)
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<Value> {
        Ok(json!({
            "driver": self.config.name,
            "config": self.config.to_json(),
            "executedJobs": self.executed_count(),
            "pendingJobs": 0,
        }))
    }
}
