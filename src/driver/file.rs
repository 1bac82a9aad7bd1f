use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::dead_letter::{DeadLetterStore, FailedJobHandler, MemoryDeadLetterStore};
use crate::driver::QueueDriver;
use crate::error::Result;
use crate::executor::{DriverConfig, ExecutionOutcome, JobExecutor, LifecycleHooks};
use crate::job::{Job, JobContext, JobStatus, Payload};
use crate::middleware::MiddlewarePipeline;
use crate::registry::JobRegistry;

/// One element of the on-disk JSON array.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskRecord {
    id: String,
    #[serde(rename = "type")]
    job_type: String,
    payload: Payload,
    scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    attempts: u32,
    max_retries: u32,
}

impl DiskRecord {
    fn from_context(ctx: &JobContext, config: &DriverConfig) -> Self {
        Self {
            id: ctx.id.clone(),
            job_type: ctx.job.job_type().to_string(),
            payload: ctx.job.payload(),
            scheduled_at: ctx.scheduled_for,
            created_at: ctx.queued_at,
            attempts: ctx.attempts,
            max_retries: ctx.job.max_retries().unwrap_or(config.max_retries),
        }
    }
}

/// Queue driver that keeps the job list in memory and mirrors it to a JSON
/// array on disk after every mutation.
///
/// The whole load -> mutate -> persist cycle (including execution) runs under
/// one lock, so multiple worker loops inside one process are safe. The cycle
/// is still a non-atomic read-modify-write over the whole file: concurrent
/// access from more than one OS process is not supported.
pub struct FileDriver {
    executor: JobExecutor,
    registry: Arc<JobRegistry>,
    path: PathBuf,
    state: Mutex<Vec<JobContext>>,
}

impl FileDriver {
    pub fn new(
        config: DriverConfig,
        path: impl Into<PathBuf>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        let store: Arc<dyn DeadLetterStore> = Arc::new(MemoryDeadLetterStore::new());
        Self::with_dead_letter_store(config, path, registry, store)
    }

    pub fn with_dead_letter_store(
        config: DriverConfig,
        path: impl Into<PathBuf>,
        registry: Arc<JobRegistry>,
        store: Arc<dyn DeadLetterStore>,
    ) -> Self {
        let mut executor = JobExecutor::new(config.clone());
        if config.use_dlq {
            executor =
                executor.with_dead_letters(FailedJobHandler::new(store, Arc::clone(&registry)));
        }
        Self {
            executor,
            registry,
            path: path.into(),
            state: Mutex::new(Vec::new()),
        }
    }

    pub fn with_middleware(mut self, pipeline: MiddlewarePipeline) -> Self {
        self.executor = self.executor.with_middleware(pipeline);
        self
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.executor = self.executor.with_hooks(hooks);
        self
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub async fn pending_jobs_count(&self) -> usize {
        self.state.lock().await.len()
    }

    async fn persist(&self, jobs: &[JobContext]) -> Result<()> {
        let records: Vec<DiskRecord> = jobs
            .iter()
            .map(|ctx| DiskRecord::from_context(ctx, self.executor.config()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&records)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    /// Re-hydrate the in-memory list from disk. Records whose job type is no
    /// longer registered cannot be executed; they go to the dead letter store
    /// instead of wedging the queue.
    async fn reload(&self, jobs: &mut Vec<JobContext>) -> Result<()> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(());
        }

        let records: Vec<DiskRecord> = serde_json::from_slice(&bytes)?;
        debug!(path = %self.path.display(), records = records.len(), "Reloading jobs from disk");

        for record in records {
            match self.registry.create(&record.job_type, record.payload.clone()) {
                Ok(job) => {
                    let mut ctx = JobContext::new(record.id, job);
                    ctx.queued_at = record.created_at;
                    ctx.scheduled_for = record.scheduled_at;
                    ctx.attempts = record.attempts;
                    jobs.push(ctx);
                }
                Err(e) => {
                    warn!(job_id = %record.id, job_type = %record.job_type, error = %e, "Cannot re-hydrate job from disk");
                    if let Some(handler) = self.executor.dead_letters() {
                        let _ = handler
                            .record_failure(
                                &record.id,
                                &record.job_type,
                                record.payload,
                                &e.to_string(),
                                None,
                                record.attempts,
                                Payload::new(),
                            )
                            .await;
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueDriver for FileDriver {
    async fn push(&self, job: Arc<dyn Job>, delay: Option<Duration>) -> Result<String> {
        let mut jobs = self.state.lock().await;
        if jobs.is_empty() {
            self.reload(&mut jobs).await?;
        }

        let ctx = self.executor.next_context(job, delay);
        let id = ctx.id.clone();
        jobs.push(ctx);
        self.persist(&jobs).await?;

        if let Some(metrics) = self.executor.metrics() {
            metrics.record_queue_depth(jobs.len() as u64);
        }
        Ok(id)
    }

    async fn process(&self) -> Result<bool> {
        let mut jobs = self.state.lock().await;
        if jobs.is_empty() {
            self.reload(&mut jobs).await?;
            self.persist(&jobs).await?;
        }

        let now = Utc::now();
        let index = match jobs.iter().position(|c| c.is_ready(now)) {
            Some(index) => index,
            None => return Ok(false),
        };

        let mut ctx = jobs[index].clone();
        let outcome = self.executor.execute(&mut ctx).await;
        if !matches!(outcome, ExecutionOutcome::Completed) {
            self.executor.handle_failure(&mut ctx).await;
        }

        if ctx.is_terminal() {
            jobs.remove(index);
        } else {
            ctx.status = JobStatus::Pending;
            jobs[index] = ctx;
        }
        self.persist(&jobs).await?;

        if let Some(metrics) = self.executor.metrics() {
            metrics.record_queue_depth(jobs.len() as u64);
        }
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        let mut jobs = self.state.lock().await;
        jobs.clear();
        self.persist(&jobs).await?;
        if let Some(metrics) = self.executor.metrics() {
            metrics.record_queue_depth(0);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<Value> {
        let pending = self.pending_jobs_count().await;
        let mut stats = self.executor.stats().await;
        if let Value::Object(map) = &mut stats {
            map.insert("pendingJobs".into(), json!(pending));
            map.insert("path".into(), json!(self.path.display().to_string()));
        }
        Ok(stats)
    }
}
