use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::dead_letter::{DeadLetterStore, FailedJobHandler, MemoryDeadLetterStore};
use crate::driver::QueueDriver;
use crate::error::Result;
use crate::executor::{DriverConfig, ExecutionOutcome, JobExecutor, LifecycleHooks};
use crate::job::{Job, JobContext, JobStatus};
use crate::middleware::MiddlewarePipeline;
use crate::registry::JobRegistry;

#[derive(Default)]
struct MemoryState {
    jobs: Vec<JobContext>,
    in_flight: HashSet<String>,
}

/// Queue driver backed by an ordered in-process list of contexts.
///
/// Ordering is approximately FIFO among ready jobs: delayed jobs are skipped
/// in place, not reordered. The list is only touched by this driver's own
/// `push`/`process`/`clear`, and the driver is intra-process only — nothing
/// here survives a restart or coordinates across processes.
pub struct MemoryDriver {
    executor: JobExecutor,
    state: Mutex<MemoryState>,
}

impl MemoryDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self::with_registry(config, Arc::new(JobRegistry::new()))
    }

    /// A registry is only needed so the dead letter handler can re-hydrate
    /// jobs for replay; execution itself never deserializes.
    pub fn with_registry(config: DriverConfig, registry: Arc<JobRegistry>) -> Self {
        let store: Arc<dyn DeadLetterStore> = Arc::new(MemoryDeadLetterStore::new());
        Self::with_dead_letter_store(config, registry, store)
    }

    pub fn with_dead_letter_store(
        config: DriverConfig,
        registry: Arc<JobRegistry>,
        store: Arc<dyn DeadLetterStore>,
    ) -> Self {
        let mut executor = JobExecutor::new(config.clone());
        if config.use_dlq {
            executor = executor.with_dead_letters(FailedJobHandler::new(store, registry));
        }
        Self {
            executor,
            state: Mutex::new(MemoryState::default()),
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

    /// Jobs still queued, including delayed and retrying ones.
    pub async fn pending_jobs_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    fn record_depth(&self, depth: usize) {
        if let Some(metrics) = self.executor.metrics() {
            metrics.record_queue_depth(depth as u64);
        }
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    async fn push(&self, job: Arc<dyn Job>, delay: Option<Duration>) -> Result<String> {
        let ctx = self.executor.next_context(job, delay);
        let id = ctx.id.clone();

        let mut state = self.state.lock().await;
        state.jobs.push(ctx);
        self.record_depth(state.jobs.len());
        Ok(id)
    }

    async fn process(&self) -> Result<bool> {
        // Claim the first ready, unclaimed context.
        let mut ctx = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let claimed = {
                let in_flight = &state.in_flight;
                state
                    .jobs
                    .iter()
                    .position(|c| c.is_ready(now) && !in_flight.contains(&c.id))
            };
            match claimed {
                Some(index) => {
                    let ctx = state.jobs[index].clone();
                    state.in_flight.insert(ctx.id.clone());
                    ctx
                }
                None => return Ok(false),
            }
        };

        let outcome = self.executor.execute(&mut ctx).await;
        if !matches!(outcome, ExecutionOutcome::Completed) {
            self.executor.handle_failure(&mut ctx).await;
        }

        let mut state = self.state.lock().await;
        state.in_flight.remove(&ctx.id);
        if ctx.is_terminal() {
            state.jobs.retain(|c| c.id != ctx.id);
        } else {
            // Rescheduled retry: back to pending in place, keeping its slot
            // so ready-job ordering stays stable.
            ctx.status = JobStatus::Pending;
            if let Some(slot) = state.jobs.iter_mut().find(|c| c.id == ctx.id) {
                *slot = ctx;
            }
        }
        self.record_depth(state.jobs.len());
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.jobs.clear();
        state.in_flight.clear();
        self.record_depth(0);
        Ok(())
    }

    async fn stats(&self) -> Result<Value> {
        let pending = self.pending_jobs_count().await;
        let mut stats = self.executor.stats().await;
        if let Value::Object(map) = &mut stats {
            map.insert("pendingJobs".into(), json!(pending));
        }
        Ok(stats)
    }
}
