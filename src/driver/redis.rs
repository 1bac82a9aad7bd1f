use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::dead_letter::{DeadLetterStore, FailedJobHandler, MemoryDeadLetterStore};
use crate::driver::QueueDriver;
use crate::error::{QueueError, Result};
use crate::executor::{DriverConfig, ExecutionOutcome, JobExecutor, LifecycleHooks, RetryDecision};
use crate::job::{Job, JobContext, Payload};
use crate::middleware::MiddlewarePipeline;
use crate::registry::JobRegistry;

/// Delayed entries promoted into the ready list per `process()` call.
const PROMOTE_BATCH: usize = 10;
/// Blocking-pop timeout in seconds.
const POP_TIMEOUT_SECS: usize = 1;

/// JSON envelope stored in the Redis lists and sorted set.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Payload,
    pub attempts: u32,
    pub max_retries: u32,
    pub queued_at: DateTime<Utc>,
}

impl Envelope {
    fn from_context(ctx: &JobContext, config: &DriverConfig) -> Self {
        Self {
            id: ctx.id.clone(),
            job_type: ctx.job.job_type().to_string(),
            payload: ctx.job.payload(),
            attempts: ctx.attempts,
            max_retries: ctx.job.max_retries().unwrap_or(config.max_retries),
            queued_at: ctx.queued_at,
        }
    }
}

/// Queue driver backed by Redis. Per queue name `Q` it uses four keys:
/// `queue:Q` (ready list), `queue:Q:delayed` (sorted set scored by
/// ready-epoch-millis), `queue:Q:processing` (in-flight hash) and
/// `queue:Q:failed` (permanently failed envelopes).
///
/// Redis' per-command atomicity makes this driver safe for multiple worker
/// processes against the same queue; no application-level locking is needed.
pub struct RedisDriver {
    executor: JobExecutor,
    registry: Arc<JobRegistry>,
    pool: Pool,
    queue: String,
}

impl RedisDriver {
    pub fn new(
        config: DriverConfig,
        redis_url: &str,
        queue: impl Into<String>,
        registry: Arc<JobRegistry>,
    ) -> Result<Self> {
        let store: Arc<dyn DeadLetterStore> = Arc::new(MemoryDeadLetterStore::new());
        Self::with_dead_letter_store(config, redis_url, queue, registry, store)
    }

    pub fn with_dead_letter_store(
        config: DriverConfig,
        redis_url: &str,
        queue: impl Into<String>,
        registry: Arc<JobRegistry>,
        store: Arc<dyn DeadLetterStore>,
    ) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let mut executor = JobExecutor::new(config.clone());
        if config.use_dlq {
            executor =
                executor.with_dead_letters(FailedJobHandler::new(store, Arc::clone(&registry)));
        }
        Ok(Self {
            executor,
            registry,
            pool,
            queue: queue.into(),
        })
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

    fn ready_key(&self) -> String {
        format!("queue:{}", self.queue)
    }

    fn delayed_key(&self) -> String {
        format!("queue:{}:delayed", self.queue)
    }

    fn processing_key(&self) -> String {
        format!("queue:{}:processing", self.queue)
    }

    fn failed_key(&self) -> String {
        format!("queue:{}:failed", self.queue)
    }

    /// Move due delayed entries into the ready list, bounded per call.
    async fn promote_delayed(&self, conn: &mut Connection) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await?;

        if due.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for member in &due {
            pipe.zrem(self.delayed_key(), member);
            pipe.lpush(self.ready_key(), member);
        }
        let _: () = pipe.query_async(conn).await?;
        debug!(queue = %self.queue, promoted = due.len(), "Promoted delayed jobs");
        Ok(())
    }

    /// Append a raw envelope to the failed list.
    async fn push_failed(&self, conn: &mut Connection, raw: &str) -> Result<()> {
        let _: () = conn.lpush(self.failed_key(), raw).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueDriver for RedisDriver {
    async fn push(&self, job: Arc<dyn Job>, delay: Option<Duration>) -> Result<String> {
        let ctx = self.executor.next_context(job, delay);
        let envelope = serde_json::to_string(&Envelope::from_context(&ctx, self.executor.config()))?;

        let mut conn = self.pool.get().await?;
        match ctx.scheduled_for {
            Some(ready_at) => {
                let _: () = conn
                    .zadd(self.delayed_key(), envelope, ready_at.timestamp_millis())
                    .await?;
            }
            None => {
                let _: () = conn.lpush(self.ready_key(), envelope).await?;
            }
        }
        Ok(ctx.id)
    }

    async fn process(&self) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        self.promote_delayed(&mut conn).await?;

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(self.ready_key())
            .arg(POP_TIMEOUT_SECS)
            .query_async(&mut conn)
            .await?;
        let raw = match popped {
            Some((_key, raw)) => raw,
            None => return Ok(false),
        };

        let envelope: Envelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Dropping malformed job envelope");
                self.push_failed(&mut conn, &raw).await?;
                return Ok(true);
            }
        };

        // In-flight visibility while executing.
        let _: () = conn
            .hset(self.processing_key(), &envelope.id, &raw)
            .await?;

        // An unregistered type is a failure of that one job, not a crash of
        // the worker loop.
        let job = match self.registry.create(&envelope.job_type, envelope.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %envelope.id, job_type = %envelope.job_type, error = %e, "Cannot deserialize job");
                if let Some(handler) = self.executor.dead_letters() {
                    let _ = handler
                        .record_failure(
                            &envelope.id,
                            &envelope.job_type,
                            envelope.payload.clone(),
                            &e.to_string(),
                            None,
                            envelope.attempts,
                            Payload::new(),
                        )
                        .await;
                }
                self.push_failed(&mut conn, &raw).await?;
                let _: () = conn.hdel(self.processing_key(), &envelope.id).await?;
                return Ok(true);
            }
        };

        let mut ctx = JobContext::new(envelope.id.clone(), job);
        ctx.queued_at = envelope.queued_at;
        ctx.attempts = envelope.attempts;

        let outcome = self.executor.execute(&mut ctx).await;
        if !matches!(outcome, ExecutionOutcome::Completed) {
            match self.executor.handle_failure(&mut ctx).await {
                RetryDecision::Retry(_delay) => {
                    // Reschedule: back into the delayed set, scored by the
                    // ready time the executor already computed.
                    let retry_envelope =
                        serde_json::to_string(&Envelope::from_context(&ctx, self.executor.config()))?;
                    let score = ctx
                        .scheduled_for
                        .map(|at| at.timestamp_millis())
                        .unwrap_or_else(|| Utc::now().timestamp_millis());
                    let _: () = conn.zadd(self.delayed_key(), retry_envelope, score).await?;
                }
                RetryDecision::DeadLetter => {
                    let failed_envelope =
                        serde_json::to_string(&Envelope::from_context(&ctx, self.executor.config()))?;
                    self.push_failed(&mut conn, &failed_envelope).await?;
                }
            }
        }

        // Always release in-flight visibility, whatever the outcome.
        let _: () = conn.hdel(self.processing_key(), &ctx.id).await?;
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn
            .del((
                self.ready_key(),
                self.delayed_key(),
                self.processing_key(),
                self.failed_key(),
            ))
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<Value> {
        let mut stats = self.executor.stats().await;

        let queue_stats = match self.pool.get().await {
            Ok(mut conn) => {
                let ready: usize = conn.llen(self.ready_key()).await.unwrap_or(0);
                let delayed: usize = conn.zcard(self.delayed_key()).await.unwrap_or(0);
                let processing: usize = conn.hlen(self.processing_key()).await.unwrap_or(0);
                let failed: usize = conn.llen(self.failed_key()).await.unwrap_or(0);
                json!({
                    "connection": "connected",
                    "queue": {
                        "name": self.queue,
                        "ready": ready,
                        "delayed": delayed,
                        "processing": processing,
                        "failed": failed,
                        "pendingJobs": ready + delayed,
                    },
                })
            }
            Err(e) => json!({ "connection": format!("error: {}", e) }),
        };

        if let (Value::Object(map), Value::Object(extra)) = (&mut stats, queue_stats) {
            map.extend(extra);
        }
        Ok(stats)
    }

    async fn is_healthy(&self) -> bool {
        match self.pool.get().await {
            Ok(mut conn) => redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .is_ok(),
            Err(_) => false,
        }
    }
}
