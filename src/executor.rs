use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::dead_letter::FailedJobHandler;
use crate::job::{Job, JobContext, JobStatus};
use crate::metrics::MetricsCollector;
use crate::middleware::{MiddlewareContext, MiddlewarePipeline, TerminalStep};

/// Delay policy applied before a retried job becomes ready again.
///
/// One explicit policy per driver config: `Fixed` replays `job.retry_delay()`
/// verbatim, `Exponential` doubles it per prior attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

impl BackoffStrategy {
    /// Delay before the next attempt, given the number of attempts already
    /// made (starting at 1 for the first failure).
    pub fn delay_for(&self, base: Duration, attempts: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let exponent = attempts.saturating_sub(1).min(16);
                base.saturating_mul(2u32.saturating_pow(exponent))
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Exponential => "exponential",
        }
    }
}

/// Immutable driver configuration. Connection details live in each driver's
/// constructor rather than in an untyped map. `max_retries` and `retry_delay`
/// apply to jobs that do not declare their own policy.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub name: String,
    pub track_metrics: bool,
    pub use_dlq: bool,
    pub use_middleware: bool,
    pub default_job_timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: BackoffStrategy,
}

impl DriverConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            track_metrics: true,
            use_dlq: true,
            use_middleware: false,
            default_job_timeout: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Fixed,
        }
    }

    pub fn track_metrics(mut self, enabled: bool) -> Self {
        self.track_metrics = enabled;
        self
    }

    pub fn use_dlq(mut self, enabled: bool) -> Self {
        self.use_dlq = enabled;
        self
    }

    pub fn use_middleware(mut self, enabled: bool) -> Self {
        self.use_middleware = enabled;
        self
    }

    pub fn default_job_timeout(mut self, timeout: Duration) -> Self {
        self.default_job_timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "trackMetrics": self.track_metrics,
            "useDlq": self.use_dlq,
            "useMiddleware": self.use_middleware,
            "defaultJobTimeoutMs": self.default_job_timeout.map(|t| t.as_millis() as u64),
            "maxRetries": self.max_retries,
            "retryDelayMs": self.retry_delay.as_millis() as u64,
            "backoff": self.backoff.as_str(),
        })
    }
}

/// Explicit three-way result of one execution attempt. Job failures never
/// escape as errors; they surface here and feed the retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// What to do with a failed or timed-out context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule after the given delay. How a reschedule is represented is
    /// driver-specific.
    Retry(Duration),
    /// Route to the dead letter store.
    DeadLetter,
}

/// Pure retry policy: retry while attempts have not exceeded the allowance
/// after the initial run. `max_retries` counts retries, not total attempts,
/// so a job with `max_retries = 2` dead-letters on its third failure.
pub fn decide_failure(
    should_retry: bool,
    attempts: u32,
    max_retries: u32,
    base_delay: Duration,
    backoff: BackoffStrategy,
) -> RetryDecision {
    if should_retry && attempts <= max_retries {
        RetryDecision::Retry(backoff.delay_for(base_delay, attempts))
    } else {
        RetryDecision::DeadLetter
    }
}

type Hook = Box<dyn Fn(&JobContext) + Send + Sync>;

/// Per-driver lifecycle callbacks, all no-op by default. `on_started` fires
/// per attempt; every failed attempt then fires exactly one of `on_retried`
/// or `on_failed` (the latter on dead-lettering).
#[derive(Default)]
pub struct LifecycleHooks {
    pub on_started: Option<Hook>,
    pub on_completed: Option<Hook>,
    pub on_failed: Option<Hook>,
    pub on_retried: Option<Hook>,
}

impl LifecycleHooks {
    pub fn on_started(mut self, hook: impl Fn(&JobContext) + Send + Sync + 'static) -> Self {
        self.on_started = Some(Box::new(hook));
        self
    }

    pub fn on_completed(mut self, hook: impl Fn(&JobContext) + Send + Sync + 'static) -> Self {
        self.on_completed = Some(Box::new(hook));
        self
    }

    pub fn on_failed(mut self, hook: impl Fn(&JobContext) + Send + Sync + 'static) -> Self {
        self.on_failed = Some(Box::new(hook));
        self
    }

    pub fn on_retried(mut self, hook: impl Fn(&JobContext) + Send + Sync + 'static) -> Self {
        self.on_retried = Some(Box::new(hook));
        self
    }
}

struct HandleJobTerminal {
    job: Arc<dyn Job>,
}

#[async_trait]
impl TerminalStep for HandleJobTerminal {
    async fn run(&self, ctx: &mut MiddlewareContext) {
        if let Err(e) = self.job.handle().await {
            ctx.fail(e);
        }
    }
}

/// Shared execution logic behind every driver's `process()`.
///
/// Drivers only decide how jobs are stored and popped, and how a
/// [`RetryDecision::Retry`] is represented in their backend; state
/// transitions, metrics, hooks and dead-lettering are identical everywhere.
pub struct JobExecutor {
    config: DriverConfig,
    metrics: Option<Arc<MetricsCollector>>,
    dead_letters: Option<FailedJobHandler>,
    middleware: MiddlewarePipeline,
    hooks: LifecycleHooks,
    counter: AtomicU64,
}

impl JobExecutor {
    pub fn new(config: DriverConfig) -> Self {
        let metrics = config
            .track_metrics
            .then(|| Arc::new(MetricsCollector::new()));
        Self {
            config,
            metrics,
            dead_letters: None,
            middleware: MiddlewarePipeline::new(),
            hooks: LifecycleHooks::default(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn with_dead_letters(mut self, handler: FailedJobHandler) -> Self {
        self.dead_letters = Some(handler);
        self
    }

    pub fn with_middleware(mut self, pipeline: MiddlewarePipeline) -> Self {
        self.middleware = pipeline;
        self
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsCollector>> {
        self.metrics.as_ref()
    }

    pub fn dead_letters(&self) -> Option<&FailedJobHandler> {
        self.dead_letters.as_ref()
    }

    /// Wrap a job in a fresh tracked context. Ids are
    /// `{driver}_{epochMillis}_{counter}` and unique per executor instance.
    pub fn next_context(&self, job: Arc<dyn Job>, delay: Option<Duration>) -> JobContext {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}_{}_{}", self.config.name, Utc::now().timestamp_millis(), seq);

        let mut ctx = JobContext::new(id, job);
        if let Some(delay) = delay {
            ctx.scheduled_for = Some(
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.job_queued(ctx.job.job_type());
        }
        debug!(job_id = %ctx.id, job_type = ctx.job.job_type(), delayed = delay.is_some(), "Job queued");
        ctx
    }

    /// Run one attempt. Transitions `pending -> processing`, bumps `attempts`
    /// and classifies the result; exactly one of the three outcomes comes
    /// back and no job error ever propagates out.
    pub async fn execute(&self, ctx: &mut JobContext) -> ExecutionOutcome {
        ctx.status = JobStatus::Processing;
        ctx.attempts += 1;
        if let Some(metrics) = &self.metrics {
            metrics.job_started();
        }
        if let Some(hook) = &self.hooks.on_started {
            hook(ctx);
        }

        let job = Arc::clone(&ctx.job);
        let job_type = job.job_type();
        let started = Instant::now();
        debug!(job_id = %ctx.id, job_type = job_type, attempt = ctx.attempts, "Executing job");

        let outcome = if self.config.use_middleware && !self.middleware.is_empty() {
            // The pipeline owns the error flag; an error after the run is
            // equivalent to a failed handle().
            let mut mctx =
                MiddlewareContext::new(job_type, job.payload(), ctx.metadata.clone());
            let terminal = HandleJobTerminal {
                job: Arc::clone(&job),
            };
            self.middleware.run(&mut mctx, &terminal).await;
            ctx.metadata = mctx.metadata;
            match mctx.error {
                Some(error) => ExecutionOutcome::Failed(error),
                None => ExecutionOutcome::Completed,
            }
        } else {
            match job.timeout().or(self.config.default_job_timeout) {
                Some(limit) => match tokio::time::timeout(limit, job.handle()).await {
                    Ok(Ok(())) => ExecutionOutcome::Completed,
                    Ok(Err(error)) => ExecutionOutcome::Failed(error),
                    Err(_) => ExecutionOutcome::TimedOut,
                },
                None => match job.handle().await {
                    Ok(()) => ExecutionOutcome::Completed,
                    Err(error) => ExecutionOutcome::Failed(error),
                },
            }
        };

        match &outcome {
            ExecutionOutcome::Completed => {
                ctx.status = JobStatus::Completed;
                if let Some(metrics) = &self.metrics {
                    metrics.job_completed(job_type, started.elapsed());
                }
                info!(job_id = %ctx.id, job_type = job_type, elapsed_ms = started.elapsed().as_millis() as u64, "Job completed");
                if let Some(hook) = &self.hooks.on_completed {
                    hook(ctx);
                }
            }
            ExecutionOutcome::Failed(error) => {
                ctx.status = JobStatus::Failed;
                ctx.error = Some(error.clone());
                ctx.stack_trace = Some(Backtrace::force_capture().to_string());
                if let Some(metrics) = &self.metrics {
                    metrics.job_failed(job_type);
                }
                warn!(job_id = %ctx.id, job_type = job_type, attempt = ctx.attempts, error = %error, "Job failed");
            }
            ExecutionOutcome::TimedOut => {
                let limit = job.timeout().or(self.config.default_job_timeout);
                ctx.status = JobStatus::TimedOut;
                ctx.error = Some(format!("Job timed out after {:?}", limit.unwrap_or_default()));
                ctx.stack_trace = Some(Backtrace::force_capture().to_string());
                if let Some(metrics) = &self.metrics {
                    metrics.job_timed_out(job_type);
                }
                warn!(job_id = %ctx.id, job_type = job_type, attempt = ctx.attempts, "Job timed out");
            }
        }

        outcome
    }

    /// Apply the retry policy to a failed or timed-out context. On `Retry`
    /// the context moves to `retrying` with `scheduled_for` pushed out; the
    /// driver then applies the reschedule in its own representation. On
    /// `DeadLetter` the failure is recorded when the config enables the DLQ.
    pub async fn handle_failure(&self, ctx: &mut JobContext) -> RetryDecision {
        let job = Arc::clone(&ctx.job);
        let decision = decide_failure(
            job.should_retry(),
            ctx.attempts,
            job.max_retries().unwrap_or(self.config.max_retries),
            job.retry_delay().unwrap_or(self.config.retry_delay),
            self.config.backoff,
        );

        match &decision {
            RetryDecision::Retry(delay) => {
                ctx.status = JobStatus::Retrying;
                ctx.scheduled_for = Some(
                    Utc::now()
                        + chrono::Duration::from_std(*delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                );
                if let Some(metrics) = &self.metrics {
                    metrics.job_retried(job.job_type());
                }
                info!(
                    job_id = %ctx.id,
                    job_type = job.job_type(),
                    attempt = ctx.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying job"
                );
                if let Some(hook) = &self.hooks.on_retried {
                    hook(ctx);
                }
            }
            RetryDecision::DeadLetter => {
                ctx.status = JobStatus::DeadLettered;
                if self.config.use_dlq {
                    if let Some(handler) = &self.dead_letters {
                        let result = handler
                            .record_failure(
                                &ctx.id,
                                job.job_type(),
                                job.payload(),
                                ctx.error.as_deref().unwrap_or("unknown error"),
                                ctx.stack_trace.clone(),
                                ctx.attempts,
                                ctx.metadata.clone(),
                            )
                            .await;
                        if let Err(e) = result {
                            warn!(job_id = %ctx.id, error = %e, "Failed to record dead letter");
                        }
                    }
                }
                if let Some(hook) = &self.hooks.on_failed {
                    hook(ctx);
                }
            }
        }

        decision
    }

    /// `{driver, config, metrics?, deadLetters?}` — the shared half of every
    /// driver's stats payload. Drivers merge their backend-specific keys in.
    pub async fn stats(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("driver".into(), json!(self.config.name));
        map.insert("config".into(), self.config.to_json());
        if let Some(metrics) = &self.metrics {
            map.insert("metrics".into(), metrics.to_json());
        }
        if let Some(handler) = &self.dead_letters {
            if let Ok(stats) = handler.store().stats().await {
                map.insert("deadLetters".into(), stats);
            }
        }
        Value::Object(map)
    }
}
