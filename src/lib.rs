//! Background job queue engine with pluggable storage drivers.
//!
//! Jobs implement the [`Job`] trait; drivers decide how they are queued,
//! made durable and popped; retry, timeout, metrics and dead-letter behavior
//! is shared across every driver. Concurrency comes from running several
//! worker loops (or, for Redis, several processes) against one queue.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use async_trait::async_trait;
//! use dispatchq::{
//!     DriverConfig, Job, MemoryDriver, Payload, QueueDriver, WorkerLoop, WorkerOptions,
//! };
//!
//! struct SendEmail {
//!     to: String,
//! }
//!
//! #[async_trait]
//! impl Job for SendEmail {
//!     fn job_type(&self) -> &'static str {
//!         "send_email"
//!     }
//!
//!     fn payload(&self) -> Payload {
//!         let mut map = Payload::new();
//!         map.insert("to".into(), self.to.clone().into());
//!         map
//!     }
//!
//!     async fn handle(&self) -> Result<(), String> {
//!         println!("Sending email to {}", self.to);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = Arc::new(MemoryDriver::new(DriverConfig::new("memory")));
//!
//!     driver
//!         .push(Arc::new(SendEmail { to: "user@example.com".into() }), None)
//!         .await?;
//!
//!     let worker = WorkerLoop::new(
//!         driver,
//!         WorkerOptions {
//!             max_jobs: Some(10),
//!             delay: Duration::from_millis(50),
//!             ..WorkerOptions::default()
//!         },
//!     );
//!     worker.start().await;
//!
//!     Ok(())
//! }
//! ```

mod dead_letter;
mod driver;
mod error;
mod executor;
mod job;
mod metrics;
mod middleware;
mod registry;
mod worker;

pub use dead_letter::{DeadLetterStore, FailedJobHandler, MemoryDeadLetterStore};
pub use driver::{FileDriver, MemoryDriver, QueueDriver, RedisDriver, SyncDriver};
pub use error::{QueueError, Result};
pub use executor::{
    decide_failure, BackoffStrategy, DriverConfig, ExecutionOutcome, JobExecutor, LifecycleHooks,
    RetryDecision,
};
pub use job::{FailedJob, Job, JobContext, JobStatus, Payload};
pub use metrics::{MetricsCollector, TypeCounters};
pub use middleware::{JobMiddleware, MiddlewareContext, MiddlewarePipeline, Next, TerminalStep};
pub use registry::{JobFactory, JobRegistry};
pub use worker::{WorkerLoop, WorkerOptions};
