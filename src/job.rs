use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::QueueError;

/// Key-value payload carried by every job. Must round-trip through the
/// [`JobRegistry`](crate::JobRegistry) for drivers that persist jobs.
pub type Payload = Map<String, Value>;

/// A unit of deferred work.
///
/// Implementations declare a stable type identifier, a serializable payload
/// and the work itself. The policy methods all have defaults and only need
/// to be overridden when a job deviates from them.
///
/// # Example
/// ```ignore
/// struct SendEmail { to: String }
///
/// #[async_trait]
/// impl Job for SendEmail {
///     fn job_type(&self) -> &'static str { "send_email" }
///
///     fn payload(&self) -> Payload {
///         let mut map = Payload::new();
///         map.insert("to".into(), self.to.clone().into());
///         map
///     }
///
///     async fn handle(&self) -> Result<(), String> {
///         send(&self.to).await.map_err(|e| e.to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable identifier for this job kind. Deliberately a declared constant
    /// rather than anything derived from the Rust type name, so persisted
    /// payloads survive refactors.
    fn job_type(&self) -> &'static str;

    /// Serialize this job to a key-value payload. For registered job types,
    /// `registry.create(job_type, payload)` must yield an equivalent job.
    fn payload(&self) -> Payload;

    /// Perform the work.
    async fn handle(&self) -> std::result::Result<(), String>;

    /// How many retries are allowed after the initial attempt. `None` defers
    /// to the driver config.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// Base delay before a failed attempt becomes ready again. `None` defers
    /// to the driver config.
    fn retry_delay(&self) -> Option<Duration> {
        None
    }

    /// Per-job execution deadline. `None` defers to the driver config.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether a failed attempt should be retried at all.
    fn should_retry(&self) -> bool {
        true
    }

    /// Logical queue this job belongs to.
    fn queue(&self) -> &str {
        "default"
    }
}

/// Current state of a tracked job. Transitions only move forward:
///
/// ```text
/// pending -> processing -> completed
/// pending -> processing -> failed|timedOut -> retrying -> pending
/// pending -> processing -> failed|timedOut -> deadLettered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    TimedOut,
    Retrying,
    DeadLettered,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timedOut",
            JobStatus::Retrying => "retrying",
            JobStatus::DeadLettered => "deadLettered",
        }
    }

    /// Whether no further transition can happen from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "timedOut" => Ok(JobStatus::TimedOut),
            "retrying" => Ok(JobStatus::Retrying),
            "deadLettered" => Ok(JobStatus::DeadLettered),
            _ => Err(QueueError::InvalidState(format!("Unknown job status: {}", s))),
        }
    }
}

/// Engine-owned wrapper around a [`Job`] carrying scheduling, attempt and
/// error state. `attempts` never decreases; a context whose `scheduled_for`
/// lies in the future is never handed to `handle()`.
#[derive(Clone)]
pub struct JobContext {
    pub id: String,
    pub job: Arc<dyn Job>,
    pub queued_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub status: JobStatus,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub metadata: Payload,
}

impl JobContext {
    pub fn new(id: String, job: Arc<dyn Job>) -> Self {
        Self {
            id,
            job,
            queued_at: Utc::now(),
            scheduled_for: None,
            attempts: 0,
            status: JobStatus::Pending,
            error: None,
            stack_trace: None,
            metadata: Payload::new(),
        }
    }

    /// A context with no schedule, or one whose schedule has elapsed, is
    /// ready for execution.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(true, |at| now >= at)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.id)
            .field("job_type", &self.job.job_type())
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .field("scheduled_for", &self.scheduled_for)
            .field("error", &self.error)
            .finish()
    }
}

/// Persisted record of a permanently failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub id: String,
    pub job_type: String,
    pub payload: Payload,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub metadata: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        fn job_type(&self) -> &'static str {
            "noop"
        }

        fn payload(&self) -> Payload {
            Payload::new()
        }

        async fn handle(&self) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::TimedOut,
            JobStatus::Retrying,
            JobStatus::DeadLettered,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("cancelled").is_err());
    }

    #[test]
    fn only_completed_and_dead_lettered_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::TimedOut.is_terminal());
    }

    #[test]
    fn readiness_follows_schedule() {
        let mut ctx = JobContext::new("t_1".into(), Arc::new(Noop));
        let now = Utc::now();
        assert!(ctx.is_ready(now));

        ctx.scheduled_for = Some(now + chrono::Duration::seconds(10));
        assert!(!ctx.is_ready(now));
        assert!(ctx.is_ready(now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn default_policy_defers_to_driver_config() {
        let job = Noop;
        assert!(job.max_retries().is_none());
        assert!(job.retry_delay().is_none());
        assert!(job.timeout().is_none());
        assert!(job.should_retry());
        assert_eq!(job.queue(), "default");
    }
}
