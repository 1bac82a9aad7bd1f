use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

/// Per-job-type counter breakdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeCounters {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub timed_out: u64,
}

/// Counters and gauges describing queue health.
///
/// All recording methods take `&self` and are cheap enough to call from the
/// execution hot path. Derived rates are computed lazily on read.
pub struct MetricsCollector {
    queued: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    queue_depth: AtomicU64,
    total_processing_ms: AtomicU64,
    per_type: RwLock<HashMap<String, TypeCounters>>,
    born_at: RwLock<Instant>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            queued: AtomicU64::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            total_processing_ms: AtomicU64::new(0),
            per_type: RwLock::new(HashMap::new()),
            born_at: RwLock::new(Instant::now()),
        }
    }

    fn with_type<F: FnOnce(&mut TypeCounters)>(&self, job_type: &str, f: F) {
        let mut per_type = self.per_type.write().unwrap_or_else(|e| e.into_inner());
        f(per_type.entry(job_type.to_string()).or_default());
    }

    pub fn job_queued(&self, job_type: &str) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |c| c.queued += 1);
    }

    pub fn job_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self, job_type: &str, duration: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.with_type(job_type, |c| c.completed += 1);
    }

    pub fn job_failed(&self, job_type: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |c| c.failed += 1);
    }

    pub fn job_retried(&self, job_type: &str) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |c| c.retried += 1);
    }

    pub fn job_timed_out(&self, job_type: &str) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |c| c.timed_out += 1);
    }

    pub fn record_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Fraction of finished jobs that completed, 0 when nothing finished yet.
    pub fn success_rate(&self) -> f64 {
        let completed = self.completed() as f64;
        let finished = completed + self.failed() as f64;
        if finished == 0.0 {
            0.0
        } else {
            completed / finished
        }
    }

    /// Fraction of finished jobs that failed, 0 when nothing finished yet.
    pub fn failure_rate(&self) -> f64 {
        let failed = self.failed() as f64;
        let finished = failed + self.completed() as f64;
        if finished == 0.0 {
            0.0
        } else {
            failed / finished
        }
    }

    /// Mean wall-clock duration of completed jobs.
    pub fn average_processing_time(&self) -> Duration {
        let completed = self.completed();
        if completed == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_processing_ms.load(Ordering::Relaxed) / completed)
    }

    /// Completed jobs per second over the collector's lifetime.
    pub fn throughput(&self) -> f64 {
        let born_at = *self.born_at.read().unwrap_or_else(|e| e.into_inner());
        let elapsed = born_at.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.completed() as f64 / elapsed
        }
    }

    /// Zero every counter and restart the throughput window.
    pub fn reset(&self) {
        self.queued.store(0, Ordering::Relaxed);
        self.started.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.retried.store(0, Ordering::Relaxed);
        self.timed_out.store(0, Ordering::Relaxed);
        self.queue_depth.store(0, Ordering::Relaxed);
        self.total_processing_ms.store(0, Ordering::Relaxed);
        self.per_type
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.born_at.write().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn per_type(&self) -> HashMap<String, TypeCounters> {
        self.per_type
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn to_json(&self) -> Value {
        let per_type: serde_json::Map<String, Value> = self
            .per_type()
            .into_iter()
            .map(|(job_type, c)| {
                (
                    job_type,
                    json!({
                        "queued": c.queued,
                        "completed": c.completed,
                        "failed": c.failed,
                        "retried": c.retried,
                        "timedOut": c.timed_out,
                    }),
                )
            })
            .collect();

        json!({
            "queued": self.queued(),
            "started": self.started(),
            "completed": self.completed(),
            "failed": self.failed(),
            "retried": self.retried(),
            "timedOut": self.timed_out(),
            "queueDepth": self.queue_depth(),
            "successRate": self.success_rate(),
            "failureRate": self.failure_rate(),
            "averageProcessingTimeMs": self.average_processing_time().as_millis() as u64,
            "throughputPerSecond": self.throughput(),
            "byType": per_type,
        })
    }
}
