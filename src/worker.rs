use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::driver::QueueDriver;
use crate::error::QueueError;

/// Polling policy for a [`WorkerLoop`].
#[derive(Clone)]
pub struct WorkerOptions {
    /// Stop after this many polling iterations. `None` runs until cancelled.
    pub max_jobs: Option<u64>,
    /// Sleep between polling iterations.
    pub delay: Duration,
    /// Stop once this much wall-clock time has elapsed.
    pub timeout: Option<Duration>,
    /// When set, `start()` returns immediately and the loop continues in a
    /// spawned task.
    pub run_in_background: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_jobs: None,
            delay: Duration::from_millis(500),
            timeout: None,
            run_in_background: false,
        }
    }
}

type ErrorHook = Box<dyn Fn(&QueueError) + Send + Sync>;

/// Drives a driver's `process()` repeatedly under a policy.
///
/// Errors out of `process()` are reported and never stop the loop; only the
/// policy limits (or cancellation) do.
pub struct WorkerLoop {
    driver: Arc<dyn QueueDriver>,
    options: WorkerOptions,
    on_error: Option<ErrorHook>,
    shutdown: CancellationToken,
    worker_id: String,
}

impl WorkerLoop {
    pub fn new(driver: Arc<dyn QueueDriver>, options: WorkerOptions) -> Self {
        Self {
            driver,
            options,
            on_error: None,
            shutdown: CancellationToken::new(),
            worker_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn on_error(mut self, hook: impl Fn(&QueueError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Token for external shutdown control.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run per the configured policy. Inline unless `run_in_background` is
    /// set, in which case the returned handle resolves to the iteration
    /// count once the loop stops.
    pub async fn start(self) -> Option<JoinHandle<u64>> {
        if self.options.run_in_background {
            Some(tokio::spawn(async move { self.run().await }))
        } else {
            self.run().await;
            None
        }
    }

    /// The polling loop itself. Returns the number of iterations run.
    pub async fn run(&self) -> u64 {
        info!(worker_id = %self.worker_id, "Worker started");
        let started = Instant::now();
        let mut iterations: u64 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Some(max) = self.options.max_jobs {
                if iterations >= max {
                    debug!(worker_id = %self.worker_id, iterations, "Worker reached max jobs");
                    break;
                }
            }
            if let Some(timeout) = self.options.timeout {
                if started.elapsed() >= timeout {
                    debug!(worker_id = %self.worker_id, "Worker time budget exhausted");
                    break;
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.driver.process() => {
                    if let Err(e) = result {
                        error!(worker_id = %self.worker_id, error = %e, "Failed to process job");
                        if let Some(hook) = &self.on_error {
                            hook(&e);
                        }
                    }
                }
            }
            iterations += 1;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.delay) => {}
            }
        }

        info!(worker_id = %self.worker_id, iterations, "Worker stopped");
        iterations
    }

    /// Trigger graceful shutdown of this loop (and any clones of its token).
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
