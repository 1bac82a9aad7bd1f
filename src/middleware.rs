use std::sync::Arc;

use async_trait::async_trait;

use crate::job::Payload;

/// Shared state handed through the middleware chain. Setting `error` without
/// calling the continuation short-circuits the pipeline; the executor treats
/// a pipeline that finishes with an error exactly like a failed `handle()`.
#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    pub job_type: String,
    pub payload: Payload,
    pub metadata: Payload,
    pub error: Option<String>,
}

impl MiddlewareContext {
    pub fn new(job_type: impl Into<String>, payload: Payload, metadata: Payload) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            metadata,
            error: None,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Mark this execution as failed.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }
}

/// Innermost step of the chain, normally the actual job execution.
#[async_trait]
pub trait TerminalStep: Send + Sync {
    async fn run(&self, ctx: &mut MiddlewareContext);
}

/// Cross-cutting wrapper around job execution (validation, rate limiting,
/// tracing spans). Call `next.run(ctx)` to continue the chain, or skip it to
/// short-circuit.
#[async_trait]
pub trait JobMiddleware: Send + Sync {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>);
}

/// The remaining middleware chain plus the terminal execution step.
pub struct Next<'a> {
    rest: &'a [Arc<dyn JobMiddleware>],
    terminal: &'a dyn TerminalStep,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut MiddlewareContext) {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .handle(
                        ctx,
                        Next {
                            rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => self.terminal.run(ctx).await,
        }
    }
}

/// Ordered middleware chain, executed first-to-last around every job.
#[derive(Default, Clone)]
pub struct MiddlewarePipeline {
    layers: Vec<Arc<dyn JobMiddleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(mut self, middleware: Arc<dyn JobMiddleware>) -> Self {
        self.layers.push(middleware);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub async fn run(&self, ctx: &mut MiddlewareContext, terminal: &dyn TerminalStep) {
        Next {
            rest: &self.layers,
            terminal,
        }
        .run(ctx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl JobMiddleware for Recorder {
        async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) {
            self.log.lock().unwrap().push(format!("{}:before", self.tag));
            next.run(ctx).await;
            self.log.lock().unwrap().push(format!("{}:after", self.tag));
        }
    }

    struct Reject;

    #[async_trait]
    impl JobMiddleware for Reject {
        async fn handle(&self, ctx: &mut MiddlewareContext, _next: Next<'_>) {
            ctx.fail("payload rejected");
            // deliberately no next.run: short-circuit
        }
    }

    struct CountingTerminal {
        executed: AtomicUsize,
    }

    #[async_trait]
    impl TerminalStep for CountingTerminal {
        async fn run(&self, _ctx: &mut MiddlewareContext) {
            self.executed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn layers_run_first_to_last_around_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new()
            .layer(Arc::new(Recorder {
                tag: "outer",
                log: Arc::clone(&log),
            }))
            .layer(Arc::new(Recorder {
                tag: "inner",
                log: Arc::clone(&log),
            }));

        let terminal = CountingTerminal {
            executed: AtomicUsize::new(0),
        };
        let mut ctx = MiddlewareContext::new("t", Payload::new(), Payload::new());
        pipeline.run(&mut ctx, &terminal).await;

        assert_eq!(terminal.executed.load(Ordering::SeqCst), 1);
        assert!(!ctx.has_error());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        let pipeline = MiddlewarePipeline::new().layer(Arc::new(Reject));

        let terminal = CountingTerminal {
            executed: AtomicUsize::new(0),
        };
        let mut ctx = MiddlewareContext::new("t", Payload::new(), Payload::new());
        pipeline.run(&mut ctx, &terminal).await;

        assert_eq!(terminal.executed.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.error.as_deref(), Some("payload rejected"));
    }
}
