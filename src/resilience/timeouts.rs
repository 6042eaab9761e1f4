//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound the wall-clock duration of a single attempt
//! - Cancel the attempt when its deadline fires
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; every invocation gets a fresh deadline
//! - Timeout errors are distinct from other errors
//! - Cancellation is best effort: the attempt's future is dropped, but any
//!   work it spawned keeps running until it notices on its own

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::observability::events::{default_sink, EventSink, ResilienceEvent};
use crate::pipeline::chain::{BoxFuture, Middleware, Next};
use crate::resilience::error::{Outcome, ResilienceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub timeout: Duration,
}

impl TimeoutConfig {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Stateless deadline around one attempt.
#[derive(Debug)]
pub struct Timeout {
    resource: String,
    config: TimeoutConfig,
    sink: Arc<dyn EventSink>,
}

impl Timeout {
    pub fn new(resource: impl Into<String>, config: TimeoutConfig) -> Self {
        Self {
            resource: resource.into(),
            config,
            sink: default_sink(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn duration(&self) -> Duration {
        self.config.timeout
    }

    /// Race `op` against the deadline.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        match tokio::time::timeout(self.config.timeout, op()).await {
            Ok(result) => result,
            Err(_) => {
                self.sink.record(&ResilienceEvent::TimeoutExceeded {
                    resource: self.resource.clone(),
                    timeout: self.config.timeout,
                });
                Err(ResilienceError::Timeout {
                    resource: self.resource.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }
}

impl<T, E> Middleware<T, E> for Timeout
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn handle<'a>(&'a self, next: Next<'a, T, E>) -> BoxFuture<'a, Outcome<T, E>> {
        Box::pin(self.execute(move || next.run()))
    }
}
