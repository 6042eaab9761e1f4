//! Middleware chain and pipeline composition.
//!
//! A [`Pipeline`] is an ordered slice of [`Middleware`] layers, outermost
//! first. A call walks the slice by reference: each layer receives a
//! [`Next`] continuation pointing at the rest of the slice and the terminal
//! operation, applies its concern and runs `next` zero or more times. The
//! slice is built once at wiring time; a call allocates only the boxed
//! futures of its own layers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::lifecycle::cancel::CancelToken;
use crate::observability::events::{default_sink, EventSink};
use crate::pipeline::order::{check_order, LayerKind};
use crate::resilience::bulkhead::{Bulkhead, BulkheadConfig};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::resilience::clock::{system_clock, Clock};
use crate::resilience::error::{default_retryable, Outcome, ResilienceError, Transient};
use crate::resilience::retries::{Retry, RetryBudget, RetryConfig, RetryPredicate};
use crate::resilience::timeouts::{Timeout, TimeoutConfig};

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One concern in the chain.
pub trait Middleware<T, E>: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Apply this concern around `next`.
    fn handle<'a>(&'a self, next: Next<'a, T, E>) -> BoxFuture<'a, Outcome<T, E>>;
}

/// The innermost callable of a chain.
pub trait Operation<T, E>: Send + Sync {
    fn invoke(&self) -> BoxFuture<'_, Outcome<T, E>>;
}

/// Adapts a plain `Fn() -> Future<Output = Result<T, E>>` into an [`Operation`].
struct FnOperation<'f, F>(&'f F);

impl<'f, F, Fut, T, E> Operation<T, E> for FnOperation<'f, F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'f,
    T: Send + 'static,
    E: Send + 'static,
{
    fn invoke(&self) -> BoxFuture<'_, Outcome<T, E>> {
        let fut = (self.0)();
        Box::pin(async move { fut.await.map_err(ResilienceError::Operation) })
    }
}

/// Continuation handed to a middleware: the remaining layers plus the
/// terminal operation.
pub struct Next<'a, T, E> {
    layers: &'a [Arc<dyn Middleware<T, E>>],
    terminal: &'a dyn Operation<T, E>,
    cancel: Option<&'a CancelToken>,
}

impl<T, E> Clone for Next<'_, T, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, E> Copy for Next<'_, T, E> {}

impl<'a, T, E> Next<'a, T, E> {
    /// Run the rest of the chain once.
    pub fn run(&self) -> BoxFuture<'a, Outcome<T, E>> {
        match self.layers.split_first() {
            Some((layer, rest)) => layer.handle(Next {
                layers: rest,
                ..*self
            }),
            None => self.terminal.invoke(),
        }
    }

    /// Per-call cancellation token, if the caller supplied one.
    pub fn cancel_token(&self) -> Option<&'a CancelToken> {
        self.cancel
    }

    /// Number of layers still ahead of the terminal operation.
    pub fn remaining(&self) -> usize {
        self.layers.len()
    }
}

/// Resilience pipeline for one dependency.
pub struct Pipeline<T, E> {
    name: String,
    layers: Vec<Arc<dyn Middleware<T, E>>>,
    kinds: Vec<Option<LayerKind>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    bulkhead: Option<Arc<Bulkhead>>,
}

impl<T, E> fmt::Debug for Pipeline<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("layers", &self.layer_names())
            .finish()
    }
}

impl<T, E> Pipeline<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<T, E> {
        PipelineBuilder::new(name)
    }

    /// Run `op` through every layer.
    pub async fn execute<F, Fut>(&self, op: F) -> Outcome<T, E>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.run(&op, None).await
    }

    /// Run `op` through every layer, stopping retry waits when `token` fires.
    pub async fn execute_with_cancel<F, Fut>(&self, op: F, token: &CancelToken) -> Outcome<T, E>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.run(&op, Some(token)).await
    }

    async fn run<F, Fut>(&self, op: &F, cancel: Option<&CancelToken>) -> Outcome<T, E>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let terminal = FnOperation(op);
        Next {
            layers: &self.layers,
            terminal: &terminal,
            cancel,
        }
        .run()
        .await
    }

    /// Bind a terminal operation, producing a reusable composed callable.
    pub fn compose<F, Fut>(self: &Arc<Self>, op: F) -> Composed<T, E, F>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        Composed {
            pipeline: Arc::clone(self),
            op,
        }
    }
}

impl<T, E> Pipeline<T, E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Layer names, outermost first.
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    /// Built-in layer kinds in order; custom layers are skipped.
    pub fn layer_kinds(&self) -> Vec<LayerKind> {
        self.kinds.iter().flatten().copied().collect()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&Arc<Bulkhead>> {
        self.bulkhead.as_ref()
    }
}

/// A pipeline bound to one terminal operation.
pub struct Composed<T, E, F> {
    pipeline: Arc<Pipeline<T, E>>,
    op: F,
}

impl<T, E, F, Fut> Composed<T, E, F>
where
    T: Send + 'static,
    E: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
{
    pub async fn call(&self) -> Outcome<T, E> {
        self.pipeline.run(&self.op, None).await
    }

    pub async fn call_with_cancel(&self, token: &CancelToken) -> Outcome<T, E> {
        self.pipeline.run(&self.op, Some(token)).await
    }

    pub fn pipeline(&self) -> &Arc<Pipeline<T, E>> {
        &self.pipeline
    }
}

enum PlannedLayer<T, E> {
    Bulkhead(BulkheadConfig),
    CircuitBreaker(CircuitBreakerConfig),
    Retry(RetryConfig, RetryPredicate<E>),
    Timeout(TimeoutConfig),
    Custom(Arc<dyn Middleware<T, E>>),
}

impl<T, E> PlannedLayer<T, E> {
    fn kind(&self) -> Option<LayerKind> {
        match self {
            PlannedLayer::Bulkhead(_) => Some(LayerKind::Bulkhead),
            PlannedLayer::CircuitBreaker(_) => Some(LayerKind::CircuitBreaker),
            PlannedLayer::Retry(..) => Some(LayerKind::Retry),
            PlannedLayer::Timeout(_) => Some(LayerKind::Timeout),
            PlannedLayer::Custom(_) => None,
        }
    }
}

/// Assembles a [`Pipeline`]. Layers are applied in the order they are
/// added, outermost first.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use resilience_pipeline::pipeline::Pipeline;
/// use resilience_pipeline::resilience::{BulkheadConfig, CircuitBreakerConfig, RetryConfig, TimeoutConfig};
///
/// let pipeline = Pipeline::<String, std::io::Error>::builder("inventory")
///     .bulkhead(BulkheadConfig::default())
///     .circuit_breaker(CircuitBreakerConfig::default())
///     .retry(RetryConfig::default())
///     .timeout(TimeoutConfig::new(Duration::from_secs(2)))
///     .build();
/// assert_eq!(pipeline.layer_names(), ["bulkhead", "circuit_breaker", "retry", "timeout"]);
/// ```
pub struct PipelineBuilder<T, E> {
    name: String,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    cancel: Option<CancelToken>,
    budget: Option<Arc<RetryBudget>>,
    planned: Vec<PlannedLayer<T, E>>,
}

impl<T, E> PipelineBuilder<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sink: default_sink(),
            clock: system_clock(),
            cancel: None,
            budget: None,
            planned: Vec::new(),
        }
    }

    /// Event sink shared by every built-in layer.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Clock used by the circuit breaker.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Token that aborts retry waits for every call (e.g. process shutdown).
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Retry budget shared by the retry layers of this pipeline.
    pub fn retry_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.planned.push(PlannedLayer::Bulkhead(config));
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.planned.push(PlannedLayer::CircuitBreaker(config));
        self
    }

    /// Retry with a caller-supplied retryability predicate.
    pub fn retry_if<P>(mut self, config: RetryConfig, predicate: P) -> Self
    where
        P: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        self.planned.push(PlannedLayer::Retry(config, Arc::new(predicate)));
        self
    }

    pub fn timeout(mut self, config: TimeoutConfig) -> Self {
        self.planned.push(PlannedLayer::Timeout(config));
        self
    }

    /// Append a custom middleware.
    pub fn layer(mut self, middleware: Arc<dyn Middleware<T, E>>) -> Self {
        self.planned.push(PlannedLayer::Custom(middleware));
        self
    }

    /// Reorder built-in layers into bulkhead, circuit breaker, retry,
    /// timeout. Custom layers keep their position relative to each other
    /// and end up innermost.
    pub fn canonical_order(mut self) -> Self {
        self.planned
            .sort_by_key(|layer| layer.kind().map_or(usize::MAX, |k| k.canonical_rank()));
        self
    }

    pub fn build(self) -> Pipeline<T, E> {
        let kinds: Vec<Option<LayerKind>> = self.planned.iter().map(PlannedLayer::kind).collect();
        let known: Vec<LayerKind> = kinds.iter().flatten().copied().collect();
        for violation in check_order(&known) {
            tracing::warn!(pipeline = %self.name, %violation, "Unusual layer order");
        }

        let mut circuit_breaker = None;
        let mut bulkhead = None;
        let mut layers: Vec<Arc<dyn Middleware<T, E>>> = Vec::with_capacity(self.planned.len());

        for planned in self.planned {
            match planned {
                PlannedLayer::Bulkhead(config) => {
                    let layer = Arc::new(
                        Bulkhead::new(self.name.clone(), config).with_sink(self.sink.clone()),
                    );
                    bulkhead = Some(layer.clone());
                    layers.push(layer);
                }
                PlannedLayer::CircuitBreaker(config) => {
                    let layer = Arc::new(
                        CircuitBreaker::new(self.name.clone(), config)
                            .with_clock(self.clock.clone())
                            .with_sink(self.sink.clone()),
                    );
                    circuit_breaker = Some(layer.clone());
                    layers.push(layer);
                }
                PlannedLayer::Retry(config, predicate) => {
                    let mut retry = Retry::from_predicate(self.name.clone(), config, predicate)
                        .with_sink(self.sink.clone());
                    if let Some(token) = &self.cancel {
                        retry = retry.with_cancel_token(token.clone());
                    }
                    if let Some(budget) = &self.budget {
                        retry = retry.with_budget(budget.clone());
                    }
                    layers.push(Arc::new(retry));
                }
                PlannedLayer::Timeout(config) => {
                    layers.push(Arc::new(
                        Timeout::new(self.name.clone(), config).with_sink(self.sink.clone()),
                    ));
                }
                PlannedLayer::Custom(layer) => layers.push(layer),
            }
        }

        tracing::debug!(pipeline = %self.name, layers = layers.len(), "Pipeline built");
        Pipeline {
            name: self.name,
            layers,
            kinds,
            circuit_breaker,
            bulkhead,
        }
    }
}

impl<T, E> PipelineBuilder<T, E>
where
    T: Send + 'static,
    E: Transient + Send + 'static,
{
    /// Retry using the default classification: timeouts and transient
    /// operation errors are retried, everything else is permanent.
    pub fn retry(self, config: RetryConfig) -> Self {
        self.retry_if(config, default_retryable::<E>)
    }
}
