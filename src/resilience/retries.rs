//! Retry logic.
//!
//! # Responsibilities
//! - Classify each failure as retryable or permanent (injectable predicate)
//! - Execute retries with exponential backoff + jitter
//! - Optionally enforce a retry budget shared across calls
//!
//! # Design Decisions
//! - Attempts are strictly sequential; attempt 1 always runs
//! - Permanent errors return immediately, no further attempts
//! - On exhaustion the last error is returned unchanged (not an aggregate)
//! - Inter-attempt waits are tokio sleeps raced against cancellation
//! - Retry budget prevents retry storms under sustained failure

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::lifecycle::cancel::CancelToken;
use crate::observability::events::{default_sink, EventSink, ResilienceEvent};
use crate::pipeline::chain::{BoxFuture, Middleware, Next};
use crate::resilience::backoff::{BackoffStrategy, ExponentialBackoff, JitterSource};
use crate::resilience::error::{default_retryable, Outcome, ResilienceError, Transient};

/// Decides whether an error is worth another attempt.
pub type RetryPredicate<E> = Arc<dyn Fn(&ResilienceError<E>) -> bool + Send + Sync>;

/// Retry tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Scale each delay by a uniform factor in `[0.5, 1.0)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff strategy described by this config.
    pub fn backoff(&self) -> ExponentialBackoff {
        let backoff = ExponentialBackoff::new(self.base_delay, self.max_delay, self.exponential_base);
        if self.jitter {
            backoff.with_jitter()
        } else {
            backoff
        }
    }
}

/// Requests whose deposits a budget can bank at most.
///
/// Bounds the burst of retries a long quiet period can build up.
pub const BUDGET_BANKED_REQUESTS: f64 = 100.0;

/// Caps retries to a fraction of overall traffic.
///
/// Every call deposits `ratio` tokens, every retry withdraws one. Deposits
/// are capped at `ratio * BUDGET_BANKED_REQUESTS`. On top of the deposits,
/// `min_retries` retries are always available per window (one second by
/// default), so a sustained outage never disables retries entirely.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f64,
    min_retries: u32,
    window: Duration,
    state: Mutex<BudgetState>,
}

#[derive(Debug)]
struct BudgetState {
    deposits: f64,
    reserve: u32,
    window_start: Instant,
}

impl RetryBudget {
    pub fn new(ratio: f64, min_retries: u32) -> Self {
        Self {
            ratio: ratio.max(0.0),
            min_retries,
            window: Duration::from_secs(1),
            state: Mutex::new(BudgetState {
                deposits: 0.0,
                reserve: min_retries,
                window_start: Instant::now(),
            }),
        }
    }

    /// Refill the `min_retries` reserve every `window` instead of every second.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Record a first attempt.
    pub fn record_request(&self) {
        let mut state = self.lock();
        state.deposits = (state.deposits + self.ratio).min(self.ratio * BUDGET_BANKED_REQUESTS);
    }

    /// Take one retry from the budget if available.
    ///
    /// The per-window reserve is spent before banked deposits.
    pub fn try_withdraw(&self) -> bool {
        let mut state = self.lock();
        if state.reserve > 0 {
            state.reserve -= 1;
            true
        } else if state.deposits >= 1.0 {
            state.deposits -= 1.0;
            true
        } else {
            false
        }
    }

    /// Retries currently available.
    pub fn balance(&self) -> f64 {
        let state = self.lock();
        f64::from(state.reserve) + state.deposits
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.window {
            state.reserve = self.min_retries;
            state.window_start = now;
        }
        state
    }
}

/// Retries a failing operation with backoff.
pub struct Retry<E> {
    resource: String,
    config: RetryConfig,
    backoff: Arc<dyn BackoffStrategy>,
    retryable: RetryPredicate<E>,
    budget: Option<Arc<RetryBudget>>,
    cancel: Option<CancelToken>,
    sink: Arc<dyn EventSink>,
}

impl<E> fmt::Debug for Retry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("resource", &self.resource)
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl<E: Transient + 'static> Retry<E> {
    /// Retry with the default classification (timeouts and transient errors).
    pub fn new(resource: impl Into<String>, config: RetryConfig) -> Self {
        Self::from_predicate(resource, config, Arc::new(default_retryable::<E>))
    }
}

impl<E> Retry<E> {
    /// Retry with a caller-supplied classification.
    pub fn with_predicate<P>(resource: impl Into<String>, config: RetryConfig, predicate: P) -> Self
    where
        P: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        Self::from_predicate(resource, config, Arc::new(predicate))
    }

    pub(crate) fn from_predicate(
        resource: impl Into<String>,
        mut config: RetryConfig,
        retryable: RetryPredicate<E>,
    ) -> Self {
        config.max_attempts = config.max_attempts.max(1);
        Self {
            resource: resource.into(),
            backoff: Arc::new(config.backoff()),
            config,
            retryable,
            budget: None,
            cancel: None,
            sink: default_sink(),
        }
    }

    /// Replace the backoff strategy derived from the config.
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Keep the configured exponential backoff but draw jitter from `source`.
    pub fn with_jitter_source(mut self, source: Arc<dyn JitterSource>) -> Self {
        let backoff = ExponentialBackoff::new(
            self.config.base_delay,
            self.config.max_delay,
            self.config.exponential_base,
        );
        self.backoff = Arc::new(backoff.with_jitter_source(source));
        self
    }

    pub fn with_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Token that aborts waits for every call through this retry.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay that would follow the given failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Run `op` up to `max_attempts` times.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Outcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        self.run(op, self.cancel.as_ref()).await
    }

    /// Like [`Retry::execute`], but stops waiting as soon as `token` fires.
    pub async fn execute_with_cancel<F, Fut, T>(&self, op: F, token: &CancelToken) -> Outcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        self.run(op, Some(token)).await
    }

    async fn run<F, Fut, T>(&self, mut op: F, cancel: Option<&CancelToken>) -> Outcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        if let Some(budget) = &self.budget {
            budget.record_request();
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !(self.retryable)(&error) {
                tracing::debug!(resource = %self.resource, attempt, "Permanent error, not retrying");
                return Err(error);
            }

            let budget_spent = self
                .budget
                .as_ref()
                .is_some_and(|budget| attempt < self.config.max_attempts && !budget.try_withdraw());
            if attempt >= self.config.max_attempts || budget_spent {
                if budget_spent {
                    tracing::debug!(resource = %self.resource, attempt, "Retry budget exhausted");
                }
                self.sink.record(&ResilienceEvent::RetryExhausted {
                    resource: self.resource.clone(),
                    attempts: attempt,
                });
                return Err(error);
            }

            let delay = self.backoff.delay(attempt);
            self.sink.record(&ResilienceEvent::RetryAttempt {
                resource: self.resource.clone(),
                attempt,
                delay,
            });

            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            tracing::debug!(resource = %self.resource, attempt, "Retry cancelled while waiting");
                            return Err(ResilienceError::Cancelled {
                                resource: self.resource.clone(),
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

impl<T, E> Middleware<T, E> for Retry<E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn name(&self) -> &'static str {
        "retry"
    }

    fn handle<'a>(&'a self, next: Next<'a, T, E>) -> BoxFuture<'a, Outcome<T, E>> {
        let cancel = next.cancel_token().or(self.cancel.as_ref());
        Box::pin(self.run(move || next.run(), cancel))
    }
}
