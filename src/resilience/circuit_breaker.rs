//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: probing whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold (consecutive)
//! Open → Half-Open: first call after open_timeout since the last failure
//! Half-Open → Closed: success_threshold consecutive probe successes
//! Half-Open → Open: any probe failure
//! ```
//!
//! # Design Decisions
//! - One breaker per dependency (not global)
//! - Fail fast in Open state; the operation is never invoked
//! - At most `half_open_max_calls` probes in flight while Half-Open
//! - Every transition bumps a generation counter; outcomes of calls admitted
//!   under an older generation are ignored so late results can't corrupt
//!   the current state
//! - Admission and outcome bookkeeping each run under one mutex; the lock
//!   is never held across the operation itself

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::observability::events::{default_sink, EventSink, ResilienceEvent};
use crate::pipeline::chain::{BoxFuture, Middleware, Next};
use crate::resilience::clock::{system_clock, Clock};
use crate::resilience::error::{Outcome, ResilienceError};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that trip the circuit.
    pub failure_threshold: u32,
    /// Consecutive probe successes in Half-Open that close it again.
    pub success_threshold: u32,
    /// Time after the last failure before a probe is allowed.
    pub open_timeout: Duration,
    /// Concurrent probes allowed while Half-Open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub calls_permitted: u64,
    pub calls_rejected: u64,
    pub successes_total: u64,
    pub failures_total: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    generation: u64,
    probes_in_flight: u32,
    calls_permitted: u64,
    calls_rejected: u64,
    successes_total: u64,
    failures_total: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            generation: 0,
            probes_in_flight: 0,
            calls_permitted: 0,
            calls_rejected: 0,
            successes_total: 0,
            failures_total: 0,
        }
    }

    /// Move to `to`, returning the transition if the state actually changed.
    fn transition(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        self.probes_in_flight = 0;
        self.generation += 1;
        (from != to).then_some((from, to))
    }
}

/// Admission granted by the breaker for one call.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    generation: u64,
    probe: bool,
}

/// Rejection carries the rejecting state and the time until the next probe.
type Admission = Result<Ticket, (CircuitState, Duration)>;

/// `(from, to)` when a state change happened.
type Transition = Option<(CircuitState, CircuitState)>;

/// How a finished call is booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Failure,
    Neutral,
}

fn verdict<T, E>(result: &Outcome<T, E>) -> Verdict {
    match result {
        Ok(_) => Verdict::Success,
        Err(ResilienceError::Cancelled { .. }) | Err(ResilienceError::BulkheadRejected { .. }) => {
            Verdict::Neutral
        }
        Err(_) => Verdict::Failure,
    }
}

/// Circuit breaker guarding one dependency.
///
/// # Example
/// ```no_run
/// use resilience_pipeline::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
/// use resilience_pipeline::ResilienceError;
///
/// # async fn example() {
/// let breaker = CircuitBreaker::new("inventory", CircuitBreakerConfig::default());
/// let result = breaker
///     .execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(42) })
///     .await;
/// assert_eq!(result.unwrap(), 42);
/// # }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    resource: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker. Thresholds below 1 are treated as 1.
    pub fn new(resource: impl Into<String>, mut config: CircuitBreakerConfig) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        config.success_threshold = config.success_threshold.max(1);
        config.half_open_max_calls = config.half_open_max_calls.max(1);
        Self {
            resource: resource.into(),
            config,
            clock: system_clock(),
            sink: default_sink(),
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state as last recorded.
    ///
    /// An Open circuit whose timeout has elapsed still reports Open until the
    /// next call performs the Half-Open transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.lock();
        CircuitSnapshot {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            calls_permitted: state.calls_permitted,
            calls_rejected: state.calls_rejected,
            successes_total: state.successes_total,
            failures_total: state.failures_total,
        }
    }

    /// Close the circuit and clear the running tallies.
    pub fn reset(&self) {
        let change = self.lock().transition(CircuitState::Closed);
        self.emit_transition(change);
    }

    /// Open the circuit now, as if the failure threshold had been hit.
    pub fn force_open(&self) {
        let now = self.clock.now();
        let change = {
            let mut state = self.lock();
            state.last_failure_time = Some(now);
            state.transition(CircuitState::Open)
        };
        self.emit_transition(change);
    }

    fn emit_transition(&self, change: Transition) {
        if let Some((from, to)) = change {
            self.sink.record(&ResilienceEvent::CircuitStateChanged {
                resource: self.resource.clone(),
                from,
                to,
            });
        }
    }

    /// Decide whether a call may run. On rejection returns the state that
    /// rejected it and the time left until the next probe is allowed.
    fn acquire(&self) -> Admission {
        let now = self.clock.now();
        let (admission, change) = {
            let mut state = self.lock();
            self.admit(&mut state, now)
        };

        self.emit_transition(change);
        if let Err((state, _)) = admission {
            self.reject_event(state);
        }
        admission
    }

    fn admit(&self, state: &mut BreakerState, now: Instant) -> (Admission, Transition) {
        let mut change = None;
        if state.state == CircuitState::Open {
            let elapsed = state
                .last_failure_time
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(self.config.open_timeout);
            if elapsed < self.config.open_timeout {
                state.calls_rejected += 1;
                return (
                    Err((CircuitState::Open, self.config.open_timeout - elapsed)),
                    None,
                );
            }
            change = state.transition(CircuitState::HalfOpen);
        }

        let admission = match state.state {
            CircuitState::Closed => {
                state.calls_permitted += 1;
                Ok(Ticket {
                    generation: state.generation,
                    probe: false,
                })
            }
            CircuitState::HalfOpen if state.probes_in_flight < self.config.half_open_max_calls => {
                state.probes_in_flight += 1;
                state.calls_permitted += 1;
                Ok(Ticket {
                    generation: state.generation,
                    probe: true,
                })
            }
            other => {
                state.calls_rejected += 1;
                Err((other, Duration::ZERO))
            }
        };
        (admission, change)
    }

    fn reject_event(&self, state: CircuitState) {
        self.sink.record(&ResilienceEvent::CircuitRejected {
            resource: self.resource.clone(),
            state,
        });
    }

    /// Book the outcome of an admitted call.
    fn settle(&self, ticket: Ticket, verdict: Verdict) {
        let now = self.clock.now();
        let change = {
            let mut state = self.lock();
            match verdict {
                Verdict::Success => state.successes_total += 1,
                Verdict::Failure => state.failures_total += 1,
                Verdict::Neutral => {}
            }

            if ticket.generation != state.generation {
                tracing::trace!(resource = %self.resource, "Ignoring outcome from a previous circuit generation");
                return;
            }
            if ticket.probe {
                state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
            }

            match (verdict, state.state) {
                (Verdict::Success, CircuitState::Closed) => {
                    state.failure_count = 0;
                    None
                }
                (Verdict::Success, CircuitState::HalfOpen) => {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        state.transition(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                (Verdict::Failure, CircuitState::Closed) => {
                    state.failure_count += 1;
                    state.last_failure_time = Some(now);
                    if state.failure_count >= self.config.failure_threshold {
                        state.transition(CircuitState::Open)
                    } else {
                        None
                    }
                }
                (Verdict::Failure, CircuitState::HalfOpen) => {
                    state.last_failure_time = Some(now);
                    state.transition(CircuitState::Open)
                }
                _ => None,
            }
        };
        self.emit_transition(change);
    }

    /// Run `op` under circuit breaker protection.
    ///
    /// Returns `CircuitOpen` without invoking `op` when the circuit is open.
    /// Any other error from `op` is booked and passed through unchanged.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        let ticket = match self.acquire() {
            Ok(ticket) => ticket,
            Err((_, retry_after)) => {
                return Err(ResilienceError::CircuitOpen {
                    resource: self.resource.clone(),
                    retry_after,
                })
            }
        };

        let mut guard = TicketGuard {
            breaker: self,
            ticket: Some(ticket),
        };
        let result = op().await;
        if let Some(ticket) = guard.ticket.take() {
            self.settle(ticket, verdict(&result));
        }
        result
    }
}

/// Releases a probe slot if the call is dropped before it finishes.
struct TicketGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Option<Ticket>,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.settle(ticket, Verdict::Neutral);
        }
    }
}

impl<T, E> Middleware<T, E> for CircuitBreaker
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn handle<'a>(&'a self, next: Next<'a, T, E>) -> BoxFuture<'a, Outcome<T, E>> {
        Box::pin(self.execute(move || next.run()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::events::RecordingSink;
    use crate::resilience::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    type TestResult = Outcome<u32, String>;

    fn breaker(clock: &ManualClock, failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold,
                open_timeout: Duration::from_secs(1),
                half_open_max_calls: 1,
            },
        )
        .with_clock(Arc::new(clock.clone()))
    }

    async fn fail(breaker: &CircuitBreaker) -> TestResult {
        breaker
            .execute(|| async { Err(ResilienceError::Operation("boom".to_string())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> TestResult {
        breaker.execute(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_trips_after_threshold() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, 3, 1);

        for _ in 0..2 {
            assert!(matches!(fail(&breaker).await, Err(ResilienceError::Operation(_))));
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(matches!(fail(&breaker).await, Err(ResilienceError::Operation(_))));
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result: TestResult = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0, "open circuit must not invoke the operation");
        assert_eq!(breaker.snapshot().calls_rejected, 1);
    }

    #[tokio::test]
    async fn test_success_clears_failure_tally() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, 3, 1);

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.snapshot().failure_count, 2);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.snapshot().failure_count, 0);

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_reports_retry_after() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, 1, 1);
        let _ = fail(&breaker).await;

        clock.advance(Duration::from_millis(400));
        match succeed(&breaker).await {
            Err(ResilienceError::CircuitOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_millis(600));
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_half_open_to_closed() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, 2, 2);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, 1, 3);
        let _ = fail(&breaker).await;

        clock.advance(Duration::from_secs(2));
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(ResilienceError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_probes() {
        let clock = ManualClock::new();
        let breaker = Arc::new(breaker(&clock, 1, 1));
        let _ = fail(&breaker).await;
        clock.advance(Duration::from_secs(1));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, ResilienceError<String>>(1)
                    })
                    .await
            })
        };

        while breaker.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }
        assert!(matches!(succeed(&breaker).await, Err(ResilienceError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stale_outcome_is_ignored() {
        let clock = ManualClock::new();
        let breaker = Arc::new(breaker(&clock, 1, 1));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = release_rx.await;
                        Err::<u32, _>(ResilienceError::Operation("late".to_string()))
                    })
                    .await
            })
        };
        while breaker.snapshot().calls_permitted == 0 {
            tokio::task::yield_now().await;
        }

        breaker.force_open();
        breaker.reset();
        release_tx.send(()).unwrap();
        let _ = slow.await.unwrap();

        assert_eq!(breaker.state(), CircuitState::Closed, "late failure must not trip a fresh circuit");
        assert_eq!(breaker.snapshot().failures_total, 1);
    }

    #[tokio::test]
    async fn test_cancelled_outcome_is_neutral() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, 1, 1);
        let result: TestResult = breaker
            .execute(|| async { Err(ResilienceError::Cancelled { resource: "test".into() }) })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_transitions_are_reported() {
        let clock = ManualClock::new();
        let sink = Arc::new(RecordingSink::new());
        let breaker = breaker(&clock, 1, 1).with_sink(sink.clone());

        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        clock.advance(Duration::from_secs(1));
        let _ = succeed(&breaker).await;

        let transitions: Vec<(CircuitState, CircuitState)> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ResilienceEvent::CircuitStateChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
        assert_eq!(sink.count("circuit_rejected"), 1);
    }

    #[tokio::test]
    async fn test_reset() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, 1, 1);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }
}
