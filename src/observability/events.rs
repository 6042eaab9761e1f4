//! Structured resilience events and the sinks that consume them.
//!
//! Components emit events; they never own storage or export. Each
//! pipeline is handed one `Arc<dyn EventSink>` at wiring time.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::observability::metrics;
use crate::resilience::circuit_breaker::CircuitState;

/// Something noteworthy a resilience layer did.
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    CircuitStateChanged {
        resource: String,
        from: CircuitState,
        to: CircuitState,
    },
    CircuitRejected {
        resource: String,
        state: CircuitState,
    },
    RetryAttempt {
        resource: String,
        /// The attempt that just failed (1-based).
        attempt: u32,
        delay: Duration,
    },
    RetryExhausted {
        resource: String,
        attempts: u32,
    },
    BulkheadRejected {
        resource: String,
        active: usize,
        waiting: usize,
        waited: Duration,
    },
    TimeoutExceeded {
        resource: String,
        timeout: Duration,
    },
}

impl ResilienceEvent {
    /// Stable event name used for log messages and metric names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitStateChanged { .. } => "circuit_state_changed",
            Self::CircuitRejected { .. } => "circuit_rejected",
            Self::RetryAttempt { .. } => "retry_attempt",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::BulkheadRejected { .. } => "bulkhead_rejected",
            Self::TimeoutExceeded { .. } => "timeout_exceeded",
        }
    }

    pub fn resource(&self) -> &str {
        match self {
            Self::CircuitStateChanged { resource, .. }
            | Self::CircuitRejected { resource, .. }
            | Self::RetryAttempt { resource, .. }
            | Self::RetryExhausted { resource, .. }
            | Self::BulkheadRejected { resource, .. }
            | Self::TimeoutExceeded { resource, .. } => resource,
        }
    }
}

/// Consumer of resilience events.
pub trait EventSink: Send + Sync + fmt::Debug {
    fn record(&self, event: &ResilienceEvent);
}

/// Writes every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::CircuitStateChanged { resource, from, to } => {
                if *to == CircuitState::Open {
                    tracing::warn!(resource = %resource, from = %from, to = %to, "Circuit state changed");
                } else {
                    tracing::info!(resource = %resource, from = %from, to = %to, "Circuit state changed");
                }
            }
            ResilienceEvent::CircuitRejected { resource, state } => {
                tracing::debug!(resource = %resource, state = %state, "Call rejected by circuit breaker");
            }
            ResilienceEvent::RetryAttempt {
                resource,
                attempt,
                delay,
            } => {
                tracing::debug!(resource = %resource, attempt, delay = ?delay, "Retrying call");
            }
            ResilienceEvent::RetryExhausted { resource, attempts } => {
                tracing::warn!(resource = %resource, attempts, "Retries exhausted");
            }
            ResilienceEvent::BulkheadRejected {
                resource,
                active,
                waiting,
                waited,
            } => {
                tracing::warn!(resource = %resource, active, waiting, waited = ?waited, "Bulkhead rejected call");
            }
            ResilienceEvent::TimeoutExceeded { resource, timeout } => {
                tracing::warn!(resource = %resource, timeout = ?timeout, "Call timed out");
            }
        }
    }
}

/// Forwards events to the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn record(&self, event: &ResilienceEvent) {
        metrics::record_event(event);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: &ResilienceEvent) {}
}

/// Delivers each event to several sinks in order.
#[derive(Debug, Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: &ResilienceEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Keeps every event in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events recorded so far.
    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: &ResilienceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Default sink used when none is configured.
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingSink)
}
