//! Metrics collection and exposition.
//!
//! # Metrics
//! - `resilience_circuit_transitions_total` (counter): by resource, target state
//! - `resilience_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `resilience_circuit_rejections_total` (counter): calls failed fast
//! - `resilience_retry_attempts_total` (counter): retries scheduled
//! - `resilience_retry_delay_seconds` (histogram): backoff delays
//! - `resilience_retry_exhausted_total` (counter)
//! - `resilience_bulkhead_rejections_total` (counter)
//! - `resilience_timeouts_total` (counter)

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::observability::events::ResilienceEvent;
use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

/// Record a resilience event against the global recorder.
pub fn record_event(event: &ResilienceEvent) {
    let resource = event.resource().to_string();
    match event {
        ResilienceEvent::CircuitStateChanged { to, .. } => {
            counter!(
                "resilience_circuit_transitions_total",
                "resource" => resource.clone(),
                "to" => to.as_str()
            )
            .increment(1);
            gauge!("resilience_circuit_state", "resource" => resource).set(state_value(*to));
        }
        ResilienceEvent::CircuitRejected { .. } => {
            counter!("resilience_circuit_rejections_total", "resource" => resource).increment(1);
        }
        ResilienceEvent::RetryAttempt { delay, .. } => {
            counter!("resilience_retry_attempts_total", "resource" => resource.clone()).increment(1);
            histogram!("resilience_retry_delay_seconds", "resource" => resource)
                .record(delay.as_secs_f64());
        }
        ResilienceEvent::RetryExhausted { .. } => {
            counter!("resilience_retry_exhausted_total", "resource" => resource).increment(1);
        }
        ResilienceEvent::BulkheadRejected { .. } => {
            counter!("resilience_bulkhead_rejections_total", "resource" => resource).increment(1);
        }
        ResilienceEvent::TimeoutExceeded { .. } => {
            counter!("resilience_timeouts_total", "resource" => resource).increment(1);
        }
    }
}

