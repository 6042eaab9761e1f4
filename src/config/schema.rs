//! Configuration schema definitions.
//!
//! This module defines the configuration file structure for resilience
//! pipelines. All types derive Serde traits for deserialization from TOML;
//! durations are integer `_ms` fields and convert into the runtime configs
//! of the `resilience` module.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::order::{LayerKind, CANONICAL_ORDER};
use crate::resilience::bulkhead::BulkheadConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::retries::RetryConfig;
use crate::resilience::timeouts::TimeoutConfig;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// One pipeline per downstream dependency.
    pub dependencies: Vec<DependencyConfig>,
}

impl ResilienceConfig {
    pub fn dependency(&self, name: &str) -> Option<&DependencyConfig> {
        self.dependencies.iter().find(|d| d.name == name)
    }
}

/// Pipeline settings for one dependency.
///
/// A layer is enabled by the presence of its section. Without an explicit
/// `order` the enabled layers are applied in canonical order.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct DependencyConfig {
    /// Dependency identifier for logging/metrics.
    pub name: String,

    pub bulkhead: Option<BulkheadSettings>,

    pub circuit_breaker: Option<CircuitBreakerSettings>,

    pub retry: Option<RetrySettings>,

    pub timeout: Option<TimeoutSettings>,

    /// Explicit layer order, outermost first. Layers listed here without a
    /// section use default settings.
    pub order: Option<Vec<LayerKind>>,
}

impl DependencyConfig {
    /// Effective layer order, outermost first.
    pub fn layer_order(&self) -> Vec<LayerKind> {
        match &self.order {
            Some(order) => order.clone(),
            None => CANONICAL_ORDER
                .into_iter()
                .filter(|kind| self.has_section(*kind))
                .collect(),
        }
    }

    /// Whether the dependency has a settings section for `kind`.
    pub fn has_section(&self, kind: LayerKind) -> bool {
        match kind {
            LayerKind::Bulkhead => self.bulkhead.is_some(),
            LayerKind::CircuitBreaker => self.circuit_breaker.is_some(),
            LayerKind::Retry => self.retry.is_some(),
            LayerKind::Timeout => self.timeout.is_some(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,

    /// Consecutive probe successes that close it again.
    pub success_threshold: u32,

    /// Time in Open before a probe is allowed, in milliseconds.
    pub open_timeout_ms: u64,

    /// Concurrent probes allowed in Half-Open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            open_timeout: Duration::from_millis(settings.open_timeout_ms),
            half_open_max_calls: settings.half_open_max_calls,
        }
    }
}

/// Retry settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    pub exponential_base: f64,

    /// Randomize delays to avoid synchronized retries.
    pub jitter: bool,

    /// Fraction of calls that may be retried (retry budget).
    /// e.g., 0.1 for 10% budget. Unset disables the budget.
    pub budget_ratio: Option<f64>,

    /// Retries always allowed by the budget each second, regardless of traffic.
    pub budget_min_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            exponential_base: 2.0,
            jitter: true,
            budget_ratio: None,
            budget_min_retries: 10,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            exponential_base: settings.exponential_base,
            jitter: settings.jitter,
        }
    }
}

/// Bulkhead settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BulkheadSettings {
    /// Maximum calls in flight.
    pub max_concurrent: usize,

    /// How long a caller may queue, in milliseconds.
    pub max_wait_ms: u64,

    /// Maximum queued callers; unset means unbounded.
    pub max_queued: Option<usize>,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait_ms: 1_000,
            max_queued: None,
        }
    }
}

impl From<&BulkheadSettings> for BulkheadConfig {
    fn from(settings: &BulkheadSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent,
            max_wait: Duration::from_millis(settings.max_wait_ms),
            max_queued: settings.max_queued,
        }
    }
}

/// Per-attempt timeout settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Attempt deadline in milliseconds.
    pub timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl From<&TimeoutSettings> for TimeoutConfig {
    fn from(settings: &TimeoutSettings) -> Self {
        TimeoutConfig::new(Duration::from_millis(settings.timeout_ms))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
