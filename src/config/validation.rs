//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds >= 1, timeouts > 0, backoff growth)
//! - Check layer composition rules per dependency
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ResilienceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{DependencyConfig, ResilienceConfig};
use crate::pipeline::order::{check_order, LayerKind, OrderViolation};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("dependency #{0} has an empty name")]
    EmptyName(usize),

    #[error("dependency '{0}' is defined more than once")]
    DuplicateName(String),

    #[error("{dependency}: {field} must be at least 1")]
    BelowOne {
        dependency: String,
        field: &'static str,
    },

    #[error("{dependency}: {field} must be greater than zero")]
    ZeroDuration {
        dependency: String,
        field: &'static str,
    },

    #[error("{dependency}: exponential_base must be greater than 1.0, got {value}")]
    ExponentialBase { dependency: String, value: f64 },

    #[error("{dependency}: max_delay_ms ({max}) is below base_delay_ms ({base})")]
    MaxDelayBelowBase {
        dependency: String,
        base: u64,
        max: u64,
    },

    #[error("{dependency}: budget_ratio must be within 0.0..=1.0, got {value}")]
    BudgetRatio { dependency: String, value: f64 },

    #[error("{dependency}: {violation}")]
    Order {
        dependency: String,
        violation: OrderViolation,
    },

    #[error("{dependency}: '{layer}' is configured but missing from order")]
    LayerNotInOrder { dependency: String, layer: LayerKind },

    #[error("unknown log level '{0}'")]
    LogLevel(String),

    #[error("invalid metrics address '{0}'")]
    MetricsAddress(String),
}

/// Check a parsed config. Every problem found is reported.
pub fn validate_config(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::LogLevel(config.observability.log_level.clone()));
    }
    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    let mut seen = HashSet::new();
    for (index, dep) in config.dependencies.iter().enumerate() {
        if dep.name.trim().is_empty() {
            errors.push(ValidationError::EmptyName(index));
        } else if !seen.insert(dep.name.as_str()) {
            errors.push(ValidationError::DuplicateName(dep.name.clone()));
        }
        validate_dependency(dep, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_dependency(dep: &DependencyConfig, errors: &mut Vec<ValidationError>) {
    let name = || dep.name.clone();
    let below_one = |field| ValidationError::BelowOne {
        dependency: dep.name.clone(),
        field,
    };
    let zero = |field| ValidationError::ZeroDuration {
        dependency: dep.name.clone(),
        field,
    };

    if let Some(cb) = &dep.circuit_breaker {
        if cb.failure_threshold < 1 {
            errors.push(below_one("failure_threshold"));
        }
        if cb.success_threshold < 1 {
            errors.push(below_one("success_threshold"));
        }
        if cb.half_open_max_calls < 1 {
            errors.push(below_one("half_open_max_calls"));
        }
        if cb.open_timeout_ms == 0 {
            errors.push(zero("open_timeout_ms"));
        }
    }

    if let Some(retry) = &dep.retry {
        if retry.max_attempts < 1 {
            errors.push(below_one("max_attempts"));
        }
        if retry.exponential_base.is_nan() || retry.exponential_base <= 1.0 {
            errors.push(ValidationError::ExponentialBase {
                dependency: name(),
                value: retry.exponential_base,
            });
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            errors.push(ValidationError::MaxDelayBelowBase {
                dependency: name(),
                base: retry.base_delay_ms,
                max: retry.max_delay_ms,
            });
        }
        if let Some(ratio) = retry.budget_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                errors.push(ValidationError::BudgetRatio {
                    dependency: name(),
                    value: ratio,
                });
            }
        }
    }

    if let Some(bulkhead) = &dep.bulkhead {
        if bulkhead.max_concurrent < 1 {
            errors.push(below_one("max_concurrent"));
        }
    }

    if let Some(timeout) = &dep.timeout {
        if timeout.timeout_ms == 0 {
            errors.push(zero("timeout_ms"));
        }
    }

    let order = dep.layer_order();
    for violation in check_order(&order) {
        errors.push(ValidationError::Order {
            dependency: name(),
            violation,
        });
    }
    if dep.order.is_some() {
        for layer in [
            LayerKind::Bulkhead,
            LayerKind::CircuitBreaker,
            LayerKind::Retry,
            LayerKind::Timeout,
        ] {
            if dep.has_section(layer) && !order.contains(&layer) {
                errors.push(ValidationError::LayerNotInOrder {
                    dependency: name(),
                    layer,
                });
            }
        }
    }
}
