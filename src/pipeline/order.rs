//! Layer kinds and ordering rules.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Built-in resilience layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Bulkhead,
    CircuitBreaker,
    Retry,
    Timeout,
}

/// Recommended order, outermost first.
pub const CANONICAL_ORDER: [LayerKind; 4] = [
    LayerKind::Bulkhead,
    LayerKind::CircuitBreaker,
    LayerKind::Retry,
    LayerKind::Timeout,
];

impl LayerKind {
    /// Position in [`CANONICAL_ORDER`].
    pub fn canonical_rank(self) -> usize {
        match self {
            LayerKind::Bulkhead => 0,
            LayerKind::CircuitBreaker => 1,
            LayerKind::Retry => 2,
            LayerKind::Timeout => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Bulkhead => "bulkhead",
            LayerKind::CircuitBreaker => "circuit_breaker",
            LayerKind::Retry => "retry",
            LayerKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A layer order that breaks a composition rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderViolation {
    #[error("bulkhead must be the outermost layer")]
    BulkheadNotOutermost,

    #[error("timeout must sit inside retry so every attempt gets a fresh deadline")]
    TimeoutOutsideRetry,

    #[error("layer '{0}' appears more than once")]
    Duplicate(LayerKind),
}

/// Check an outermost-first layer order against the composition rules.
pub fn check_order(kinds: &[LayerKind]) -> Vec<OrderViolation> {
    let mut violations = Vec::new();

    for (i, kind) in kinds.iter().enumerate() {
        if kinds[..i].contains(kind) && !violations.contains(&OrderViolation::Duplicate(*kind)) {
            violations.push(OrderViolation::Duplicate(*kind));
        }
    }

    if let Some(pos) = kinds.iter().position(|k| *k == LayerKind::Bulkhead) {
        if pos != 0 {
            violations.push(OrderViolation::BulkheadNotOutermost);
        }
    }

    let retry = kinds.iter().position(|k| *k == LayerKind::Retry);
    let timeout = kinds.iter().position(|k| *k == LayerKind::Timeout);
    if let (Some(retry), Some(timeout)) = (retry, timeout) {
        if timeout < retry {
            violations.push(OrderViolation::TimeoutOutsideRetry);
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_is_clean() {
        assert!(check_order(&CANONICAL_ORDER).is_empty());
        assert!(check_order(&[LayerKind::Retry, LayerKind::Timeout]).is_empty());
        assert!(check_order(&[]).is_empty());
    }

    #[test]
    fn test_violations() {
        let order = [
            LayerKind::Timeout,
            LayerKind::Bulkhead,
            LayerKind::Retry,
            LayerKind::Retry,
        ];
        let violations = check_order(&order);
        assert_eq!(
            violations,
            vec![
                OrderViolation::Duplicate(LayerKind::Retry),
                OrderViolation::BulkheadNotOutermost,
                OrderViolation::TimeoutOutsideRetry,
            ]
        );
    }

    #[test]
    fn test_deserialize_kind() {
        #[derive(Deserialize)]
        struct Wrapper {
            order: Vec<LayerKind>,
        }
        let parsed: Wrapper = toml::from_str(r#"order = ["bulkhead", "circuit_breaker"]"#).unwrap();
        assert_eq!(parsed.order, vec![LayerKind::Bulkhead, LayerKind::CircuitBreaker]);
    }
}
