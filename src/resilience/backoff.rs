//! Exponential backoff with jitter.
//!
//! `delay(attempt) = min(base * exponential_base^(attempt-1), max)`, then,
//! when jitter is enabled, multiplied by a factor drawn uniformly from
//! `[0.5, 1.0)`. Jitter only ever shortens the delay, so `max` stays a hard cap.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Source of uniform samples in `[0.0, 1.0)`.
pub trait JitterSource: Send + Sync + fmt::Debug {
    fn sample(&self) -> f64;
}

/// Thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Always returns the same sample; for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

/// Computes the delay before the next attempt.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    /// Delay after the `attempt`-th failure (1-based).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Calculate the un-jittered exponential delay for an attempt.
pub fn calculate_backoff(
    attempt: u32,
    base: Duration,
    max: Duration,
    exponential_base: f64,
) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay_nanos = base.as_nanos() as f64 * exponential_base.powi(exponent);
    if !delay_nanos.is_finite() || delay_nanos >= max.as_nanos() as f64 {
        return max;
    }
    Duration::from_nanos(delay_nanos.round() as u64)
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_nanos((delay.as_nanos() as f64 * factor).round() as u64)
}

/// Exponential backoff, optionally jittered.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    exponential_base: f64,
    jitter: Option<Arc<dyn JitterSource>>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, exponential_base: f64) -> Self {
        Self {
            base,
            max,
            exponential_base,
            jitter: None,
        }
    }

    /// Enable jitter using the thread RNG.
    pub fn with_jitter(self) -> Self {
        self.with_jitter_source(Arc::new(RandomJitter))
    }

    /// Enable jitter with an injected sample source.
    pub fn with_jitter_source(mut self, source: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(source);
        self
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let capped = calculate_backoff(attempt, self.base, self.max, self.exponential_base);
        match &self.jitter {
            Some(source) => scale(capped, 0.5 + source.sample() * 0.5),
            None => capped,
        }
    }
}

/// Same delay before every retry.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl BackoffStrategy for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}
