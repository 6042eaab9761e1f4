//! Simulated downstream dependency with injected faults.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::resilience::error::Transient;

/// Errors a simulated dependency can return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// Temporary outage, worth retrying.
    #[error("{0} is unavailable")]
    Unavailable(String),

    /// The request itself is bad; retrying will not help.
    #[error("{0} rejected the request")]
    Rejected(String),
}

impl Transient for SimError {
    fn is_transient(&self) -> bool {
        matches!(self, SimError::Unavailable(_))
    }
}

/// How often and how badly a dependency misbehaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultProfile {
    /// Fraction of calls failing with a transient error.
    pub failure_rate: f64,
    /// Fraction of calls failing with a permanent error.
    pub permanent_rate: f64,
    /// Fraction of calls that stall for 20x the normal latency.
    pub hang_rate: f64,
    /// Mean latency; each call takes 0.5x to 1.5x of it.
    pub latency: Duration,
}

impl Default for FaultProfile {
    fn default() -> Self {
        Self {
            failure_rate: 0.2,
            permanent_rate: 0.02,
            hang_rate: 0.01,
            latency: Duration::from_millis(20),
        }
    }
}

/// A fake dependency that fails according to its [`FaultProfile`].
#[derive(Debug)]
pub struct FlakyDependency {
    name: String,
    profile: FaultProfile,
    rng: Mutex<fastrand::Rng>,
    calls: AtomicU64,
}

impl FlakyDependency {
    pub fn new(name: impl Into<String>, profile: FaultProfile) -> Self {
        Self::with_rng(name, profile, fastrand::Rng::new())
    }

    /// Deterministic fault sequence for reproducible runs.
    pub fn with_seed(name: impl Into<String>, profile: FaultProfile, seed: u64) -> Self {
        Self::with_rng(name, profile, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(name: impl Into<String>, profile: FaultProfile, rng: fastrand::Rng) -> Self {
        Self {
            name: name.into(),
            profile,
            rng: Mutex::new(rng),
            calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Times the dependency was actually invoked.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// One request. Returns the call sequence number on success.
    pub async fn call(&self) -> Result<u64, SimError> {
        let seq = self.calls.fetch_add(1, Ordering::Relaxed);
        let (roll, spread) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            (rng.f64(), rng.f64())
        };
        let latency = self.profile.latency.mul_f64(0.5 + spread);

        let p = &self.profile;
        if roll < p.permanent_rate {
            tokio::time::sleep(latency).await;
            Err(SimError::Rejected(self.name.clone()))
        } else if roll < p.permanent_rate + p.failure_rate {
            tokio::time::sleep(latency).await;
            Err(SimError::Unavailable(self.name.clone()))
        } else if roll < p.permanent_rate + p.failure_rate + p.hang_rate {
            tokio::time::sleep(latency * 20).await;
            Ok(seq)
        } else {
            tokio::time::sleep(latency).await;
            Ok(seq)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(failure_rate: f64, permanent_rate: f64) -> FaultProfile {
        FaultProfile {
            failure_rate,
            permanent_rate,
            hang_rate: 0.0,
            latency: Duration::from_millis(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_dependency_always_succeeds() {
        let dep = FlakyDependency::with_seed("db", profile(0.0, 0.0), 7);
        for expected in 0..5 {
            assert_eq!(dep.call().await, Ok(expected));
        }
        assert_eq!(dep.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_kinds() {
        let down = FlakyDependency::with_seed("db", profile(1.0, 0.0), 7);
        let err = down.call().await.unwrap_err();
        assert!(err.is_transient());

        let broken = FlakyDependency::with_seed("db", profile(0.0, 1.0), 7);
        let err = broken.call().await.unwrap_err();
        assert_eq!(err, SimError::Rejected("db".into()));
        assert!(!err.is_transient());
    }
}
