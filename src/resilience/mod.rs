//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a dependency (canonical order, outermost first):
//!     → bulkhead.rs (bound admitted concurrency, FIFO wait queue)
//!     → circuit_breaker.rs (fail fast while the dependency is known down)
//!     → retries.rs (classify failure, back off via backoff.rs, try again)
//!     → timeouts.rs (fresh deadline per attempt)
//!     → operation
//! ```
//!
//! # Design Decisions
//! - Every failure is an explicit `ResilienceError` variant (error.rs)
//! - Time comes from an injectable `Clock` (clock.rs)
//! - Breaker and bulkhead state is per dependency, never global
//! - All resilience logic is composable middleware (see `pipeline`)

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod retries;
pub mod timeouts;

pub use backoff::{BackoffStrategy, ConstantBackoff, ExponentialBackoff, FixedJitter, JitterSource};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadSnapshot};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FailureClass, Outcome, ResilienceError, Transient};
pub use retries::{Retry, RetryBudget, RetryConfig};
pub use timeouts::{Timeout, TimeoutConfig};
