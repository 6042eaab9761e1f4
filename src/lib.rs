//! Resilience middleware pipelines for async Rust.
//!
//! Wraps calls to downstream dependencies in composable layers: bulkhead,
//! circuit breaker, retry with backoff and per-attempt timeout. Pipelines
//! are built once per dependency (in code or from TOML config) and shared
//! by every caller.

pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod simulation;

pub use config::schema::ResilienceConfig;
pub use lifecycle::CancelToken;
pub use pipeline::{Middleware, Next, Pipeline, PipelineBuilder, PipelineSet};
pub use resilience::error::{FailureClass, Outcome, ResilienceError, Transient};
