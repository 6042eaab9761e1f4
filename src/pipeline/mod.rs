//! Pipeline composition subsystem.
//!
//! # Data Flow
//! ```text
//! Wiring time:
//!     PipelineBuilder / registry.rs (from config)
//!     → chain.rs (ordered slice of Middleware, checked by order.rs)
//!
//! Per call:
//!     Pipeline::execute(op) or ResilienceService::call(req) (layer.rs)
//!     → Next::run walks the slice, outermost layer first
//!     → operation
//! ```
//!
//! # Design Decisions
//! - A pipeline is built once and shared; calls never rebuild it
//! - Layer order is caller-specified; unusual orders are logged, not refused
//! - Custom concerns plug in through the same `Middleware` trait

pub mod chain;
pub mod layer;
pub mod order;
pub mod registry;

pub use chain::{BoxFuture, Composed, Middleware, Next, Operation, Pipeline, PipelineBuilder};
pub use layer::{ResilienceLayer, ResilienceService};
pub use order::{check_order, LayerKind, OrderViolation, CANONICAL_ORDER};
pub use registry::{pipeline_from_config, PipelineContext, PipelineSet, PipelineSnapshot};
