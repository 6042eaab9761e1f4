//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Resilience layers produce:
//!     → events.rs (ResilienceEvent → EventSink)
//!         → TracingSink → logging.rs subscriber (stdout, JSON or pretty)
//!         → MetricsSink → metrics.rs (counters, gauges, histograms)
//!         → RecordingSink (tests)
//!
//! Consumers:
//!     → Log aggregation
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Layers emit events but never own their storage or export
//! - Sinks are injected per pipeline, never looked up globally
//! - Metrics are cheap (atomic increments behind the `metrics` facade)

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{
    EventSink, FanoutSink, MetricsSink, NoopSink, RecordingSink, ResilienceEvent, TracingSink,
};
