//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → cancel the process-wide CancelToken
//!
//! Cancellation (cancel.rs):
//!     CancelToken → Retry waits return Cancelled immediately
//! ```
//!
//! # Design Decisions
//! - One token per process (or per caller); clones share the signal
//! - Once cancelled, a token stays cancelled

pub mod cancel;
pub mod signals;

pub use cancel::CancelToken;
