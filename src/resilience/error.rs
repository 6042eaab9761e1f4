//! Error taxonomy shared by every resilience layer.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by a resilience pipeline.
///
/// Every layer passes errors it does not own through unchanged, so the
/// outermost caller always sees which concern rejected the call.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// Circuit is open; the operation was never invoked.
    #[error("circuit '{resource}' is open, next probe in {retry_after:?}")]
    CircuitOpen {
        resource: String,
        retry_after: Duration,
    },

    /// Bulkhead capacity and wait budget were both exhausted.
    #[error("bulkhead '{resource}' rejected call after {waited:?} (max_concurrent={max_concurrent})")]
    BulkheadRejected {
        resource: String,
        max_concurrent: usize,
        waited: Duration,
    },

    /// A single attempt exceeded its deadline.
    #[error("call to '{resource}' timed out after {timeout:?}")]
    Timeout { resource: String, timeout: Duration },

    /// The caller cancelled while the call was suspended between attempts.
    #[error("call to '{resource}' was cancelled")]
    Cancelled { resource: String },

    /// Error returned by the wrapped operation itself.
    #[error("{0}")]
    Operation(E),
}

/// Result type for pipeline operations.
pub type Outcome<T, E> = Result<T, ResilienceError<E>>;

/// Response class an outer framework layer maps an error to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Circuit open or bulkhead full (503-like).
    ServiceUnavailable,
    /// Attempt deadline exceeded (504-like).
    GatewayTimeout,
    /// The caller gave up.
    Cancelled,
    /// The dependency's own error; mapping belongs to the caller.
    Upstream,
}

impl<E> ResilienceError<E> {
    /// Classify the error for response mapping and fallback selection.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::CircuitOpen { .. } | Self::BulkheadRejected { .. } => {
                FailureClass::ServiceUnavailable
            }
            Self::Timeout { .. } => FailureClass::GatewayTimeout,
            Self::Cancelled { .. } => FailureClass::Cancelled,
            Self::Operation(_) => FailureClass::Upstream,
        }
    }

    /// True when the operation was never invoked because of a local policy.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::BulkheadRejected { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Borrow the underlying operation error, if that is what this is.
    pub fn operation(&self) -> Option<&E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Unwrap into the underlying operation error.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Transform the operation error, keeping policy errors intact.
    pub fn map_operation<F, E2>(self, f: F) -> ResilienceError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Self::CircuitOpen {
                resource,
                retry_after,
            } => ResilienceError::CircuitOpen {
                resource,
                retry_after,
            },
            Self::BulkheadRejected {
                resource,
                max_concurrent,
                waited,
            } => ResilienceError::BulkheadRejected {
                resource,
                max_concurrent,
                waited,
            },
            Self::Timeout { resource, timeout } => ResilienceError::Timeout { resource, timeout },
            Self::Cancelled { resource } => ResilienceError::Cancelled { resource },
            Self::Operation(e) => ResilienceError::Operation(f(e)),
        }
    }
}

/// Classifies an operation error as transient (worth retrying) or permanent.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for io::Error {
    fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::TimedOut
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
        )
    }
}

/// Upstream HTTP status codes that signal a transient condition.
///
/// 408 Request Timeout, 429 Too Many Requests, 502 Bad Gateway,
/// 503 Service Unavailable, 504 Gateway Timeout.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 502 | 503 | 504)
}

/// Default retry classification: timeouts and transient operation errors.
///
/// Circuit-open, bulkhead and cancellation errors are never retried.
pub fn default_retryable<E: Transient>(error: &ResilienceError<E>) -> bool {
    match error {
        ResilienceError::Timeout { .. } => true,
        ResilienceError::Operation(e) => e.is_transient(),
        _ => false,
    }
}
