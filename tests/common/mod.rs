//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_pipeline::observability::RecordingSink;
use resilience_pipeline::pipeline::PipelineBuilder;
use resilience_pipeline::resilience::RetryConfig;
use tempfile::NamedTempFile;

/// Operation that fails its first `failures` calls, then succeeds.
///
/// Successful calls return the 1-based call number.
#[derive(Debug)]
pub struct FlakyOp {
    calls: AtomicU32,
    failures: u32,
    kind: io::ErrorKind,
    latency: Duration,
}

impl FlakyOp {
    pub fn new(failures: u32) -> Arc<Self> {
        Self::with_kind(failures, io::ErrorKind::ConnectionReset)
    }

    pub fn with_kind(failures: u32, kind: io::ErrorKind) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures,
            kind,
            latency: Duration::ZERO,
        })
    }

    /// Every call first sleeps for `latency`.
    pub fn slow(failures: u32, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures,
            kind: io::ErrorKind::ConnectionReset,
            latency,
        })
    }

    pub async fn call(&self) -> Result<u32, io::Error> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if n <= self.failures {
            Err(io::Error::new(self.kind, format!("failure {}", n)))
        } else {
            Ok(n)
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Builder wired to a fresh recording sink.
pub fn recorded(name: &str) -> (PipelineBuilder<u32, io::Error>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let builder = PipelineBuilder::new(name).sink(sink.clone());
    (builder, sink)
}

/// Retry settings without jitter so delays are exact.
pub fn exact_retry(max_attempts: u32, base_ms: u64) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_secs(10),
        exponential_base: 2.0,
        jitter: false,
    }
}

/// Write `contents` to a temporary TOML file.
pub fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}
