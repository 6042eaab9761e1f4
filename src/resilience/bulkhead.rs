//! Bulkhead (concurrency limiting).
//!
//! # Responsibilities
//! - Bound the number of in-flight calls to one dependency
//! - Queue callers up to `max_wait`, admit them in arrival order
//! - Reject with a distinct error once capacity and wait budget are spent
//!
//! # Design Decisions
//! - Admission is a FIFO-fair `tokio::sync::Semaphore`; the semaphore is the
//!   single mutation point for the active count and the wait queue
//! - Permits are RAII, so a call that panics or is dropped still frees its slot
//! - A caller that times out in the queue is removed from it when its
//!   acquire future is dropped

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::observability::events::{default_sink, EventSink, ResilienceEvent};
use crate::pipeline::chain::{BoxFuture, Middleware, Next};
use crate::resilience::error::{Outcome, ResilienceError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    /// How long a caller may queue before being rejected. Zero disables queueing.
    pub max_wait: Duration,
    /// Upper bound on queued callers; `None` means unbounded.
    pub max_queued: Option<usize>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait: Duration::from_secs(1),
            max_queued: None,
        }
    }
}

/// Point-in-time view of a bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadSnapshot {
    pub resource: String,
    pub max_concurrent: usize,
    pub active: usize,
    pub waiting: usize,
    pub rejected: u64,
}

#[derive(Debug)]
pub struct Bulkhead {
    resource: String,
    config: BulkheadConfig,
    semaphore: Semaphore,
    waiting: AtomicUsize,
    rejected: AtomicUsize,
    sink: Arc<dyn EventSink>,
}

impl Bulkhead {
    pub fn new(resource: impl Into<String>, mut config: BulkheadConfig) -> Self {
        config.max_concurrent = config.max_concurrent.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            resource: resource.into(),
            semaphore: Semaphore::new(config.max_concurrent),
            config,
            waiting: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            sink: default_sink(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Calls currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.config.max_concurrent - self.semaphore.available_permits()
    }

    /// Calls currently queued for a slot.
    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> BulkheadSnapshot {
        BulkheadSnapshot {
            resource: self.resource.clone(),
            max_concurrent: self.config.max_concurrent,
            active: self.active_count(),
            waiting: self.waiting_count(),
            rejected: self.rejected.load(Ordering::Relaxed) as u64,
        }
    }

    /// Run `op` once a slot is free.
    ///
    /// The slot is held until `op` completes (or its future is dropped).
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        let _permit = self.acquire().await?;
        op().await
    }

    async fn acquire<E>(&self) -> Result<SemaphorePermit<'_>, ResilienceError<E>> {
        // The semaphore hands released permits to queued waiters first, so a
        // successful try_acquire never jumps the queue.
        if let Ok(permit) = self.semaphore.try_acquire() {
            return Ok(permit);
        }

        if self.config.max_wait.is_zero() {
            return Err(self.reject(Duration::ZERO));
        }
        let Some(queued) = self.enqueue() else {
            return Err(self.reject(Duration::ZERO));
        };

        let start = Instant::now();
        let acquired = tokio::time::timeout(self.config.max_wait, self.semaphore.acquire()).await;
        drop(queued);

        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            // Timed out, or the semaphore was closed (never happens: it is owned here).
            Ok(Err(_)) | Err(_) => Err(self.reject(start.elapsed())),
        }
    }

    /// Reserve a place in the queue, respecting `max_queued`.
    fn enqueue(&self) -> Option<QueueGuard<'_>> {
        let mut current = self.waiting.load(Ordering::Acquire);
        loop {
            if self.config.max_queued.is_some_and(|max| current >= max) {
                return None;
            }
            match self.waiting.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(QueueGuard { waiting: &self.waiting }),
                Err(actual) => current = actual,
            }
        }
    }

    fn reject<E>(&self, waited: Duration) -> ResilienceError<E> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.sink.record(&ResilienceEvent::BulkheadRejected {
            resource: self.resource.clone(),
            active: self.active_count(),
            waiting: self.waiting_count(),
            waited,
        });
        ResilienceError::BulkheadRejected {
            resource: self.resource.clone(),
            max_concurrent: self.config.max_concurrent,
            waited,
        }
    }
}

/// Keeps the waiting count accurate even when the caller is dropped mid-wait.
struct QueueGuard<'a> {
    waiting: &'a AtomicUsize,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T, E> Middleware<T, E> for Bulkhead
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn name(&self) -> &'static str {
        "bulkhead"
    }

    fn handle<'a>(&'a self, next: Next<'a, T, E>) -> BoxFuture<'a, Outcome<T, E>> {
        Box::pin(self.execute(move || next.run()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::events::RecordingSink;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    fn config(max_concurrent: usize, max_wait_ms: u64) -> BulkheadConfig {
        BulkheadConfig {
            max_concurrent,
            max_wait: Duration::from_millis(max_wait_ms),
            max_queued: None,
        }
    }

    #[tokio::test]
    async fn test_admits_up_to_capacity() {
        let bulkhead = Bulkhead::new("db", config(2, 0));
        let result: Outcome<u32, String> = bulkhead
            .execute(|| async {
                assert_eq!(bulkhead.active_count(), 1);
                Ok(1)
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_after_max_wait() {
        let sink = Arc::new(RecordingSink::new());
        let bulkhead = Arc::new(Bulkhead::new("db", config(1, 50)).with_sink(sink.clone()));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (held_tx, held_rx) = oneshot::channel::<()>();

        let holder = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                let _: Outcome<(), String> = bulkhead
                    .execute(|| async move {
                        let _ = held_tx.send(());
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await;
            })
        };
        held_rx.await.unwrap();

        let start = Instant::now();
        let result: Outcome<(), String> = bulkhead.execute(|| async { Ok(()) }).await;
        match result {
            Err(ResilienceError::BulkheadRejected { max_concurrent, waited, .. }) => {
                assert_eq!(max_concurrent, 1);
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(bulkhead.waiting_count(), 0, "rejected caller leaves the queue");
        assert_eq!(sink.count("bulkhead_rejected"), 1);

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        assert_eq!(bulkhead.active_count(), 0);
        assert_eq!(bulkhead.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_zero_wait_rejects_immediately() {
        let bulkhead = Bulkhead::new("db", config(1, 0));
        let inner: Outcome<Outcome<(), String>, String> = bulkhead
            .execute(|| async { Ok(bulkhead.execute(|| async { Ok(()) }).await) })
            .await;
        assert!(matches!(
            inner.unwrap(),
            Err(ResilienceError::BulkheadRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let bulkhead = Arc::new(Bulkhead::new("db", config(1, 10_000)));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (held_tx, held_rx) = oneshot::channel::<()>();

        let holder = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                let _: Outcome<(), String> = bulkhead
                    .execute(|| async move {
                        let _ = held_tx.send(());
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await;
            })
        };
        held_rx.await.unwrap();

        let mut waiters = Vec::new();
        for id in 0..3 {
            let waiter = bulkhead.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                let _: Outcome<(), String> = waiter
                    .execute(|| async move {
                        order.lock().unwrap().push(id);
                        Ok(())
                    })
                    .await;
            }));
            // Make sure caller `id` is queued before the next one arrives.
            while bulkhead.waiting_count() < id + 1 {
                tokio::task::yield_now().await;
            }
        }

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_queue_bound() {
        let bulkhead = Arc::new(Bulkhead::new(
            "db",
            BulkheadConfig {
                max_queued: Some(0),
                ..config(1, 10_000)
            },
        ));
        let result: Outcome<Outcome<(), String>, String> = bulkhead
            .execute(|| async { Ok(bulkhead.execute(|| async { Ok(()) }).await) })
            .await;
        assert!(matches!(
            result.unwrap(),
            Err(ResilienceError::BulkheadRejected { waited, .. }) if waited.is_zero()
        ));
    }

    #[test]
    fn test_capacity_is_clamped_to_semaphore_limit() {
        let bulkhead = Bulkhead::new("db", config(usize::MAX, 0));
        assert_eq!(bulkhead.config().max_concurrent, Semaphore::MAX_PERMITS);
        assert_eq!(bulkhead.active_count(), 0);

        let bulkhead = Bulkhead::new("db", config(0, 0));
        assert_eq!(bulkhead.config().max_concurrent, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_invariant_under_load() {
        let bulkhead = Arc::new(Bulkhead::new("db", config(3, 10_000)));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let bulkhead = bulkhead.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _: Outcome<(), String> = bulkhead
                        .execute(|| async {
                            peak.fetch_max(bulkhead.active_count(), Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            Ok(())
                        })
                        .await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(bulkhead.active_count(), 0);
        assert_eq!(bulkhead.waiting_count(), 0);
    }
}
