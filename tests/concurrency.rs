//! Shared breaker and bulkhead state under concurrent callers.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_pipeline::pipeline::Pipeline;
use resilience_pipeline::resilience::{BulkheadConfig, CircuitBreakerConfig, CircuitState};
use resilience_pipeline::ResilienceError;

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bulkhead_bounds_concurrency_through_pipeline() {
    let pipeline: Arc<Pipeline<u32, io::Error>> = Arc::new(
        Pipeline::builder("db")
            .bulkhead(BulkheadConfig {
                max_concurrent: 4,
                max_wait: Duration::from_secs(10),
                max_queued: None,
            })
            .build(),
    );
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let pipeline = pipeline.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                pipeline
                    .execute(|| {
                        let in_flight = in_flight.clone();
                        let peak = peak.clone();
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(0)
                        }
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(pipeline.bulkhead().unwrap().active_count(), 0);
    assert_eq!(pipeline.bulkhead().unwrap().waiting_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_one_probe() {
    let pipeline: Arc<Pipeline<u32, io::Error>> = Arc::new(
        Pipeline::builder("flaky")
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                open_timeout: Duration::from_millis(100),
                half_open_max_calls: 1,
            })
            .build(),
    );
    let breaker = pipeline.circuit_breaker().unwrap().clone();
    breaker.force_open();
    tokio::time::advance(Duration::from_millis(100)).await;

    let invoked = Arc::new(AtomicU32::new(0));
    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let pipeline = pipeline.clone();
            let invoked = invoked.clone();
            tokio::spawn(async move {
                pipeline
                    .execute(|| {
                        let invoked = invoked.clone();
                        async move {
                            invoked.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(1)
                        }
                    })
                    .await
            })
        })
        .collect();

    let mut rejected = 0;
    for task in tasks {
        if let Err(ResilienceError::CircuitOpen { .. }) = task.await.unwrap() {
            rejected += 1;
        }
    }

    assert_eq!(invoked.load(Ordering::SeqCst), 1, "exactly one probe");
    assert_eq!(rejected, 9);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_trip_exactly_once() {
    let sink = Arc::new(resilience_pipeline::observability::RecordingSink::new());
    let pipeline: Arc<Pipeline<u32, io::Error>> = Arc::new(
        Pipeline::builder("burst")
            .sink(sink.clone())
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 5,
                open_timeout: Duration::from_secs(60),
                ..Default::default()
            })
            .build(),
    );
    let op = common::FlakyOp::new(u32::MAX);

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let pipeline = pipeline.clone();
            let op = op.clone();
            tokio::spawn(async move { pipeline.execute(|| op.call()).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }

    assert_eq!(pipeline.circuit_breaker().unwrap().state(), CircuitState::Open);
    assert_eq!(sink.count("circuit_state_changed"), 1);
    let snapshot = pipeline.circuit_breaker().unwrap().snapshot();
    assert_eq!(snapshot.calls_permitted + snapshot.calls_rejected, 50);
}
