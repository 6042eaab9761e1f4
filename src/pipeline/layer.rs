//! `tower` adapter: run any `Service` behind a resilience pipeline.
//!
//! Every request becomes one pipeline execution. Retries call a fresh clone
//! of the inner service with a clone of the request, so both must be
//! `Clone`.

use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service, ServiceExt};

use crate::pipeline::chain::{BoxFuture, Pipeline};
use crate::resilience::error::ResilienceError;

/// Wraps services in a shared pipeline.
pub struct ResilienceLayer<T, E> {
    pipeline: Arc<Pipeline<T, E>>,
}

impl<T, E> ResilienceLayer<T, E> {
    pub fn new(pipeline: Arc<Pipeline<T, E>>) -> Self {
        Self { pipeline }
    }
}

impl<T, E> Clone for ResilienceLayer<T, E> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

impl<S, T, E> Layer<S> for ResilienceLayer<T, E> {
    type Service = ResilienceService<S, T, E>;

    fn layer(&self, inner: S) -> Self::Service {
        ResilienceService {
            inner,
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

/// Service produced by [`ResilienceLayer`].
pub struct ResilienceService<S, T, E> {
    inner: S,
    pipeline: Arc<Pipeline<T, E>>,
}

impl<S: Clone, T, E> Clone for ResilienceService<S, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

impl<S, T, E> ResilienceService<S, T, E> {
    pub fn pipeline(&self) -> &Arc<Pipeline<T, E>> {
        &self.pipeline
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, Req, T, E> Service<Req> for ResilienceService<S, T, E>
where
    S: Service<Req, Response = T, Error = E> + Clone + Send + Sync + 'static,
    S::Future: Send,
    Req: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    type Response = T;
    type Error = ResilienceError<E>;
    type Future = BoxFuture<'static, Result<T, ResilienceError<E>>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness of the inner service is awaited per attempt, inside the
        // pipeline, so bulkhead and breaker decide before we wait on it.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let pipeline = Arc::clone(&self.pipeline);
        let inner = self.inner.clone();
        Box::pin(async move {
            pipeline
                .execute(|| {
                    let svc = inner.clone();
                    let req = req.clone();
                    async move { svc.oneshot(req).await }
                })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;
    use crate::resilience::error::FailureClass;
    use crate::resilience::retries::RetryConfig;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_retries_inner_service() {
        let calls = Arc::new(AtomicU32::new(0));
        let svc = tower::service_fn({
            let calls = calls.clone();
            move |req: u32| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(io::Error::from(io::ErrorKind::ConnectionReset))
                    } else {
                        Ok(req * 2)
                    }
                }
            }
        });
        let pipeline = Arc::new(
            Pipeline::<u32, io::Error>::builder("doubler")
                .retry(RetryConfig {
                    base_delay: Duration::from_millis(1),
                    jitter: false,
                    ..Default::default()
                })
                .build(),
        );

        let response = ResilienceLayer::new(pipeline)
            .layer(svc)
            .oneshot(21)
            .await
            .unwrap();
        assert_eq!(response, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_circuit_maps_to_unavailable() {
        let svc = tower::service_fn(|_req: ()| async {
            Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        });
        let pipeline = Arc::new(
            Pipeline::<(), io::Error>::builder("down")
                .circuit_breaker(CircuitBreakerConfig {
                    failure_threshold: 1,
                    ..Default::default()
                })
                .build(),
        );
        let mut service = ResilienceLayer::new(pipeline).layer(svc);

        let first = service.ready().await.unwrap().call(()).await.unwrap_err();
        assert_eq!(first.class(), FailureClass::Upstream);

        let second = service.ready().await.unwrap().call(()).await.unwrap_err();
        assert_eq!(second.class(), FailureClass::ServiceUnavailable);
        assert!(service.pipeline().circuit_breaker().is_some());
    }
}
