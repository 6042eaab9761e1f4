//! Per-dependency pipelines built from configuration.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::schema::{DependencyConfig, ResilienceConfig};
use crate::lifecycle::cancel::CancelToken;
use crate::observability::events::{default_sink, EventSink};
use crate::pipeline::chain::{Pipeline, PipelineBuilder};
use crate::pipeline::order::LayerKind;
use crate::resilience::bulkhead::BulkheadSnapshot;
use crate::resilience::circuit_breaker::CircuitSnapshot;
use crate::resilience::clock::{system_clock, Clock};
use crate::resilience::error::Transient;
use crate::resilience::retries::RetryBudget;

/// Collaborators shared by every pipeline built from one config.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub sink: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    /// Aborts retry waits in every pipeline when fired.
    pub cancel: Option<CancelToken>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self {
            sink: default_sink(),
            clock: system_clock(),
            cancel: None,
        }
    }
}

/// Build the pipeline described by one dependency section.
///
/// Layers listed in `order` without a section get default settings.
pub fn pipeline_from_config<T, E>(dep: &DependencyConfig, ctx: &PipelineContext) -> Pipeline<T, E>
where
    T: Send + 'static,
    E: Transient + Send + 'static,
{
    let mut builder: PipelineBuilder<T, E> = Pipeline::builder(dep.name.clone())
        .sink(ctx.sink.clone())
        .clock(ctx.clock.clone());
    if let Some(token) = &ctx.cancel {
        builder = builder.cancel_token(token.clone());
    }

    for kind in dep.layer_order() {
        builder = match kind {
            LayerKind::Bulkhead => {
                builder.bulkhead((&dep.bulkhead.clone().unwrap_or_default()).into())
            }
            LayerKind::CircuitBreaker => {
                builder.circuit_breaker((&dep.circuit_breaker.clone().unwrap_or_default()).into())
            }
            LayerKind::Retry => {
                let settings = dep.retry.clone().unwrap_or_default();
                let builder = match settings.budget_ratio {
                    Some(ratio) => builder.retry_budget(Arc::new(RetryBudget::new(
                        ratio,
                        settings.budget_min_retries,
                    ))),
                    None => builder,
                };
                builder.retry((&settings).into())
            }
            LayerKind::Timeout => {
                builder.timeout((&dep.timeout.clone().unwrap_or_default()).into())
            }
        };
    }
    builder.build()
}

/// State of one pipeline, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub name: String,
    pub layers: Vec<&'static str>,
    pub circuit: Option<CircuitSnapshot>,
    pub bulkhead: Option<BulkheadSnapshot>,
}

/// Pipelines keyed by dependency name.
///
/// Each dependency owns its own breaker and bulkhead; nothing is shared
/// between entries.
pub struct PipelineSet<T, E> {
    pipelines: DashMap<String, Arc<Pipeline<T, E>>>,
}

impl<T, E> Default for PipelineSet<T, E> {
    fn default() -> Self {
        Self {
            pipelines: DashMap::new(),
        }
    }
}

impl<T, E> std::fmt::Debug for PipelineSet<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSet")
            .field("pipelines", &self.names())
            .finish()
    }
}

impl<T, E> PipelineSet<T, E>
where
    T: Send + 'static,
    E: Transient + Send + 'static,
{
    /// Build one pipeline per configured dependency.
    pub fn from_config(config: &ResilienceConfig, ctx: &PipelineContext) -> Self {
        let set = Self::default();
        for dep in &config.dependencies {
            set.insert(pipeline_from_config(dep, ctx));
        }
        tracing::info!(pipelines = set.len(), "Pipeline set built");
        set
    }
}

impl<T, E> PipelineSet<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pipeline, replacing any with the same name.
    pub fn insert(&self, pipeline: Pipeline<T, E>) -> Option<Arc<Pipeline<T, E>>> {
        self.pipelines
            .insert(pipeline.name().to_string(), Arc::new(pipeline))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline<T, E>>> {
        self.pipelines.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Pipeline<T, E>>> {
        self.pipelines.remove(name).map(|(_, pipeline)| pipeline)
    }

    /// Dependency names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Snapshot every pipeline, sorted by name.
    pub fn snapshot(&self) -> Vec<PipelineSnapshot> {
        let mut snapshots: Vec<PipelineSnapshot> = self
            .pipelines
            .iter()
            .map(|entry| {
                let pipeline = entry.value();
                PipelineSnapshot {
                    name: pipeline.name().to_string(),
                    layers: pipeline.layer_names(),
                    circuit: pipeline.circuit_breaker().map(|cb| cb.snapshot()),
                    bulkhead: pipeline.bulkhead().map(|b| b.snapshot()),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_config;
    use crate::resilience::circuit_breaker::CircuitState;
    use std::io;

    const CONFIG: &str = r#"
        [[dependencies]]
        name = "payments"
        [dependencies.bulkhead]
        max_concurrent = 4
        [dependencies.circuit_breaker]
        failure_threshold = 2
        [dependencies.retry]
        max_attempts = 2
        base_delay_ms = 1
        jitter = false
        [dependencies.timeout]
        timeout_ms = 500

        [[dependencies]]
        name = "search"
        order = ["timeout"]
    "#;

    #[test]
    fn test_builds_one_pipeline_per_dependency() {
        let config = parse_config(CONFIG).unwrap();
        let set: PipelineSet<u32, io::Error> =
            PipelineSet::from_config(&config, &PipelineContext::default());

        assert_eq!(set.names(), vec!["payments", "search"]);
        let payments = set.get("payments").unwrap();
        assert_eq!(
            payments.layer_names(),
            vec!["bulkhead", "circuit_breaker", "retry", "timeout"]
        );
        assert_eq!(payments.bulkhead().unwrap().config().max_concurrent, 4);
        assert_eq!(set.get("search").unwrap().layer_names(), vec!["timeout"]);
        assert!(set.get("missing").is_none());

        let removed = set.remove("search").unwrap();
        assert_eq!(removed.name(), "search");
        assert_eq!(set.names(), vec!["payments"]);
        assert!(set.remove("search").is_none());
    }

    #[tokio::test]
    async fn test_dependencies_do_not_share_state() {
        let config = parse_config(CONFIG).unwrap();
        let set: PipelineSet<u32, io::Error> =
            PipelineSet::from_config(&config, &PipelineContext::default());

        let payments = set.get("payments").unwrap();
        for _ in 0..2 {
            let _ = payments
                .execute(|| async { Err(io::Error::from(io::ErrorKind::ConnectionRefused)) })
                .await;
        }

        let snapshot = set.snapshot();
        assert_eq!(snapshot[0].circuit.as_ref().unwrap().state, CircuitState::Open);
        assert!(snapshot[1].circuit.is_none());

        let replaced = set.insert(pipeline_from_config(
            &config.dependencies[0],
            &PipelineContext::default(),
        ));
        assert!(replaced.is_some());
        assert_eq!(
            set.get("payments").unwrap().circuit_breaker().unwrap().state(),
            CircuitState::Closed
        );
    }
}
