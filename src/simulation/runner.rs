//! Drives concurrent load through a pipeline set and tallies the outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::lifecycle::cancel::CancelToken;
use crate::pipeline::registry::{PipelineSet, PipelineSnapshot};
use crate::resilience::error::{Outcome, ResilienceError};
use crate::simulation::dependency::{FaultProfile, FlakyDependency, SimError};

/// Pipelines as seen by the simulation; swapped wholesale on reload.
pub type SharedPipelines = ArcSwap<PipelineSet<u64, SimError>>;

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Total calls, spread round-robin over the dependencies.
    pub calls: usize,
    /// Calls in flight at once.
    pub concurrency: usize,
    pub profile: FaultProfile,
    /// Seed for reproducible fault sequences.
    pub seed: Option<u64>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            calls: 200,
            concurrency: 16,
            profile: FaultProfile::default(),
            seed: None,
        }
    }
}

/// How one call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallResult {
    Succeeded,
    Failed,
    CircuitOpen,
    BulkheadRejected,
    TimedOut,
    Cancelled,
    Skipped,
}

impl CallResult {
    fn classify(outcome: &Outcome<u64, SimError>) -> Self {
        match outcome {
            Ok(_) => CallResult::Succeeded,
            Err(ResilienceError::Operation(_)) => CallResult::Failed,
            Err(ResilienceError::CircuitOpen { .. }) => CallResult::CircuitOpen,
            Err(ResilienceError::BulkheadRejected { .. }) => CallResult::BulkheadRejected,
            Err(ResilienceError::Timeout { .. }) => CallResult::TimedOut,
            Err(ResilienceError::Cancelled { .. }) => CallResult::Cancelled,
        }
    }
}

/// Outcome counts for one dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub succeeded: u64,
    pub failed: u64,
    pub circuit_open: u64,
    pub bulkhead_rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Calls not issued because of cancellation or a reload that removed the dependency.
    pub skipped: u64,
    /// Times the dependency itself was invoked, retries included.
    pub invocations: u64,
}

impl DependencyReport {
    fn record(&mut self, result: CallResult) {
        let counter = match result {
            CallResult::Succeeded => &mut self.succeeded,
            CallResult::Failed => &mut self.failed,
            CallResult::CircuitOpen => &mut self.circuit_open,
            CallResult::BulkheadRejected => &mut self.bulkhead_rejected,
            CallResult::TimedOut => &mut self.timed_out,
            CallResult::Cancelled => &mut self.cancelled,
            CallResult::Skipped => &mut self.skipped,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.succeeded
            + self.failed
            + self.circuit_open
            + self.bulkhead_rejected
            + self.timed_out
            + self.cancelled
            + self.skipped
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub elapsed_ms: u128,
    pub dependencies: BTreeMap<String, DependencyReport>,
    /// Pipeline state at the end of the run.
    pub pipelines: Vec<PipelineSnapshot>,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "simulation finished in {} ms", self.elapsed_ms)?;
        for (name, r) in &self.dependencies {
            writeln!(
                f,
                "  {name}: ok={} failed={} circuit_open={} bulkhead_rejected={} timed_out={} cancelled={} skipped={} invocations={}",
                r.succeeded,
                r.failed,
                r.circuit_open,
                r.bulkhead_rejected,
                r.timed_out,
                r.cancelled,
                r.skipped,
                r.invocations
            )?;
        }
        for pipeline in &self.pipelines {
            if let Some(circuit) = &pipeline.circuit {
                writeln!(
                    f,
                    "  {} circuit: {} (rejected {})",
                    pipeline.name, circuit.state, circuit.calls_rejected
                )?;
            }
        }
        Ok(())
    }
}

/// Issue `options.calls` calls against every dependency in `pipelines`.
///
/// The set is re-read for every call, so a reload mid-run takes effect
/// immediately. Once `cancel` fires, remaining calls are skipped.
pub async fn run_simulation(
    pipelines: &SharedPipelines,
    options: &SimulationOptions,
    cancel: &CancelToken,
) -> SimulationReport {
    let names = pipelines.load().names();
    let dependencies: Vec<Arc<FlakyDependency>> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            Arc::new(match options.seed {
                Some(seed) => FlakyDependency::with_seed(name.clone(), options.profile, seed.wrapping_add(i as u64)),
                None => FlakyDependency::new(name.clone(), options.profile),
            })
        })
        .collect();

    let mut report: BTreeMap<String, DependencyReport> = names
        .iter()
        .map(|name| (name.clone(), DependencyReport::default()))
        .collect();
    let start = Instant::now();

    if !dependencies.is_empty() {
        tracing::info!(
            calls = options.calls,
            concurrency = options.concurrency,
            dependencies = dependencies.len(),
            "Starting simulation"
        );

        let mut results = stream::iter(0..options.calls)
            .map(|i| {
                let dependency = Arc::clone(&dependencies[i % dependencies.len()]);
                async move {
                    let result = call_once(pipelines, &dependency, cancel).await;
                    (dependency.name().to_string(), result)
                }
            })
            .buffer_unordered(options.concurrency.max(1));

        while let Some((name, result)) = results.next().await {
            if let Some(entry) = report.get_mut(&name) {
                entry.record(result);
            }
        }
    }

    for dependency in &dependencies {
        if let Some(entry) = report.get_mut(dependency.name()) {
            entry.invocations = dependency.calls();
        }
    }

    SimulationReport {
        elapsed_ms: start.elapsed().as_millis(),
        dependencies: report,
        pipelines: pipelines.load().snapshot(),
    }
}

async fn call_once(
    pipelines: &SharedPipelines,
    dependency: &FlakyDependency,
    cancel: &CancelToken,
) -> CallResult {
    if cancel.is_cancelled() {
        return CallResult::Skipped;
    }
    let pipeline = pipelines.load().get(dependency.name());
    let Some(pipeline) = pipeline else {
        return CallResult::Skipped;
    };
    let outcome = pipeline
        .execute_with_cancel(|| dependency.call(), cancel)
        .await;
    CallResult::classify(&outcome)
}
