//! Resilience pipeline simulator.
//!
//! Loads a pipeline config, then drives concurrent calls through it against
//! fake dependencies with injected faults.
//!
//! ```text
//!   resilience.toml ──▶ load_config ──▶ PipelineSet ──▶ ArcSwap
//!          │                                              │
//!          └── --watch: ConfigWatcher ── rebuild & swap ──┤
//!                                                         ▼
//!   run_simulation ──▶ Pipeline::execute ──▶ FlakyDependency
//!          │
//!          └──▶ report (text / JSON)
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use clap::Parser;

use resilience_pipeline::config::{load_config, ConfigWatcher};
use resilience_pipeline::lifecycle::{signals, CancelToken};
use resilience_pipeline::observability::{
    logging::init_logging, metrics::init_metrics, EventSink, FanoutSink, MetricsSink, TracingSink,
};
use resilience_pipeline::pipeline::{PipelineContext, PipelineSet};
use resilience_pipeline::simulation::{run_simulation, FaultProfile, SharedPipelines, SimulationOptions};

#[derive(Parser)]
#[command(name = "resilience-sim")]
#[command(about = "Drive simulated load through resilience pipelines", long_about = None)]
struct Cli {
    /// Pipeline configuration file.
    #[arg(short, long, default_value = "resilience.toml")]
    config: PathBuf,

    /// Total calls across all dependencies.
    #[arg(long, default_value_t = 200)]
    calls: usize,

    /// Calls in flight at once.
    #[arg(long, default_value_t = 16)]
    concurrency: usize,

    /// Fraction of calls failing with a transient error.
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,

    /// Fraction of calls failing with a permanent error.
    #[arg(long, default_value_t = 0.02)]
    permanent_rate: f64,

    /// Fraction of calls that stall well past their normal latency.
    #[arg(long, default_value_t = 0.01)]
    hang_rate: f64,

    /// Mean latency of a simulated call in milliseconds.
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// Seed for a reproducible fault sequence.
    #[arg(long)]
    seed: Option<u64>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Reload pipelines when the config file changes.
    #[arg(long)]
    watch: bool,

    /// Expose Prometheus metrics here (overrides the config file).
    #[arg(long)]
    metrics_address: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    init_logging(&config.observability)?;
    tracing::info!(path = ?cli.config, dependencies = config.dependencies.len(), "Configuration loaded");

    let metrics_addr = match cli.metrics_address {
        Some(addr) => Some(addr),
        None if config.observability.metrics_enabled => {
            Some(config.observability.metrics_address.parse()?)
        }
        None => None,
    };
    let mut sink = FanoutSink::new(vec![Arc::new(TracingSink)]);
    if let Some(addr) = metrics_addr {
        init_metrics(addr)?;
        sink.push(Arc::new(MetricsSink));
    }

    let cancel = CancelToken::new();
    signals::cancel_on_shutdown(cancel.clone());

    let ctx = PipelineContext {
        sink: Arc::new(sink) as Arc<dyn EventSink>,
        cancel: Some(cancel.clone()),
        ..Default::default()
    };
    let pipelines: Arc<SharedPipelines> =
        Arc::new(ArcSwap::from_pointee(PipelineSet::from_config(&config, &ctx)));

    // Held for the whole run; dropping it stops the watch.
    let _watcher = if cli.watch {
        let (watcher, mut updates) = ConfigWatcher::new(&cli.config);
        let handle = watcher.run()?;
        let pipelines = Arc::clone(&pipelines);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                pipelines.store(Arc::new(PipelineSet::from_config(&config, &ctx)));
                tracing::info!(dependencies = config.dependencies.len(), "Pipelines reloaded");
            }
        });
        Some(handle)
    } else {
        None
    };

    let options = SimulationOptions {
        calls: cli.calls,
        concurrency: cli.concurrency,
        profile: FaultProfile {
            failure_rate: cli.failure_rate,
            permanent_rate: cli.permanent_rate,
            hang_rate: cli.hang_rate,
            latency: Duration::from_millis(cli.latency_ms),
        },
        seed: cli.seed,
    };
    let report = run_simulation(&pipelines, &options, &cancel).await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }

    tracing::info!("Simulation complete");
    Ok(())
}
