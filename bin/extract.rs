//! # Extract
//!
//! Extracts every configured chain into the event store, then optionally folds one chain (or a
//! reconciled pair of chains) into a transfer graph and writes it as JSON.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin extract -- --config Config.toml
//! cargo run --bin extract -- --chain 100 --graph-out graph.json --min-weight 2
//! cargo run --bin extract -- --reconcile 1 100 --graph-out bridged.json
//! ```

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use token_flow_sdk::{
    database::{self, PgStore},
    extractors::ExtractorFactory,
    graph_service::{FilterState, TransferGraph},
    metrics,
    orchestrator::{ChainOutcome, ExtractionOrchestrator},
    reconciler::CrossChainReconciler,
    settings::Settings,
    store::{EventStore, MemoryEventStore, MemoryStatStore, StatStore},
};

#[derive(Parser, Debug)]
#[command(name = "extract", about = "Extract token transfer events and build transfer graphs")]
struct Args {
    /// Settings file
    #[arg(long, default_value = "Config.toml")]
    config: PathBuf,

    /// Only extract this chain id
    #[arg(long)]
    chain: Option<u64>,

    /// Write the filtered graph as JSON
    #[arg(long)]
    graph_out: Option<PathBuf>,

    /// Reconcile bridged transfers from SOURCE to DESTINATION chain
    #[arg(long, num_args = 2, value_names = ["SOURCE", "DESTINATION"])]
    reconcile: Option<Vec<u64>>,

    /// Override app.min_weight
    #[arg(long)]
    min_weight: Option<u32>,

    /// Use in-memory stores even when a database is configured
    #[arg(long)]
    memory: bool,

    /// Prometheus listen address (observability builds only)
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,
}

#[cfg(feature = "observability")]
fn init_logging(settings: &Settings, args: &Args) -> Result<()> {
    use token_flow_sdk::settings::LogFormat;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log.level.clone()));
    match settings.log.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
    }
    metrics::describe_metrics();
    Ok(())
}

#[cfg(not(feature = "observability"))]
fn init_logging(settings: &Settings, args: &Args) -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str()))
        .init();
    if args.metrics_addr.is_some() {
        log::warn!("--metrics-addr ignored: built without the observability feature");
    }
    metrics::describe_metrics();
    Ok(())
}

async fn open_stores(
    settings: &Settings,
    memory: bool,
) -> Result<(Arc<dyn EventStore>, Arc<dyn StatStore>)> {
    if !memory && settings.database.url.is_some() {
        let pool = database::connect(&settings.database).await?;
        let store = Arc::new(PgStore::new(pool));
        return Ok((store.clone(), store));
    }
    info!("Using in-memory stores");
    Ok((Arc::new(MemoryEventStore::new()), Arc::new(MemoryStatStore::new())))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut settings = Settings::from_path(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(min_weight) = args.min_weight {
        settings.app.min_weight = min_weight;
    }
    init_logging(&settings, &args)?;

    let chains: Vec<_> = match args.chain {
        Some(id) => vec![settings
            .chain(id)
            .cloned()
            .ok_or_else(|| anyhow!("chain {} is not configured", id))?],
        None => settings.chains.clone(),
    };

    let (events, stats) = open_stores(&settings, args.memory).await?;
    let orchestrator = ExtractionOrchestrator::new(
        ExtractorFactory::from_settings(&settings),
        events.clone(),
        stats,
        settings.app.version.clone(),
    )
    .with_concurrency(settings.extraction.concurrency);

    let reports = orchestrator.extract_all(&chains).await?;
    for report in &reports {
        match &report.outcome {
            ChainOutcome::Failed { reason } => {
                warn!(chain_id = report.chain_id, %reason, "Chain has no data")
            }
            outcome => info!(chain_id = report.chain_id, ?outcome, "Chain ready"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);

    let filter = FilterState::new(settings.app.min_weight);
    let graph = match args.reconcile.as_deref() {
        Some([source_id, destination_id]) => {
            let source = settings
                .chain(*source_id)
                .ok_or_else(|| anyhow!("chain {} is not configured", source_id))?;
            let destination = settings
                .chain(*destination_id)
                .ok_or_else(|| anyhow!("chain {} is not configured", destination_id))?;
            let reconciler = CrossChainReconciler::new(source, destination)?;

            let source_events = events.get_by_chain(*source_id).await?;
            let destination_events = events.get_by_chain(*destination_id).await?;
            let reconciliation = reconciler.reconcile(&source_events, &destination_events);

            let mut combined = source_events;
            combined.extend(destination_events);
            Some(TransferGraph::build_reconciled(&combined, &reconciliation))
        }
        Some(_) => return Err(anyhow!("--reconcile takes exactly two chain ids")),
        None => match args.chain {
            Some(id) => Some(TransferGraph::from_store(events.as_ref(), id).await?),
            None => None,
        },
    };

    if let Some(graph) = graph {
        let view = graph.apply_filters(&filter);
        info!(
            nodes = view.nodes.len(),
            edges = view.edges.len(),
            min_weight = filter.min_weight,
            "Graph ready"
        );
        if let Some(path) = &args.graph_out {
            std::fs::write(path, serde_json::to_vec_pretty(&view)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Graph written");
        }
    }

    Ok(())
}
