use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rampart::clock::SystemClock;
use rampart::config::{BackendKind, RampartConfig};
use rampart::detection::Observation;
use rampart::mesh::{Cluster, ClusterConfig, MeshCounterStore};
use rampart::ratelimit::{CounterStore, RateLimitService};

/// Adaptive rate limiting and attack detection engine.
#[derive(Parser)]
#[command(name = "rampart")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide a stream of requests.
    ///
    /// Reads one JSON observation per line from stdin and writes one JSON
    /// decision per line to stdout.
    Replay {
        /// Configuration file (YAML, TOML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Load and validate a configuration file.
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Replay { config } => replay(config).await,
        Commands::Validate { config } => {
            let loaded = RampartConfig::from_file(&config)
                .with_context(|| format!("invalid configuration {}", config.display()))?;
            println!("{}", serde_json::to_string_pretty(&loaded)?);
            Ok(())
        }
    }
}

/// Logs go to stderr so stdout carries only decisions.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Text => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn replay(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Starting Rampart");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &config_path {
        Some(path) => RampartConfig::from_file(path)?,
        None => RampartConfig::default(),
    };

    let cluster = match (&config.backend.kind, &config.backend.mesh) {
        (BackendKind::Mesh, Some(mesh)) => {
            let cluster = Cluster::start(ClusterConfig::from(mesh)).await?;
            info!(
                node_id = %cluster.node_id(),
                live_nodes = cluster.live_node_count().await,
                "Joined gossip mesh"
            );
            Some(Arc::new(cluster))
        }
        _ => None,
    };
    let primary = cluster
        .clone()
        .map(|cluster| Arc::new(MeshCounterStore::new(cluster)) as Arc<dyn CounterStore>);

    let service = Arc::new(RateLimitService::with_parts(config, Arc::new(SystemClock), primary)?);
    let cleanup = service.spawn_cleanup();

    let lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let processed = tokio::select! {
        processed = decide_all(&service, lines) => processed?,
        _ = shutdown_signal() => {
            info!("Stopped reading observations");
            0
        }
    };
    info!(processed = processed, "Replay finished");

    cleanup.shutdown().await;
    drop(service);
    if let Some(cluster) = cluster.and_then(|c| Arc::try_unwrap(c).ok()) {
        cluster.shutdown().await?;
    }

    info!("Rampart stopped");
    Ok(())
}

/// Decide every observation in `lines`. Malformed lines are skipped.
async fn decide_all<S>(service: &RateLimitService, mut lines: S) -> anyhow::Result<usize>
where
    S: futures::Stream<Item = std::io::Result<String>> + Unpin,
{
    let mut stdout = tokio::io::stdout();
    let mut processed = 0;

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let observation: Observation = match serde_json::from_str(&line) {
            Ok(observation) => observation,
            Err(e) => {
                warn!(error = %e, "Skipping malformed observation");
                continue;
            }
        };

        let result = service.check(&observation.identifier, &observation).await;
        let mut out = serde_json::to_vec(&result)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        processed += 1;
    }

    stdout.flush().await?;
    Ok(processed)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
