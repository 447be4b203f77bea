//! atarchive live firehose daemon.
//!
//! Subscribes to a relay's repository event stream and appends every event to
//! day partitions, checkpointing the sequence number after each durable flush.
//! Restarting resumes from the checkpoint.
//!
//! # Usage
//!
//! ```bash
//! # Default relay, data under ./data
//! atarchive-firehose
//!
//! # Custom relay and paths
//! atarchive-firehose \
//!     --relay-url wss://relay.example.com \
//!     --output-dir /archive/firehose \
//!     --state-db /archive/state.db
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) the daemon:
//! 1. Stops reading frames
//! 2. Writes everything already queued
//! 3. Syncs the open partition and commits the final checkpoint
//! 4. Exits

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use atarchive_core::metrics::{init_metrics, start_metrics_server};
use atarchive_ingest::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use atarchive_ingest::firehose::{ConsumerState, FirehoseConfig, FirehoseConsumer, WebSocketSource};
use atarchive_ingest::partition::{DayPartitionWriter, PartitionConfig};
use clap::Parser;
use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// atarchive live firehose daemon.
#[derive(Parser, Debug)]
#[command(name = "atarchive-firehose")]
#[command(about = "Archive the relay event stream into day partitions")]
#[command(version)]
struct Args {
    /// Relay base URL
    #[arg(long, env = "ATARCHIVE_RELAY_URL", default_value = "wss://bsky.network")]
    relay_url: String,

    /// Directory for day partitions
    #[arg(long, short, env = "ATARCHIVE_FIREHOSE_DIR", default_value = "./data/firehose")]
    output_dir: PathBuf,

    /// SQLite database holding checkpoints
    #[arg(long, env = "ATARCHIVE_STATE_DB", default_value = "./data/state.db")]
    state_db: PathBuf,

    /// Events buffered between the socket and the writer
    #[arg(long, env = "ATARCHIVE_CHANNEL_CAPACITY", default_value = "1024")]
    channel_capacity: usize,

    /// Commit a checkpoint after this many events
    #[arg(long, env = "ATARCHIVE_CHECKPOINT_EVERY", default_value = "500")]
    checkpoint_every: usize,

    /// Commit a checkpoint at least this often, in milliseconds
    #[arg(long, env = "ATARCHIVE_CHECKPOINT_INTERVAL_MS", default_value = "1000")]
    checkpoint_interval_ms: u64,

    /// Reconnect if no frame arrives for this many seconds
    #[arg(long, env = "ATARCHIVE_IDLE_TIMEOUT_SECS", default_value = "60")]
    idle_timeout_secs: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "ATARCHIVE_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv()?;
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("atarchive_ingest=debug".parse()?),
        )
        .init();

    tracing::info!("atarchive firehose daemon starting...");

    if args.metrics_port > 0 {
        let handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, draining...");
        signal.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(
        SqliteCheckpointStore::open(&args.state_db)
            .with_context(|| format!("Failed to open state database at {:?}", args.state_db))?,
    );
    let writer = Arc::new(
        DayPartitionWriter::new(PartitionConfig {
            output_dir: args.output_dir.clone(),
            ..Default::default()
        })
        .with_context(|| format!("Failed to create partition writer at {:?}", args.output_dir))?,
    );

    let config = FirehoseConfig {
        relay_url: args.relay_url.clone(),
        channel_capacity: args.channel_capacity,
        checkpoint_every: args.checkpoint_every,
        checkpoint_interval: Duration::from_millis(args.checkpoint_interval_ms),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        ..Default::default()
    };

    tracing::info!("Configuration:");
    tracing::info!("  Relay: {}", config.relay_url);
    tracing::info!("  Output: {}", args.output_dir.display());
    tracing::info!("  State: {}", args.state_db.display());
    tracing::info!(
        "  Checkpoint: every {} events or {:?}",
        config.checkpoint_every,
        config.checkpoint_interval
    );

    let source = WebSocketSource::new(config.relay_url.clone(), config.connect_timeout);
    let consumer = FirehoseConsumer::new(config, source, checkpoints, writer.clone());

    let mut state = consumer.subscribe_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            gauge!("firehose_connected").set(if current == ConsumerState::Streaming {
                1.0
            } else {
                0.0
            });
            tracing::debug!("Consumer state: {:?}", current);
        }
    });

    let stats = consumer.run(shutdown).await.context("Firehose consumer failed")?;
    writer.close().context("Failed to close partition")?;

    let partitions = writer.stats();
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Frames received:      {}", stats.frames);
    tracing::info!("Events written:       {}", stats.events_written);
    tracing::info!("Decode errors:        {}", stats.decode_errors);
    tracing::info!("Sequence gaps:        {}", stats.gaps);
    tracing::info!("Reconnects:           {}", stats.reconnects);
    tracing::info!("Partitions opened:    {}", partitions.partitions_opened);
    tracing::info!(
        "Last checkpoint:      {}",
        stats
            .last_committed
            .map_or_else(|| "none".to_string(), |seq| seq.to_string())
    );

    Ok(())
}

/// Load `.env` (or `$DOTENV_PATH`) before flags read their environment fallbacks.
fn load_dotenv() -> Result<()> {
    let path = std::env::var("DOTENV_PATH").unwrap_or_else(|_| ".env".to_string());
    if std::path::Path::new(&path).exists() {
        dotenvy::from_path(&path).with_context(|| format!("Failed to load {}", path))?;
        eprintln!("Loaded environment from {}", path);
    }
    Ok(())
}
