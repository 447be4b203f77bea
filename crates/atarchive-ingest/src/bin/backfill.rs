//! Repository backfill tool.
//!
//! Discovers every identity from the directory log, records a fetch job per
//! identity, and downloads each repository from its hosting server.
//!
//! # Pipeline
//!
//! ```text
//! [directory export] → [IdentityResolver] → [JobStore] → [Scheduler] → <did>.jsonl
//!         ↓                   ↓
//!   operations/*.jsonl     RocksDB
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Crawl the directory (resumes from the last checkpoint) and queue jobs
//! atarchive-backfill crawl
//!
//! # Fetch every pending repository
//! atarchive-backfill run --per-host 4 --global 64
//!
//! # Queue every repository a single host lists
//! atarchive-backfill host --endpoint https://pds.example.com
//!
//! # Export failed jobs as JSON lines
//! atarchive-backfill failed > failed.jsonl
//!
//! # Print one identity's directory history and repair its index entry
//! atarchive-backfill audit did:plc:abc123 --identity-db ./data/identities
//! ```

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use atarchive_core::metrics::{init_metrics, start_metrics_server};
use atarchive_ingest::backfill::{
    EndpointOptions, FetcherConfig, JobStore, JsonlRecordSink, RepositoryFetcher, Scheduler,
    SchedulerConfig, SubmitOutcome, submit_job,
};
use atarchive_ingest::checkpoint::{
    CheckpointStore, Position, SqliteCheckpointStore, directory_key,
};
use atarchive_ingest::directory::{CrawlerConfig, DirectoryCrawler, IdentityResolver};
use atarchive_ingest::partition::{DayPartitionWriter, PartitionConfig};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Discover and fetch every repository in the network.
#[derive(Parser, Debug)]
#[command(name = "atarchive-backfill")]
#[command(about = "Directory crawl and repository backfill")]
#[command(version)]
struct Args {
    /// SQLite database holding checkpoints and jobs
    #[arg(long, env = "ATARCHIVE_STATE_DB", default_value = "./data/state.db", global = true)]
    state_db: PathBuf,

    /// Allow loopback and private hosting endpoints (local development only)
    #[arg(long, env = "ATARCHIVE_ALLOW_PRIVATE", global = true)]
    allow_private: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "ATARCHIVE_METRICS_PORT", default_value = "0", global = true)]
    metrics_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl the directory log, resolve endpoints and queue fetch jobs
    Crawl(CrawlArgs),
    /// Fetch every pending repository
    Run(RunArgs),
    /// Queue every repository listed by one host
    Host(HostArgs),
    /// Print failed jobs as JSON lines
    Failed,
    /// Fetch the directory audit log of specific identities
    Audit(AuditArgs),
    /// Print job counts and checkpoints
    Status,
}

#[derive(clap::Args, Debug)]
struct CrawlArgs {
    /// Directory base URL
    #[arg(long, env = "ATARCHIVE_DIRECTORY_URL", default_value = "https://plc.directory")]
    directory_url: String,

    /// RocksDB path for the identity index
    #[arg(long, env = "ATARCHIVE_IDENTITY_DB", default_value = "./data/identities")]
    identity_db: PathBuf,

    /// Directory for raw operations, one file per day
    #[arg(long, env = "ATARCHIVE_OPERATIONS_DIR", default_value = "./data/operations")]
    operations_dir: PathBuf,

    /// Entries per page
    #[arg(long, default_value = "1000")]
    page_size: usize,

    /// Stop after this many pages
    #[arg(long)]
    max_pages: Option<u64>,

    /// Start from the beginning of the log instead of the checkpoint
    #[arg(long)]
    from_start: bool,

    /// Don't queue fetch jobs, only build the identity index
    #[arg(long)]
    no_submit: bool,

    /// After crawling, queue a job for every identity in the index
    #[arg(long)]
    submit_all: bool,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directory for fetched repositories
    #[arg(long, short, env = "ATARCHIVE_REPOS_DIR", default_value = "./data/repos")]
    output_dir: PathBuf,

    /// Concurrent fetches per host
    #[arg(long, env = "ATARCHIVE_PER_HOST", default_value = "4")]
    per_host: usize,

    /// Concurrent fetches overall
    #[arg(long, env = "ATARCHIVE_GLOBAL", default_value = "64")]
    global: usize,

    /// Attempts per job before it is marked failed
    #[arg(long, default_value = "5")]
    max_attempts: u32,

    /// Deadline per fetch, in seconds
    #[arg(long, default_value = "600")]
    fetch_deadline_secs: u64,

    /// Put failed jobs back to pending before running
    #[arg(long)]
    retry_failed: bool,
}

#[derive(clap::Args, Debug)]
struct HostArgs {
    /// Hosting endpoint to list
    #[arg(long)]
    endpoint: String,
}

#[derive(clap::Args, Debug)]
struct AuditArgs {
    /// Identities to look up
    #[arg(required = true)]
    dids: Vec<String>,

    /// Directory base URL
    #[arg(long, env = "ATARCHIVE_DIRECTORY_URL", default_value = "https://plc.directory")]
    directory_url: String,

    /// Fold the history into this identity index and queue a fetch job
    #[arg(long)]
    identity_db: Option<PathBuf>,

    /// With --identity-db, only update the index
    #[arg(long)]
    no_submit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv()?;
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("atarchive_ingest=debug".parse()?),
        )
        .init();

    if args.metrics_port > 0 {
        let handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, finishing current work...");
        signal.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let endpoint_options = EndpointOptions {
        allow_private: args.allow_private,
    };
    let jobs = Arc::new(
        JobStore::open(&args.state_db)
            .with_context(|| format!("Failed to open state database at {:?}", args.state_db))?,
    );

    match args.command {
        Command::Crawl(crawl) => {
            let checkpoints = SqliteCheckpointStore::open(&args.state_db)
                .with_context(|| format!("Failed to open state database at {:?}", args.state_db))?;
            run_crawl(crawl, &checkpoints, &jobs, endpoint_options, shutdown).await
        }
        Command::Run(run) => run_backfill(run, jobs, endpoint_options, shutdown).await,
        Command::Host(host) => submit_host(host, &jobs, endpoint_options).await,
        Command::Failed => export_failed(&jobs),
        Command::Audit(audit) => audit_identities(audit, &jobs, endpoint_options).await,
        Command::Status => {
            let checkpoints = SqliteCheckpointStore::open(&args.state_db)
                .with_context(|| format!("Failed to open state database at {:?}", args.state_db))?;
            print_status(&jobs, &checkpoints)
        }
    }
}

async fn run_crawl(
    args: CrawlArgs,
    checkpoints: &dyn CheckpointStore,
    jobs: &JobStore,
    endpoint_options: EndpointOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    let stream_key = directory_key(&args.directory_url);
    let start = if args.from_start {
        None
    } else {
        checkpoints
            .load(&stream_key)
            .context("Failed to load directory checkpoint")?
            .and_then(|p| p.as_cursor().map(str::to_string))
    };

    info!("Opening identity index at {}", args.identity_db.display());
    let resolver = IdentityResolver::open(&args.identity_db)
        .with_context(|| format!("Failed to open identity index at {:?}", args.identity_db))?;
    info!(
        "Identity index opened: ~{} identities",
        resolver.approximate_count()?
    );

    let archive = DayPartitionWriter::new(PartitionConfig {
        output_dir: args.operations_dir.clone(),
        ..Default::default()
    })
    .with_context(|| format!("Failed to create operation archive at {:?}", args.operations_dir))?;

    let crawler = DirectoryCrawler::new(CrawlerConfig {
        base_url: args.directory_url.clone(),
        page_size: args.page_size,
        ..Default::default()
    })?;

    let started = Instant::now();
    let mut crawl = crawler.crawl(start);
    let mut pages = 0u64;
    let mut operations = 0u64;
    let mut submitted = 0u64;
    let mut skipped = 0u64;

    while !shutdown.is_cancelled() && args.max_pages.is_none_or(|max| pages < max) {
        let page = tokio::select! {
            page = crawl.next_page() => page,
            _ = shutdown.cancelled() => break,
        };
        let Some(page) = page.context("Directory crawl failed")? else {
            info!("Reached the end of the directory log");
            break;
        };

        for entry in &page.entries {
            match DateTime::parse_from_rfc3339(&entry.created_at) {
                Ok(at) => {
                    archive.append(at.with_timezone(&Utc).date_naive(), entry)?;
                }
                Err(e) => warn!("Not archiving {}: {}", entry.cid, e),
            }
        }
        archive.sync()?;

        let stats = resolver.apply_all(&page.operations)?;
        operations += stats.applied;
        skipped += stats.skipped();

        if !args.no_submit {
            let touched: HashSet<&str> = page
                .operations
                .iter()
                .map(|op| op.identifier.as_str())
                .collect();
            for identifier in touched {
                let Some(record) = resolver.record(identifier)? else {
                    continue;
                };
                if record.tombstoned {
                    continue;
                }
                if let Some(endpoint) = record.current_endpoint()
                    && submit_job(jobs, identifier, endpoint, endpoint_options)?
                        == SubmitOutcome::Created
                {
                    submitted += 1;
                }
            }
        }

        checkpoints.commit(&stream_key, &Position::Cursor(page.cursor.clone()))?;
        pages += 1;

        if pages.is_multiple_of(100) {
            info!(
                "Crawl progress: {} pages, {} operations applied, {} jobs queued, cursor {}",
                pages, operations, submitted, page.cursor
            );
        }
    }

    if args.submit_all && !shutdown.is_cancelled() {
        info!("Queueing jobs for every identity in the index...");
        for pair in resolver.current_endpoints() {
            let (identifier, endpoint) = pair?;
            if submit_job(jobs, &identifier, &endpoint, endpoint_options)? == SubmitOutcome::Created {
                submitted += 1;
            }
        }
    }

    archive.close()?;
    resolver.flush()?;

    info!("═══════════════════════════════════════════════════════");
    info!("CRAWL COMPLETE");
    info!("═══════════════════════════════════════════════════════");
    info!("Pages:                {}", pages);
    info!("Operations applied:   {}", operations);
    info!("Operations skipped:   {}", skipped);
    info!("Jobs queued:          {}", submitted);
    info!("Cursor:               {}", crawl.cursor().unwrap_or("start"));
    info!("Elapsed:              {:.1}s", started.elapsed().as_secs_f64());

    Ok(())
}

async fn run_backfill(
    args: RunArgs,
    jobs: Arc<JobStore>,
    endpoint_options: EndpointOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    if args.retry_failed {
        jobs.retry_failed()?;
    }

    let fetcher = Arc::new(RepositoryFetcher::new(FetcherConfig::default())?);
    let sink = Arc::new(
        JsonlRecordSink::new(&args.output_dir)
            .with_context(|| format!("Failed to create output directory {:?}", args.output_dir))?,
    );

    let mut config = SchedulerConfig {
        per_host: args.per_host,
        global: args.global,
        fetch_deadline: Duration::from_secs(args.fetch_deadline_secs),
        endpoint: endpoint_options,
        ..Default::default()
    };
    config.retry.max_attempts = args.max_attempts;

    let (per_host, global) = (config.per_host, config.global);
    let scheduler = Scheduler::new(config, jobs.clone(), fetcher, sink);
    let summary = scheduler.run(per_host, global, shutdown).await?;

    let counts = jobs.counts()?;
    info!("═══════════════════════════════════════════════════════");
    info!("BACKFILL RUN COMPLETE");
    info!("═══════════════════════════════════════════════════════");
    info!("Completed:            {}", summary.completed);
    info!("Records:              {}", summary.records);
    info!("Retries:              {}", summary.retries);
    info!("Failed:               {}", summary.failed.len());
    info!("Cancelled:            {}", summary.cancelled);
    info!(
        "Jobs now:             {} pending, {} done, {} failed",
        counts.pending, counts.done, counts.failed
    );
    for job in &summary.failed {
        warn!(
            "Failed: {} at {} after {} attempts: {}",
            job.identifier,
            job.endpoint,
            job.attempt_count,
            job.last_error.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(())
}

async fn submit_host(args: HostArgs, jobs: &JobStore, options: EndpointOptions) -> Result<()> {
    let endpoint = atarchive_ingest::backfill::normalize_endpoint(&args.endpoint, options)?;
    let fetcher = RepositoryFetcher::new(FetcherConfig::default())?;
    let identifiers = fetcher
        .list_repos(&endpoint)
        .await
        .with_context(|| format!("Failed to list repositories on {}", endpoint))?;
    if identifiers.is_empty() {
        bail!("{} lists no repositories", endpoint);
    }

    let mut created = 0;
    for identifier in &identifiers {
        if submit_job(jobs, identifier, &endpoint, options)? == SubmitOutcome::Created {
            created += 1;
        }
    }
    info!(
        "Queued {} new jobs from {} ({} listed)",
        created,
        endpoint,
        identifiers.len()
    );
    Ok(())
}

async fn audit_identities(
    args: AuditArgs,
    jobs: &JobStore,
    endpoint_options: EndpointOptions,
) -> Result<()> {
    let crawler = DirectoryCrawler::new(CrawlerConfig {
        base_url: args.directory_url.clone(),
        ..Default::default()
    })?;
    let resolver = args
        .identity_db
        .as_ref()
        .map(|path| {
            IdentityResolver::open(path)
                .with_context(|| format!("Failed to open identity index at {:?}", path))
        })
        .transpose()?;

    let stdout = std::io::stdout();
    let mut failed = 0usize;
    for did in &args.dids {
        let history = match crawler.audit_log(did).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Audit log for {} unavailable: {}", did, e);
                failed += 1;
                continue;
            }
        };

        {
            let mut out = stdout.lock();
            for entry in &history {
                serde_json::to_writer(&mut out, entry)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }

        let Some(resolver) = &resolver else {
            continue;
        };
        let operations: Vec<_> = history
            .iter()
            .filter_map(|entry| match entry.to_operation() {
                Ok(op) => Some(op),
                Err(e) => {
                    warn!("Skipping entry {} for {}: {}", entry.cid, did, e);
                    None
                }
            })
            .collect();
        let stats = resolver.apply_all(&operations)?;
        let record = resolver.record(did)?;
        info!(
            "{}: {} entries, {} applied, {} already known, current endpoint {:?}",
            did,
            history.len(),
            stats.applied,
            stats.duplicates,
            record.as_ref().and_then(|r| r.current_endpoint())
        );

        if !args.no_submit
            && let Some(record) = record
            && !record.tombstoned
            && let Some(endpoint) = record.current_endpoint()
        {
            let outcome = submit_job(jobs, did, endpoint, endpoint_options)?;
            info!("{}: job {:?}", did, outcome);
        }
    }

    if let Some(resolver) = &resolver {
        resolver.flush()?;
    }
    if failed > 0 {
        bail!("{} of {} audit logs could not be fetched", failed, args.dids.len());
    }
    Ok(())
}

fn export_failed(jobs: &JobStore) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let failed = jobs.failed_jobs()?;
    for job in &failed {
        serde_json::to_writer(&mut out, job)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    info!("Exported {} failed jobs", failed.len());
    Ok(())
}

fn print_status(jobs: &JobStore, checkpoints: &dyn CheckpointStore) -> Result<()> {
    let counts = jobs.counts()?;
    println!(
        "jobs: {} pending, {} fetching, {} done, {} failed",
        counts.pending, counts.fetching, counts.done, counts.failed
    );
    for checkpoint in checkpoints.list()? {
        let position = match &checkpoint.position {
            Position::Sequence(seq) => seq.to_string(),
            Position::Cursor(cursor) => cursor.clone(),
        };
        println!(
            "{}: {} (committed {})",
            checkpoint.stream_key,
            position,
            checkpoint.committed_at.to_rfc3339()
        );
    }
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
