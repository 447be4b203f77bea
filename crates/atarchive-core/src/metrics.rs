//! Prometheus metrics helpers for the archiver.
//!
//! Both binaries install one recorder at startup and optionally expose it on
//! `/metrics`. Everything else records through the `metrics` macros or the
//! small helpers at the bottom of this module.
//!
//! # Usage
//!
//! ```rust,ignore
//! use atarchive_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handle = init_metrics()?;
//!     start_metrics_server(9091, handle).await?;
//!
//!     metrics::counter!("firehose_events_total").increment(1);
//!     Ok(())
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: pipeline stage (`firehose_`, `partition_`, `crawler_`, `resolver_`, `backfill_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)
//! - Labels: only bounded sets such as outcome or error class, never hosts or DIDs

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Fails if a recorder is already installed in this process.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_common_metrics();
    Ok(handle)
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
///
/// Useful for tests or optional metrics.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    init_metrics().ok()
}

/// Serve `/metrics` and `/health` on `port` from a background task.
///
/// Binding happens before this returns, so a port conflict is reported to the
/// caller instead of being lost in the spawned task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<SocketAddr, std::io::Error> {
    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .route("/health", get(|| async { "ok" }));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!("Metrics server listening on http://{}/metrics", local);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(local)
}

/// Register descriptions for every metric the pipelines emit.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Live Stream Consumer
    // =========================================================================

    describe_counter!(
        "firehose_frames_total",
        "Frames received from the relay subscription"
    );
    describe_counter!(
        "firehose_events_total",
        "Events written to day partitions (label: kind)"
    );
    describe_counter!(
        "firehose_decode_errors_total",
        "Frames or events skipped because they could not be decoded"
    );
    describe_counter!(
        "firehose_gaps_total",
        "Sequence gaps that forced a reconnect"
    );
    describe_counter!(
        "firehose_reconnects_total",
        "Subscription reconnect attempts"
    );
    describe_counter!(
        "firehose_error_frames_total",
        "Error frames sent by the relay"
    );
    describe_gauge!(
        "firehose_last_sequence",
        "Last sequence number durably checkpointed"
    );
    describe_gauge!(
        "firehose_queue_depth",
        "Events waiting for the decode/append worker"
    );
    describe_gauge!(
        "firehose_connected",
        "Whether the subscription is currently streaming (1=yes, 0=no)"
    );

    // =========================================================================
    // Day Partitions
    // =========================================================================

    describe_counter!(
        "partition_lines_written_total",
        "Lines appended to day partitions"
    );
    describe_counter!(
        "partition_bytes_written_total",
        "Bytes appended to day partitions"
    );
    describe_counter!("partition_opened_total", "Day partition files opened");
    describe_histogram!(
        "partition_sync_duration_seconds",
        "Time spent flushing and syncing a partition before a checkpoint"
    );

    // =========================================================================
    // Directory Crawler / Identity Resolver
    // =========================================================================

    describe_counter!("crawler_pages_total", "Directory log pages fetched");
    describe_counter!(
        "crawler_operations_total",
        "Directory operations parsed from pages"
    );
    describe_counter!(
        "crawler_malformed_entries_total",
        "Directory log entries skipped as malformed"
    );
    describe_counter!(
        "crawler_retries_total",
        "Page fetches retried after a transient error"
    );
    describe_counter!(
        "resolver_operations_applied_total",
        "Operations folded into identity records"
    );
    describe_counter!(
        "resolver_operations_skipped_total",
        "Operations skipped (label: reason = duplicate, nullified, out_of_order, tombstoned)"
    );
    describe_gauge!(
        "resolver_identities_approximate",
        "Approximate number of identities in the resolver index"
    );

    // =========================================================================
    // Backfill
    // =========================================================================

    describe_counter!(
        "backfill_jobs_submitted_total",
        "Backfill jobs submitted"
    );
    describe_counter!(
        "backfill_jobs_completed_total",
        "Backfill jobs that finished (label: outcome)"
    );
    describe_counter!(
        "backfill_fetch_retries_total",
        "Fetches rescheduled after a transient failure"
    );
    describe_counter!(
        "backfill_rate_limited_total",
        "Fetches that hit a host rate limit"
    );
    describe_counter!(
        "backfill_records_total",
        "Repository records decoded during backfill"
    );
    describe_gauge!("backfill_inflight", "Fetches currently in flight");
    describe_histogram!(
        "backfill_fetch_duration_seconds",
        "Wall time of one repository fetch"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter with a single label.
#[inline]
pub fn increment_labeled(name: &'static str, key: &'static str, value: &'static str, count: u64) {
    metrics::counter!(name, key => value).increment(count);
}

/// Set a gauge value.
///
/// Convenience wrapper around `metrics::gauge!`.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

/// Record a duration in seconds on a histogram.
#[inline]
pub fn record_duration(name: &'static str, duration: std::time::Duration) {
    metrics::histogram!(name).record(duration.as_secs_f64());
}
