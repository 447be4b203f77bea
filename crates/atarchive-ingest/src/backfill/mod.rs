//! Repository backfill.
//!
//! - [`job`] - persistent job records and their status transitions
//! - [`endpoint`] - hosting endpoint normalization and blocklist
//! - [`limiter`] - per-host in-flight caps and throttles
//! - [`scheduler`] - per-host queues, global worker pool, retry policy
//! - [`fetcher`] - snapshot download and streaming record decode
//! - [`sink`] - where decoded records are written

pub mod endpoint;
pub mod fetcher;
pub mod job;
pub mod limiter;
pub mod scheduler;
pub mod sink;

pub use endpoint::{EndpointOptions, normalize_endpoint};
pub use fetcher::{FetcherConfig, RecordStream, RepositoryFetcher, SnapshotFetcher};
pub use job::{BackfillJob, JobCounts, JobStatus, JobStore, SubmitOutcome};
pub use limiter::{HostLimiter, HostPermit};
pub use scheduler::{RunSummary, Scheduler, SchedulerConfig, submit_job};
pub use sink::{JsonlRecordSink, RecordSink, RecordWriter};
