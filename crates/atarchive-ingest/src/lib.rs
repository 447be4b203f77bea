//! Ingestion pipelines for the atarchive network archive.
//!
//! Two independent pipelines share one state database:
//!
//! - [`firehose`] - live relay subscription, written to day partitions and
//!   checkpointed by sequence number
//! - [`directory`] + [`backfill`] - discovery of every identity and its
//!   hosting server from the directory log, then a polite, resumable fetch
//!   of each repository
//!
//! # Architecture
//!
//! ```text
//!   relay ──frames──▶ FirehoseConsumer ──▶ DayPartitionWriter
//!                           │
//!                           ▼
//!                    CheckpointStore ◀──────────────┐
//!                                                   │
//!   directory ──pages──▶ DirectoryCrawler ──▶ IdentityResolver (RocksDB)
//!                                                   │ (identifier, endpoint)
//!                                                   ▼
//!                          JobStore ◀──── Scheduler ──▶ RepositoryFetcher
//!                                             │
//!                                             ▼
//!                                         RecordSink
//! ```
//!
//! Every stage commits progress only after its output is durable, so any
//! stage can be killed and restarted without losing or duplicating work
//! beyond the last uncommitted batch.

pub mod backfill;
pub mod backoff;
pub mod checkpoint;
pub mod directory;
pub mod error;
pub mod firehose;
pub mod partition;
pub mod schema;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use backfill::{
    BackfillJob, FetcherConfig, JobStatus, JobStore, JsonlRecordSink, RecordSink,
    RepositoryFetcher, RunSummary, Scheduler, SchedulerConfig, SnapshotFetcher,
};
pub use backoff::RetryPolicy;
pub use checkpoint::{Checkpoint, CheckpointStore, Position, SqliteCheckpointStore};
pub use directory::{CrawlerConfig, DirectoryCrawler, IdentityRecord, IdentityResolver};
pub use firehose::{FirehoseConfig, FirehoseConsumer, WebSocketSource};
pub use partition::{DayPartitionWriter, PartitionConfig};
