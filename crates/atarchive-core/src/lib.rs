//! Protocol decoding and shared utilities for the atarchive pipelines.
//!
//! This crate provides:
//! - DAG-CBOR helpers and conversion to the network's JSON convention
//! - A streaming CAR v1 reader that verifies every block against its CID
//! - A repository walker that turns a snapshot container into records
//! - Firehose frame envelope and event decoding
//! - Directory log entry parsing
//! - Prometheus metrics helpers
//! - Shared error types
//!
//! Nothing in here performs network or disk I/O of its own.

pub mod car;
pub mod cbor;
mod error;
pub mod frame;
pub mod metrics;
pub mod operation;
pub mod repo;

pub use car::{Block, CarReader, verify_block};
pub use error::{Error, Result};
pub use frame::{
    CommitOperation, CommitPayload, EventBody, EventKind, FirehoseEvent, Frame, RawEvent,
    decode_frame,
};
pub use operation::{LogEntry, Operation, OperationPayload};
pub use repo::{Commit, RepoReader, RepoRecord, RepoWalker, WalkSummary};
