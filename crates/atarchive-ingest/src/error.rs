//! Error types for the ingestion pipelines.
//!
//! Variants double as the failure taxonomy the pipelines act on:
//!
//! | class        | variants                                                      | action                       |
//! |--------------|---------------------------------------------------------------|------------------------------|
//! | transient    | `TransientNetwork`, `Timeout`, `Truncated`, `Task`, `Http` 5xx | retry with backoff           |
//! | rate limited | `RateLimited`                                                 | retry after the server delay |
//! | per unit     | `Decode`, `OutOfOrder`, `Tombstoned`                          | log, skip, continue          |
//! | permanent    | `CorruptContainer`, `NotFound`, `InvalidEndpoint`, `Http` 4xx  | fail the job, no retry       |
//! | fatal        | `Persistence`, `MalformedPage`, `Crawl`                       | stop the affected pipeline   |
//! | control      | `SequenceGap`                                                 | reconnect from checkpoint    |

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection, DNS, TLS or stream failure that may succeed on retry.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// The server asked us to slow down.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Server-specified delay, when it gave one.
        retry_after: Option<Duration>,
    },

    /// One frame, entry or record could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A container block failed verification or the container is malformed.
    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    /// The transfer ended before the container did.
    #[error("truncated transfer: {0}")]
    Truncated(String),

    /// An operation does not extend the identifier's current chain head.
    #[error("operation {cid} for {identifier} does not follow chain head {head:?}")]
    OutOfOrder {
        identifier: String,
        cid: String,
        head: Option<String>,
    },

    /// An operation arrived for an identifier that has been tombstoned.
    #[error("identifier {0} is tombstoned")]
    Tombstoned(String),

    /// Durable state (checkpoint, job status, resolver index) could not be written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The subscription skipped sequence numbers.
    #[error("sequence gap: expected {expected}, got {actual}")]
    SequenceGap { expected: u64, actual: u64 },

    /// The directory crawl gave up after exhausting its retries.
    #[error("crawl failed at cursor {cursor:?} after {attempts} attempts: {source}")]
    Crawl {
        /// Cursor to resume from; nothing past it has been emitted.
        cursor: Option<String>,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A directory page had no entry the cursor could advance to.
    #[error("malformed page after cursor {cursor:?}: {reason}")]
    MalformedPage {
        cursor: Option<String>,
        reason: String,
    },

    /// The host does not have this repository.
    #[error("not found: {0}")]
    NotFound(String),

    /// The hosting endpoint is not an acceptable URL.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Unexpected HTTP status.
    #[error("HTTP status {status}")]
    Http { status: u16 },

    /// A request or fetch exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// SQLite error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    /// Worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_)
            | Self::RateLimited { .. }
            | Self::Truncated(_)
            | Self::Timeout(_)
            | Self::Task(_) => true,
            Self::Http { status } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    /// Retrying would fail the same way.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::CorruptContainer(_)
            | Self::NotFound(_)
            | Self::InvalidEndpoint { .. }
            | Self::Decode(_) => true,
            Self::Http { status } => (400..500).contains(status) && *status != 408 && *status != 429,
            _ => false,
        }
    }

    /// Server-specified delay for a rate-limited request.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short, bounded label for metrics and job records.
    pub fn class(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::CorruptContainer(_) => "corrupt",
            Self::Truncated(_) => "truncated",
            Self::NotFound(_) => "not_found",
            Self::InvalidEndpoint { .. } => "invalid_endpoint",
            Self::Persistence(_) | Self::Database(_) | Self::RocksDb(_) => "persistence",
            e if e.is_transient() => "transient",
            e if e.is_permanent() => "permanent",
            _ => "other",
        }
    }
}

impl From<atarchive_core::Error> for Error {
    fn from(e: atarchive_core::Error) -> Self {
        if e.is_corruption() {
            Self::CorruptContainer(e.to_string())
        } else if e.is_truncation() {
            Self::Truncated(e.to_string())
        } else {
            Self::Decode(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Self::Http {
                status: status.as_u16(),
            }
        } else {
            Self::TransientNetwork(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransientNetwork(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::TransientNetwork("reset".into()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(Error::Truncated("eof".into()).is_transient());
        assert!(Error::Http { status: 503 }.is_transient());
        assert!(Error::Http { status: 408 }.is_transient());
        assert!(Error::Task("task 7 panicked".into()).is_transient());
        assert_eq!(Error::Task("task 7 panicked".into()).class(), "transient");

        assert!(Error::CorruptContainer("bad".into()).is_permanent());
        assert!(Error::NotFound("did:plc:x".into()).is_permanent());
        assert!(Error::Http { status: 400 }.is_permanent());
        assert!(!Error::Http { status: 429 }.is_permanent());

        let persistence = Error::Persistence("disk full".into());
        assert!(!persistence.is_transient());
        assert!(!persistence.is_permanent());
    }

    #[test]
    fn test_retry_after() {
        let err = Error::RateLimited {
            retry_after: Some(Duration::from_secs(12)),
        };
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(err.class(), "rate_limited");
        assert_eq!(Error::Timeout(Duration::ZERO).retry_after(), None);
    }

    #[test]
    fn test_from_core_error() {
        let corrupt: Error = atarchive_core::Error::CorruptBlock {
            cid: "bafy".into(),
        }
        .into();
        assert!(matches!(corrupt, Error::CorruptContainer(_)));
        assert!(corrupt.is_permanent());

        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let truncated: Error = atarchive_core::Error::from(eof).into();
        assert!(matches!(truncated, Error::Truncated(_)));
        assert!(truncated.is_transient());

        let decode: Error = atarchive_core::Error::Cbor("bad".into()).into();
        assert!(matches!(decode, Error::Decode(_)));
    }

    #[test]
    fn test_crawl_error_display_keeps_cursor() {
        let err = Error::Crawl {
            cursor: Some("2024-01-01T00:00:00.000Z".into()),
            attempts: 5,
            source: Box::new(Error::Http { status: 502 }),
        };
        let msg = err.to_string();
        assert!(msg.contains("2024-01-01T00:00:00.000Z"));
        assert!(msg.contains("5 attempts"));
        assert!(msg.contains("502"));
    }

    #[test]
    fn test_sequence_gap_display() {
        let err = Error::SequenceGap {
            expected: 11,
            actual: 15,
        };
        assert_eq!(err.to_string(), "sequence gap: expected 11, got 15");
    }
}
