//! Durable ingestion checkpoints.
//!
//! A checkpoint records how far a stream has been durably processed. The
//! firehose stores the last archived sequence number; the directory crawl
//! stores the server-assigned cursor of the last archived page.
//!
//! Positions only move forward: committing a position at or behind the stored
//! one is a silent no-op, which makes `commit` safe to retry. Callers must
//! treat a failed commit as fatal for their pipeline.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};

use crate::schema;
use crate::{Error, Result};

/// Position within a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    /// Firehose sequence number.
    Sequence(u64),
    /// Directory pagination token. Tokens are fixed-width RFC 3339 UTC
    /// timestamps, so byte order is chronological order.
    Cursor(String),
}

impl Position {
    pub fn as_sequence(&self) -> Option<u64> {
        match self {
            Self::Sequence(seq) => Some(*seq),
            Self::Cursor(_) => None,
        }
    }

    pub fn as_cursor(&self) -> Option<&str> {
        match self {
            Self::Cursor(cursor) => Some(cursor),
            Self::Sequence(_) => None,
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequence(seq) => write!(f, "{seq}"),
            Self::Cursor(cursor) => f.write_str(cursor),
        }
    }
}

/// A stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub stream_key: String,
    pub position: Position,
    pub committed_at: DateTime<Utc>,
}

/// Storage for checkpoints.
///
/// Implementations must make `commit` atomic and monotonic per stream key.
pub trait CheckpointStore: Send + Sync {
    /// Last committed position for `stream_key`, if any.
    fn load(&self, stream_key: &str) -> Result<Option<Position>>;

    /// Durably record `position`. Equal or older positions are ignored.
    fn commit(&self, stream_key: &str, position: &Position) -> Result<()>;

    /// All checkpoints, ordered by key.
    fn list(&self) -> Result<Vec<Checkpoint>>;
}

/// Checkpoint key for a firehose subscription on `relay_url`.
pub fn firehose_key(relay_url: &str) -> String {
    format!("firehose:{}", host_of(relay_url))
}

/// Checkpoint key for a directory crawl against `base_url`.
pub fn directory_key(base_url: &str) -> String {
    format!("directory:{}", host_of(base_url))
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
        })
        .unwrap_or_else(|| url.to_string())
}

/// SQLite-backed checkpoint store.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create the state database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Persistence(format!("Failed to open SQLite: {}", e)))?;
        schema::configure(&conn)
            .map_err(|e| Error::Persistence(format!("Failed to set PRAGMA: {}", e)))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Persistence(format!("Failed to open in-memory SQLite: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        schema::init_schema(&conn)
            .map_err(|e| Error::Persistence(format!("Failed to init schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, stream_key: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock();

        let row: Option<(Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT position_seq, position_cursor FROM checkpoints WHERE stream_key = ?",
                [stream_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::Persistence(format!("Failed to load checkpoint: {}", e)))?;

        Ok(match row {
            Some((Some(seq), _)) => Some(Position::Sequence(seq as u64)),
            Some((None, Some(cursor))) => Some(Position::Cursor(cursor)),
            _ => None,
        })
    }

    fn commit(&self, stream_key: &str, position: &Position) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();

        // SET expressions see the pre-update row, so committed_at only moves
        // when the position does.
        let result = match position {
            Position::Sequence(seq) => {
                let seq = i64::try_from(*seq).map_err(|_| {
                    Error::Persistence(format!("sequence {} out of range", seq))
                })?;
                conn.execute(
                    "INSERT INTO checkpoints (stream_key, position_seq, position_cursor, committed_at)
                     VALUES (?1, ?2, NULL, ?3)
                     ON CONFLICT(stream_key) DO UPDATE SET
                        position_seq = MAX(COALESCE(position_seq, -1), excluded.position_seq),
                        position_cursor = NULL,
                        committed_at = CASE
                            WHEN excluded.position_seq > COALESCE(position_seq, -1)
                            THEN excluded.committed_at ELSE committed_at END",
                    rusqlite::params![stream_key, seq, now],
                )
            }
            Position::Cursor(cursor) => conn.execute(
                "INSERT INTO checkpoints (stream_key, position_seq, position_cursor, committed_at)
                 VALUES (?1, NULL, ?2, ?3)
                 ON CONFLICT(stream_key) DO UPDATE SET
                    position_cursor = MAX(COALESCE(position_cursor, ''), excluded.position_cursor),
                    position_seq = NULL,
                    committed_at = CASE
                        WHEN excluded.position_cursor > COALESCE(position_cursor, '')
                        THEN excluded.committed_at ELSE committed_at END",
                rusqlite::params![stream_key, cursor, now],
            ),
        };

        result.map_err(|e| Error::Persistence(format!("Failed to commit checkpoint: {}", e)))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(
                "SELECT stream_key, position_seq, position_cursor, committed_at
                 FROM checkpoints ORDER BY stream_key",
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(|e| Error::Persistence(e.to_string()))?
            .filter_map(|r| r.ok())
            .filter_map(|(stream_key, seq, cursor, committed_at)| {
                let position = match (seq, cursor) {
                    (Some(seq), _) => Position::Sequence(seq as u64),
                    (None, Some(cursor)) => Position::Cursor(cursor),
                    (None, None) => return None,
                };
                Some(Checkpoint {
                    stream_key,
                    position,
                    committed_at: Utc
                        .timestamp_millis_opt(committed_at)
                        .single()
                        .unwrap_or_default(),
                })
            })
            .collect();

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_store_is_empty() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        assert_eq!(store.load("firehose:bsky.network").unwrap(), None);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let key = "firehose:bsky.network";

        store.commit(key, &Position::Sequence(100)).unwrap();
        assert_eq!(store.load(key).unwrap(), Some(Position::Sequence(100)));

        store.commit(key, &Position::Sequence(250)).unwrap();
        store.commit(key, &Position::Sequence(200)).unwrap();
        assert_eq!(store.load(key).unwrap(), Some(Position::Sequence(250)));
    }

    #[test]
    fn test_commit_same_position_twice_is_noop() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let key = "firehose:bsky.network";

        store.commit(key, &Position::Sequence(7)).unwrap();
        let first = store.list().unwrap()[0].committed_at;

        std::thread::sleep(std::time::Duration::from_millis(5));
        store.commit(key, &Position::Sequence(7)).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].position, Position::Sequence(7));
        assert_eq!(listed[0].committed_at, first);
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let key = "directory:plc.directory";

        store
            .commit(key, &Position::Cursor("2023-11-16T22:40:10.585Z".into()))
            .unwrap();
        store
            .commit(key, &Position::Cursor("2023-01-01T00:00:00.000Z".into()))
            .unwrap();
        assert_eq!(
            store.load(key).unwrap(),
            Some(Position::Cursor("2023-11-16T22:40:10.585Z".into()))
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.commit("firehose:a", &Position::Sequence(5)).unwrap();
        store
            .commit("directory:b", &Position::Cursor("2024-01-01T00:00:00Z".into()))
            .unwrap();

        let keys: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|c| c.stream_key)
            .collect();
        assert_eq!(keys, vec!["directory:b", "firehose:a"]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("state.db");

        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.commit("firehose:x", &Position::Sequence(42)).unwrap();
        }

        let store = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(
            store.load("firehose:x").unwrap(),
            Some(Position::Sequence(42))
        );
    }

    #[test]
    fn test_stream_keys() {
        assert_eq!(firehose_key("wss://bsky.network"), "firehose:bsky.network");
        assert_eq!(
            firehose_key("ws://localhost:2470/"),
            "firehose:localhost:2470"
        );
        assert_eq!(
            directory_key("https://plc.directory"),
            "directory:plc.directory"
        );
    }
}
