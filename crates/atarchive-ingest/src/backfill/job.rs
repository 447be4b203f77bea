//! Persistent backfill job records.
//!
//! One row per identifier in the `backfill_jobs` table. Status only moves
//! forward:
//!
//! ```text
//! pending ──▶ fetching ──▶ done
//!    ▲           │
//!    └── retry ──┤
//!                └──────▶ failed
//! ```
//!
//! `attempt_count` is incremented when a fetch starts. A cancelled fetch goes
//! back to `pending` and gives its attempt back. Jobs left in `fetching` by a
//! crash are reverted by [`JobStore::recover_interrupted`].

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{info, warn};

use crate::schema;
use crate::{Error, Result};

/// Lifecycle status of a backfill job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Fetching,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fetching" => Some(Self::Fetching),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillJob {
    #[serde(rename = "did")]
    pub identifier: String,
    pub endpoint: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Records written by the successful fetch.
    pub records: u64,
    pub updated_at: DateTime<Utc>,
}

/// What [`JobStore::submit`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New pending job.
    Created,
    /// Pending job moved to a new endpoint.
    Retargeted,
    /// Job already exists with this endpoint, or is past pending.
    Unchanged,
    /// Already fetched; never resubmitted.
    AlreadyDone,
    /// The endpoint failed validation and the job was recorded as failed.
    Rejected,
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub fetching: u64,
    pub done: u64,
    pub failed: u64,
}

/// SQLite-backed job store.
pub struct JobStore {
    conn: Mutex<Connection>,
}

const JOB_COLUMNS: &str =
    "identifier, endpoint, status, attempt_count, last_error, records, updated_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<BackfillJob> {
    let status: String = row.get(2)?;
    let updated_at: i64 = row.get(6)?;
    Ok(BackfillJob {
        identifier: row.get(0)?,
        endpoint: row.get(1)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        attempt_count: row.get(3)?,
        last_error: row.get(4)?,
        records: row.get::<_, i64>(5)? as u64,
        updated_at: Utc
            .timestamp_millis_opt(updated_at)
            .single()
            .unwrap_or_default(),
    })
}

fn persistence(context: &str) -> impl FnOnce(rusqlite::Error) -> Error + '_ {
    move |e| Error::Persistence(format!("{}: {}", context, e))
}

impl JobStore {
    /// Open or create the state database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(persistence("Failed to open SQLite"))?;
        schema::configure(&conn).map_err(persistence("Failed to set PRAGMA"))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(persistence("Failed to open in-memory SQLite"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        schema::init_schema(&conn).map_err(persistence("Failed to init schema"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Return jobs left in `fetching` by a process that died to `pending`.
    ///
    /// Only the process that runs fetches may call this, before it starts.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let reverted = conn
            .execute(
                "UPDATE backfill_jobs SET status = 'pending', updated_at = ?1 WHERE status = 'fetching'",
                [now()],
            )
            .map_err(persistence("Failed to recover interrupted jobs"))?;
        if reverted > 0 {
            warn!("Reverted {} interrupted jobs to pending", reverted);
        }
        Ok(reverted)
    }

    /// Record a job for `identifier` at an already-normalized `endpoint`.
    pub fn submit(&self, identifier: &str, endpoint: &str) -> Result<SubmitOutcome> {
        let conn = self.conn.lock();

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT endpoint, status FROM backfill_jobs WHERE identifier = ?",
                [identifier],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(persistence("Failed to look up job"))?;

        let outcome = match existing {
            None => {
                conn.execute(
                    "INSERT INTO backfill_jobs (identifier, endpoint, status, created_at, updated_at)
                     VALUES (?1, ?2, 'pending', ?3, ?3)",
                    rusqlite::params![identifier, endpoint, now()],
                )
                .map_err(persistence("Failed to insert job"))?;
                SubmitOutcome::Created
            }
            Some((_, status)) if status == "done" => SubmitOutcome::AlreadyDone,
            Some((current, status)) if status == "pending" && current != endpoint => {
                conn.execute(
                    "UPDATE backfill_jobs SET endpoint = ?2, updated_at = ?3 WHERE identifier = ?1",
                    rusqlite::params![identifier, endpoint, now()],
                )
                .map_err(persistence("Failed to retarget job"))?;
                SubmitOutcome::Retargeted
            }
            Some((current, status)) if status == "failed" && current != endpoint => {
                // The account moved; the new host gets a fresh set of attempts.
                conn.execute(
                    "UPDATE backfill_jobs SET endpoint = ?2, status = 'pending', attempt_count = 0,
                        last_error = NULL, updated_at = ?3
                     WHERE identifier = ?1",
                    rusqlite::params![identifier, endpoint, now()],
                )
                .map_err(persistence("Failed to retarget failed job"))?;
                SubmitOutcome::Retargeted
            }
            Some(_) => SubmitOutcome::Unchanged,
        };

        Ok(outcome)
    }

    /// Record a job that can never run, e.g. because its endpoint is invalid.
    pub fn submit_failed(&self, identifier: &str, endpoint: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backfill_jobs (identifier, endpoint, status, last_error, created_at, updated_at)
             VALUES (?1, ?2, 'failed', ?3, ?4, ?4)
             ON CONFLICT(identifier) DO UPDATE SET
                status = 'failed', endpoint = excluded.endpoint,
                last_error = excluded.last_error, updated_at = excluded.updated_at
             WHERE status = 'pending'",
            rusqlite::params![identifier, endpoint, error, now()],
        )
        .map_err(persistence("Failed to record failed job"))?;
        Ok(())
    }

    /// Move a pending job to `fetching`.
    ///
    /// Returns the attempt number now in progress, or `None` if the job is
    /// not pending.
    pub fn mark_fetching(&self, identifier: &str) -> Result<Option<u32>> {
        let conn = self.conn.lock();
        conn.query_row(
            "UPDATE backfill_jobs SET status = 'fetching', attempt_count = attempt_count + 1, updated_at = ?2
             WHERE identifier = ?1 AND status = 'pending'
             RETURNING attempt_count",
            rusqlite::params![identifier, now()],
            |row| row.get(0),
        )
        .optional()
        .map_err(persistence("Failed to start job"))
    }

    pub fn mark_done(&self, identifier: &str, records: u64) -> Result<()> {
        self.finish(identifier, "done", None, records as i64)
    }

    pub fn mark_failed(&self, identifier: &str, error: &str) -> Result<()> {
        self.finish(identifier, "failed", Some(error), 0)
    }

    /// A failed attempt that will be retried.
    pub fn mark_retry(&self, identifier: &str, error: &str) -> Result<()> {
        self.finish(identifier, "pending", Some(error), 0)
    }

    fn finish(&self, identifier: &str, status: &str, error: Option<&str>, records: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE backfill_jobs SET status = ?2, last_error = COALESCE(?3, last_error),
                records = ?4, updated_at = ?5
             WHERE identifier = ?1 AND status = 'fetching'",
            rusqlite::params![identifier, status, error, records, now()],
        )
        .map_err(persistence("Failed to update job"))?;
        Ok(())
    }

    /// Give back a cancelled attempt.
    pub fn revert_fetching(&self, identifier: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE backfill_jobs SET status = 'pending',
                attempt_count = MAX(attempt_count - 1, 0), updated_at = ?2
             WHERE identifier = ?1 AND status = 'fetching'",
            rusqlite::params![identifier, now()],
        )
        .map_err(persistence("Failed to revert job"))?;
        Ok(())
    }

    /// Put every failed job back to pending with a fresh attempt budget.
    pub fn retry_failed(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE backfill_jobs SET status = 'pending', attempt_count = 0, updated_at = ?1
                 WHERE status = 'failed'",
                [now()],
            )
            .map_err(persistence("Failed to reset failed jobs"))?;
        info!("Reset {} failed jobs to pending", count);
        Ok(count)
    }

    pub fn get(&self, identifier: &str) -> Result<Option<BackfillJob>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM backfill_jobs WHERE identifier = ?"),
            [identifier],
            job_from_row,
        )
        .optional()
        .map_err(persistence("Failed to load job"))
    }

    fn list(&self, status: JobStatus) -> Result<Vec<BackfillJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM backfill_jobs WHERE status = ? ORDER BY created_at, identifier"
            ))
            .map_err(persistence("Failed to list jobs"))?;

        let jobs = stmt
            .query_map([status.as_str()], job_from_row)
            .map_err(persistence("Failed to list jobs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(persistence("Failed to read job"))?;
        Ok(jobs)
    }

    /// Jobs waiting to run, oldest first.
    pub fn pending_jobs(&self) -> Result<Vec<BackfillJob>> {
        self.list(JobStatus::Pending)
    }

    /// Terminal failures with their attempt counts and last error.
    pub fn failed_jobs(&self) -> Result<Vec<BackfillJob>> {
        self.list(JobStatus::Failed)
    }

    pub fn counts(&self) -> Result<JobCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM backfill_jobs GROUP BY status")
            .map_err(persistence("Failed to count jobs"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(persistence("Failed to count jobs"))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let (status, count) = row.map_err(persistence("Failed to count jobs"))?;
            let count = count as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => counts.pending = count,
                Some(JobStatus::Fetching) => counts.fetching = count,
                Some(JobStatus::Done) => counts.done = count,
                Some(JobStatus::Failed) => counts.failed = count,
                None => {}
            }
        }
        Ok(counts)
    }
}

fn now() -> i64 {
    Utc::now().timestamp_millis()
}
