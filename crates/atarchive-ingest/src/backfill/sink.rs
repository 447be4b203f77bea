//! Where fetched records go.
//!
//! The scheduler opens one [`RecordWriter`] per job, streams the repository's
//! records into it, and commits only once the stream ended cleanly. A writer
//! that is dropped without `commit` must leave no trace, so a failed or
//! cancelled attempt never produces a partial account.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use atarchive_core::RepoRecord;
use tracing::{debug, info, warn};

use crate::Result;

/// Factory for per-account writers.
pub trait RecordSink: Send + Sync {
    fn open(&self, identifier: &str) -> Result<Box<dyn RecordWriter>>;
}

/// Receives one account's records.
pub trait RecordWriter: Send {
    fn write(&mut self, record: &RepoRecord) -> Result<()>;

    /// Make everything written durable. Returns the number of records.
    fn commit(self: Box<Self>) -> Result<u64>;
}

/// Writes `<output_dir>/<did>.jsonl`, one record per line.
///
/// Lines go to `<did>.jsonl.partial`, which is fsynced and renamed over the
/// final name on commit. A refetch therefore replaces the account's file
/// atomically.
pub struct JsonlRecordSink {
    output_dir: PathBuf,
}

impl JsonlRecordSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        info!("Writing repositories to {}", output_dir.display());
        Ok(Self { output_dir })
    }

    /// Final path for an account.
    pub fn path_for(&self, identifier: &str) -> PathBuf {
        let stem: String = identifier
            .chars()
            .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
            .collect();
        self.output_dir.join(format!("{stem}.jsonl"))
    }
}

impl RecordSink for JsonlRecordSink {
    fn open(&self, identifier: &str) -> Result<Box<dyn RecordWriter>> {
        let path = self.path_for(identifier);
        let partial = path.with_extension("jsonl.partial");
        let file = File::create(&partial)?;

        Ok(Box::new(JsonlRecordWriter {
            path,
            partial,
            writer: Some(BufWriter::new(file)),
            records: 0,
        }))
    }
}

struct JsonlRecordWriter {
    path: PathBuf,
    partial: PathBuf,
    writer: Option<BufWriter<File>>,
    records: u64,
}

impl RecordWriter for JsonlRecordWriter {
    fn write(&mut self, record: &RepoRecord) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
            self.records += 1;
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<u64> {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&self.partial, &self.path)?;
            sync_parent(&self.path);
            debug!("Committed {} records to {}", self.records, self.path.display());
        }
        Ok(self.records)
    }
}

impl Drop for JsonlRecordWriter {
    fn drop(&mut self) {
        if self.writer.take().is_some()
            && let Err(e) = fs::remove_file(&self.partial)
        {
            warn!("Failed to remove {}: {}", self.partial.display(), e);
        }
    }
}

/// Best-effort fsync of the directory holding a renamed file.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}
