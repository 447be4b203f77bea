//! Day-partitioned append logs.
//!
//! Output is one file per UTC day, `<output_dir>/<YYYY-MM-DD>.<ext>`, holding
//! one JSON document per line. Files are only ever opened in append mode:
//! restarting, or receiving a late event for an earlier day, reopens that
//! day's file and continues after its last complete line.
//!
//! The partition is picked by the caller from the item's own timestamp, never
//! from the wall clock.
//!
//! # Durability
//!
//! [`DayPartitionWriter::sync`] flushes the buffer and fsyncs the open file.
//! Switching partitions does the same for the file being closed. A checkpoint
//! may only be committed after `sync` returns.

use crate::error::Result;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the partition writer.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Directory to write partitions to.
    pub output_dir: PathBuf,

    /// File extension, without the dot.
    /// Default: "jsonl"
    pub extension: String,

    /// Write buffer size in bytes.
    /// Default: 1 MB
    pub buffer_size: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data/firehose"),
            extension: "jsonl".to_string(),
            buffer_size: 1024 * 1024,
        }
    }
}

/// Summary of a partition that was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedPartition {
    pub date: NaiveDate,
    pub path: PathBuf,
    /// Lines appended during this opening.
    pub lines: u64,
    /// Bytes appended during this opening.
    pub bytes: u64,
}

struct OpenPartition {
    date: NaiveDate,
    path: PathBuf,
    writer: BufWriter<File>,
    lines: u64,
    bytes: u64,
}

/// Appends lines to day partitions, one open file at a time.
///
/// Thread-safe: uses internal locking for writes.
pub struct DayPartitionWriter {
    config: PartitionConfig,
    current: Mutex<Option<OpenPartition>>,
    total_lines: AtomicU64,
    total_bytes: AtomicU64,
    partitions_opened: AtomicU64,
}

impl DayPartitionWriter {
    pub fn new(config: PartitionConfig) -> Result<Self> {
        fs::create_dir_all(&config.output_dir)?;

        info!(
            "DayPartitionWriter initialized: output_dir={}, extension={}",
            config.output_dir.display(),
            config.extension
        );

        Ok(Self {
            config,
            current: Mutex::new(None),
            total_lines: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            partitions_opened: AtomicU64::new(0),
        })
    }

    /// Path of the partition file for `date`.
    pub fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.config.output_dir.join(format!(
            "{}.{}",
            date.format("%Y-%m-%d"),
            self.config.extension
        ))
    }

    /// Serialize `item` as one JSON line into the partition for `date`.
    ///
    /// Returns the number of bytes written.
    pub fn append<T: Serialize>(&self, date: NaiveDate, item: &T) -> Result<u64> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');
        self.append_raw(date, &line)
    }

    /// Append an already-serialized line. A trailing newline is added if missing.
    pub fn append_line(&self, date: NaiveDate, line: &str) -> Result<u64> {
        if line.ends_with('\n') {
            self.append_raw(date, line.as_bytes())
        } else {
            let mut owned = Vec::with_capacity(line.len() + 1);
            owned.extend_from_slice(line.as_bytes());
            owned.push(b'\n');
            self.append_raw(date, &owned)
        }
    }

    fn append_raw(&self, date: NaiveDate, line: &[u8]) -> Result<u64> {
        let mut current = self.current.lock();

        let partition = match current.take() {
            Some(open) if open.date == date => open,
            previous => {
                if let Some(previous) = previous {
                    self.finish(previous)?;
                }
                self.open(date)?
            }
        };
        let partition = current.insert(partition);

        partition.writer.write_all(line)?;
        partition.lines += 1;
        partition.bytes += line.len() as u64;

        self.total_lines.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(line.len() as u64, Ordering::Relaxed);

        Ok(line.len() as u64)
    }

    fn open(&self, date: NaiveDate) -> Result<OpenPartition> {
        let path = self.partition_path(date);
        debug!("Opening partition: {}", path.display());

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        // A crash can leave a torn final line. Terminate it so the next
        // append starts on a fresh line instead of extending garbage.
        let len = file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                warn!(
                    "Partition {} ends with an incomplete line; terminating it",
                    path.display()
                );
                file.write_all(b"\n")?;
            }
        }

        self.partitions_opened.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("partition_opened_total").increment(1);

        Ok(OpenPartition {
            date,
            path,
            writer: BufWriter::with_capacity(self.config.buffer_size, file),
            lines: 0,
            bytes: 0,
        })
    }

    fn finish(&self, partition: OpenPartition) -> Result<ClosedPartition> {
        let OpenPartition {
            date,
            path,
            mut writer,
            lines,
            bytes,
        } = partition;

        writer.flush()?;
        writer.get_ref().sync_data()?;

        debug!(
            "Closed partition {}: {} lines, {} bytes",
            path.display(),
            lines,
            bytes
        );

        Ok(ClosedPartition {
            date,
            path,
            lines,
            bytes,
        })
    }

    /// Flush buffered lines and fsync the open partition.
    pub fn sync(&self) -> Result<()> {
        let started = Instant::now();
        let mut current = self.current.lock();
        if let Some(partition) = current.as_mut() {
            partition.writer.flush()?;
            partition.writer.get_ref().sync_data()?;
        }
        atarchive_core::metrics::record_duration(
            "partition_sync_duration_seconds",
            started.elapsed(),
        );
        Ok(())
    }

    /// Sync and close the open partition, if any.
    pub fn close(&self) -> Result<Option<ClosedPartition>> {
        let mut current = self.current.lock();
        match current.take() {
            Some(partition) => self.finish(partition).map(Some),
            None => Ok(None),
        }
    }

    /// Date of the partition currently open.
    pub fn current_date(&self) -> Option<NaiveDate> {
        self.current.lock().as_ref().map(|p| p.date)
    }

    pub fn stats(&self) -> PartitionStats {
        PartitionStats {
            total_lines: self.total_lines.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            partitions_opened: self.partitions_opened.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DayPartitionWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing partition on drop: {}", e);
        }
    }
}

/// Statistics about the partition writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub total_lines: u64,
    pub total_bytes: u64,
    /// Number of times a partition file was opened, including reopens.
    pub partitions_opened: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn writer(tmp: &TempDir) -> DayPartitionWriter {
        DayPartitionWriter::new(PartitionConfig {
            output_dir: tmp.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn read_lines(path: &std::path::Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_append_and_sync() {
        let tmp = TempDir::new().unwrap();
        let writer = writer(&tmp);

        writer
            .append(day(1), &serde_json::json!({"seq": 1}))
            .unwrap();
        writer
            .append(day(1), &serde_json::json!({"seq": 2}))
            .unwrap();
        writer.sync().unwrap();

        let path = tmp.path().join("2024-03-01.jsonl");
        assert_eq!(read_lines(&path), vec![r#"{"seq":1}"#, r#"{"seq":2}"#]);

        let stats = writer.stats();
        assert_eq!(stats.total_lines, 2);
        assert_eq!(stats.partitions_opened, 1);
    }

    #[test]
    fn test_rollover_and_late_event() {
        let tmp = TempDir::new().unwrap();
        let writer = writer(&tmp);

        writer.append_line(day(1), "a").unwrap();
        writer.append_line(day(2), "b").unwrap();
        assert_eq!(writer.current_date(), Some(day(2)));
        // Late event for the previous day goes back to its own file.
        writer.append_line(day(1), "c").unwrap();
        writer.close().unwrap();

        assert_eq!(read_lines(&tmp.path().join("2024-03-01.jsonl")), vec!["a", "c"]);
        assert_eq!(read_lines(&tmp.path().join("2024-03-02.jsonl")), vec!["b"]);
        assert_eq!(writer.stats().partitions_opened, 3);
    }

    #[test]
    fn test_reopen_appends() {
        let tmp = TempDir::new().unwrap();
        {
            let writer = writer(&tmp);
            writer.append_line(day(5), "first").unwrap();
        }
        {
            let writer = writer(&tmp);
            writer.append_line(day(5), "second\n").unwrap();
        }

        assert_eq!(
            read_lines(&tmp.path().join("2024-03-05.jsonl")),
            vec!["first", "second"]
        );
    }

    #[test]
    fn test_torn_line_is_terminated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("2024-03-09.jsonl");
        fs::write(&path, "{\"seq\":1}\n{\"seq\":2,\"di").unwrap();

        let writer = writer(&tmp);
        writer.append_line(day(9), r#"{"seq":3}"#).unwrap();
        writer.close().unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], r#"{"seq":1}"#);
        assert_eq!(lines[2], r#"{"seq":3}"#);
    }

    #[test]
    fn test_close_reports_partition() {
        let tmp = TempDir::new().unwrap();
        let writer = writer(&tmp);
        assert!(writer.close().unwrap().is_none());

        writer.append_line(day(3), "x").unwrap();
        let closed = writer.close().unwrap().unwrap();
        assert_eq!(closed.date, day(3));
        assert_eq!(closed.lines, 1);
        assert_eq!(closed.bytes, 2);
        assert!(writer.current_date().is_none());
    }
}
