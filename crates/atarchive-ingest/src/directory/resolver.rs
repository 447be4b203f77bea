//! Identity resolver backed by RocksDB.
//!
//! Folds directory operations, in log order, into one [`IdentityRecord`] per
//! identifier: the hash chain of applied operation CIDs and the history of
//! hosting endpoints as half-open `[valid_from, valid_to)` intervals.
//!
//! # Key Design
//!
//! - Keys: identifier bytes (`did:plc:...`)
//! - Values: JSON-encoded [`IdentityRecord`]
//! - Bloom filters for fast "unknown identifier" lookups
//! - Rebuildable by re-crawling the directory from the beginning
//!
//! Records keep every applied operation CID, so re-applying an operation that
//! was already folded in is a no-op. Resuming a crawl from a cursor that
//! overlaps previous work is therefore safe.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;
use std::sync::Arc;

use atarchive_core::{Operation, OperationPayload};
use chrono::{DateTime, Utc};
use rocksdb::{DBWithThreadMode, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// A period during which an identifier was hosted at `endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInterval {
    pub endpoint: String,
    pub valid_from: DateTime<Utc>,
    /// `None` while this is the current endpoint.
    pub valid_to: Option<DateTime<Utc>>,
}

impl EndpointInterval {
    fn contains(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.is_none_or(|to| at < to)
    }
}

/// Everything the resolver knows about one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identifier: String,
    /// Ordered, non-overlapping; at most the last one is open.
    pub intervals: Vec<EndpointInterval>,
    /// CIDs of applied operations in chain order. The last one is the head.
    pub chain: Vec<String>,
    /// Handles from the latest operation that declared any.
    #[serde(default)]
    pub handles: Vec<String>,
    pub tombstoned: bool,
}

impl IdentityRecord {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            intervals: Vec::new(),
            chain: Vec::new(),
            handles: Vec::new(),
            tombstoned: false,
        }
    }

    /// CID of the last applied operation.
    pub fn head(&self) -> Option<&str> {
        self.chain.last().map(String::as_str)
    }

    /// Endpoint of the open interval.
    pub fn current_endpoint(&self) -> Option<&str> {
        self.intervals
            .last()
            .filter(|i| i.valid_to.is_none())
            .map(|i| i.endpoint.as_str())
    }

    /// Endpoint valid at `at`.
    pub fn endpoint_at(&self, at: DateTime<Utc>) -> Option<&str> {
        self.intervals
            .iter()
            .find(|i| i.contains(at))
            .map(|i| i.endpoint.as_str())
    }

    /// Close the open interval at `at`. An interval that would end where it
    /// starts is dropped, so the later of two same-instant operations wins.
    fn close_at(&mut self, at: DateTime<Utc>) {
        let Some(open) = self.intervals.last_mut().filter(|i| i.valid_to.is_none()) else {
            return;
        };
        if open.valid_from >= at {
            self.intervals.pop();
        } else {
            open.valid_to = Some(at);
        }
    }

    /// Fold one operation into the record.
    fn apply(&mut self, op: &Operation) -> Result<Change> {
        if self.chain.iter().any(|cid| *cid == op.cid) {
            return Ok(Change::Duplicate);
        }
        if self.tombstoned {
            return Err(Error::Tombstoned(op.identifier.clone()));
        }
        if op.prev.as_deref() != self.head() {
            return Err(Error::OutOfOrder {
                identifier: op.identifier.clone(),
                cid: op.cid.clone(),
                head: self.head().map(str::to_string),
            });
        }

        // Chain order is authoritative; never let an interval start before
        // the one it replaces, or before a closed interval ends.
        let at = match self.intervals.last() {
            Some(last) => op.created_at.max(last.valid_to.unwrap_or(last.valid_from)),
            None => op.created_at,
        };

        match &op.payload {
            OperationPayload::Tombstone => {
                self.close_at(at);
                self.tombstoned = true;
            }
            OperationPayload::Update {
                endpoint, handles, ..
            } => {
                if endpoint.as_deref() != self.current_endpoint() {
                    self.close_at(at);
                    if let Some(endpoint) = endpoint {
                        self.intervals.push(EndpointInterval {
                            endpoint: endpoint.clone(),
                            valid_from: at,
                            valid_to: None,
                        });
                    }
                }
                if !handles.is_empty() {
                    self.handles = handles.clone();
                }
            }
        }

        self.chain.push(op.cid.clone());
        Ok(Change::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Applied,
    Duplicate,
}

/// Counts from [`IdentityResolver::apply_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: u64,
    pub duplicates: u64,
    pub nullified: u64,
    pub out_of_order: u64,
    pub tombstoned: u64,
}

impl ApplyStats {
    pub fn skipped(&self) -> u64 {
        self.nullified + self.out_of_order + self.tombstoned
    }
}

/// RocksDB-backed identity resolver.
///
/// Thread-safe: can be shared across tasks via `Arc<IdentityResolver>`.
/// Operations for one identifier must be applied by a single writer.
pub struct IdentityResolver {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl IdentityResolver {
    /// Open or create a resolver index at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening identity index at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);

        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_target_file_size_base(64 * 1024 * 1024);

        // 10 bits per key = ~1% false positive rate
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Stored record for `identifier`.
    pub fn record(&self, identifier: &str) -> Result<Option<IdentityRecord>> {
        match self.db.get(identifier.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Apply one operation and durably store the result.
    ///
    /// Nullified operations and operations already in the chain leave the
    /// record unchanged. Fails with `OutOfOrder` when `prev` is not the chain
    /// head and `Tombstoned` when the identifier has been retired.
    pub fn apply(&self, op: &Operation) -> Result<IdentityRecord> {
        let mut record = self
            .record(&op.identifier)?
            .unwrap_or_else(|| IdentityRecord::new(&op.identifier));

        if op.nullified {
            return Ok(record);
        }

        if record.apply(op)? == Change::Applied {
            let mut batch = WriteBatch::default();
            batch.put(op.identifier.as_bytes(), serde_json::to_vec(&record)?);
            self.write(batch)?;
        }
        Ok(record)
    }

    /// Apply a page of operations in order, logging and skipping the ones that
    /// cannot be applied. All changes are written in one synced batch.
    pub fn apply_all<'a, I>(&self, ops: I) -> Result<ApplyStats>
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        let mut stats = ApplyStats::default();
        let mut touched: HashMap<String, IdentityRecord> = HashMap::new();

        for op in ops {
            if op.nullified {
                stats.nullified += 1;
                continue;
            }

            let record = match touched.entry(op.identifier.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let stored = self.record(&op.identifier)?;
                    entry.insert(stored.unwrap_or_else(|| IdentityRecord::new(&op.identifier)))
                }
            };

            match record.apply(op) {
                Ok(Change::Applied) => stats.applied += 1,
                Ok(Change::Duplicate) => stats.duplicates += 1,
                Err(e @ Error::OutOfOrder { .. }) => {
                    warn!("Skipping operation: {}", e);
                    stats.out_of_order += 1;
                }
                Err(e @ Error::Tombstoned(_)) => {
                    debug!("Skipping operation {}: {}", op.cid, e);
                    stats.tombstoned += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if stats.applied > 0 {
            let mut batch = WriteBatch::default();
            for (identifier, record) in &touched {
                batch.put(identifier.as_bytes(), serde_json::to_vec(record)?);
            }
            self.write(batch)?;
        }

        metrics::counter!("resolver_operations_applied_total").increment(stats.applied);
        for (reason, count) in [
            ("duplicate", stats.duplicates),
            ("nullified", stats.nullified),
            ("out_of_order", stats.out_of_order),
            ("tombstoned", stats.tombstoned),
        ] {
            if count > 0 {
                atarchive_core::metrics::increment_labeled(
                    "resolver_operations_skipped_total",
                    "reason",
                    reason,
                    count,
                );
            }
        }
        Ok(stats)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .write_opt(batch, &write_opts)
            .map_err(|e| Error::Persistence(format!("Failed to write identity index: {}", e)))
    }

    /// Endpoint hosting `identifier` at time `at`.
    pub fn resolve(&self, identifier: &str, at: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .record(identifier)?
            .and_then(|r| r.endpoint_at(at).map(str::to_string)))
    }

    /// `(identifier, endpoint)` for every identifier with an open interval.
    pub fn current_endpoints(&self) -> impl Iterator<Item = Result<(String, String)>> + '_ {
        self.db
            .iterator(IteratorMode::Start)
            .filter_map(|item| {
                let result = item.map_err(Error::from).and_then(|(_, value)| {
                    let record: IdentityRecord = serde_json::from_slice(&value)?;
                    Ok(record
                        .current_endpoint()
                        .map(|e| (record.identifier.clone(), e.to_string())))
                });
                result.transpose()
            })
    }

    /// Get the approximate number of identifiers in the index.
    pub fn approximate_count(&self) -> Result<u64> {
        let count = self
            .db
            .property_int_value("rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        atarchive_core::metrics::set_gauge("resolver_identities_approximate", count as f64);
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const DID: &str = "did:plc:alice";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn update(cid: &str, prev: Option<&str>, endpoint: Option<&str>, at: i64) -> Operation {
        Operation {
            identifier: DID.to_string(),
            cid: cid.to_string(),
            prev: prev.map(str::to_string),
            payload: OperationPayload::Update {
                endpoint: endpoint.map(str::to_string),
                rotation_keys: vec![],
                handles: vec![],
            },
            created_at: t(at),
            nullified: false,
        }
    }

    fn tombstone(cid: &str, prev: &str, at: i64) -> Operation {
        Operation {
            payload: OperationPayload::Tombstone,
            ..update(cid, Some(prev), None, at)
        }
    }

    fn open() -> (TempDir, IdentityResolver) {
        let tmp = TempDir::new().unwrap();
        let resolver = IdentityResolver::open(tmp.path().join("identities")).unwrap();
        (tmp, resolver)
    }

    #[test]
    fn test_migration_and_tombstone_intervals() {
        let (_tmp, resolver) = open();
        resolver.apply(&update("c1", None, Some("https://a.example"), 10)).unwrap();
        resolver.apply(&update("c2", Some("c1"), Some("https://b.example"), 20)).unwrap();
        let record = resolver.apply(&tombstone("c3", "c2", 30)).unwrap();

        assert!(record.tombstoned);
        assert_eq!(record.intervals.len(), 2);
        assert_eq!(resolver.resolve(DID, t(5)).unwrap(), None);
        assert_eq!(resolver.resolve(DID, t(10)).unwrap().as_deref(), Some("https://a.example"));
        assert_eq!(resolver.resolve(DID, t(19)).unwrap().as_deref(), Some("https://a.example"));
        assert_eq!(resolver.resolve(DID, t(20)).unwrap().as_deref(), Some("https://b.example"));
        assert_eq!(resolver.resolve(DID, t(29)).unwrap().as_deref(), Some("https://b.example"));
        assert_eq!(resolver.resolve(DID, t(30)).unwrap(), None);
        assert_eq!(resolver.resolve(DID, t(1000)).unwrap(), None);
    }

    #[test]
    fn test_open_interval_extends_forever() {
        let (_tmp, resolver) = open();
        resolver.apply(&update("c1", None, Some("https://a.example"), 10)).unwrap();
        assert_eq!(
            resolver.resolve(DID, t(1_000_000)).unwrap().as_deref(),
            Some("https://a.example")
        );
        assert_eq!(resolver.resolve("did:plc:nobody", t(0)).unwrap(), None);
    }

    #[test]
    fn test_out_of_order_and_tombstoned_are_rejected() {
        let (_tmp, resolver) = open();
        resolver.apply(&update("c1", None, Some("https://a.example"), 10)).unwrap();

        let err = resolver
            .apply(&update("c9", Some("unknown"), Some("https://x.example"), 11))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { head: Some(ref h), .. } if h == "c1"));

        resolver.apply(&tombstone("c2", "c1", 12)).unwrap();
        let err = resolver
            .apply(&update("c3", Some("c2"), Some("https://x.example"), 13))
            .unwrap_err();
        assert!(matches!(err, Error::Tombstoned(_)));
    }

    #[test]
    fn test_reapply_is_noop() {
        let (_tmp, resolver) = open();
        let ops = vec![
            update("c1", None, Some("https://a.example"), 10),
            update("c2", Some("c1"), Some("https://b.example"), 20),
        ];
        let first = resolver.apply_all(&ops).unwrap();
        let before = resolver.record(DID).unwrap();
        let second = resolver.apply_all(&ops).unwrap();

        assert_eq!(first.applied, 2);
        assert_eq!(second.applied, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(resolver.record(DID).unwrap(), before);
    }

    #[test]
    fn test_same_timestamp_later_operation_wins() {
        let (_tmp, resolver) = open();
        resolver
            .apply_all(&[
                update("c1", None, Some("https://a.example"), 10),
                update("c2", Some("c1"), Some("https://b.example"), 10),
            ])
            .unwrap();

        let record = resolver.record(DID).unwrap().unwrap();
        assert_eq!(record.intervals.len(), 1);
        assert_eq!(resolver.resolve(DID, t(10)).unwrap().as_deref(), Some("https://b.example"));
    }

    #[test]
    fn test_nullified_and_endpointless_operations() {
        let (_tmp, resolver) = open();
        let mut nullified = update("c2", Some("c1"), Some("https://evil.example"), 15);
        nullified.nullified = true;

        let stats = resolver
            .apply_all(&[
                update("c1", None, Some("https://a.example"), 10),
                nullified,
                update("c3", Some("c1"), None, 20),
            ])
            .unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.nullified, 1);

        let record = resolver.record(DID).unwrap().unwrap();
        assert!(!record.tombstoned);
        assert_eq!(record.current_endpoint(), None);
        assert_eq!(resolver.resolve(DID, t(15)).unwrap().as_deref(), Some("https://a.example"));
        assert_eq!(resolver.resolve(DID, t(25)).unwrap(), None);
    }

    #[test]
    fn test_reopened_interval_starts_after_closed_one() {
        let (_tmp, resolver) = open();
        resolver
            .apply_all(&[
                update("c1", None, Some("https://a.example"), 10),
                update("c2", Some("c1"), None, 30),
                update("c3", Some("c2"), Some("https://b.example"), 20),
            ])
            .unwrap();

        let record = resolver.record(DID).unwrap().unwrap();
        assert_eq!(record.intervals.len(), 2);
        assert_eq!(record.intervals[0].valid_to, Some(t(30)));
        assert_eq!(record.intervals[1].valid_from, t(30));
        assert_eq!(resolver.resolve(DID, t(25)).unwrap().as_deref(), Some("https://a.example"));
        assert_eq!(resolver.resolve(DID, t(30)).unwrap().as_deref(), Some("https://b.example"));
    }

    #[test]
    fn test_current_endpoints_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("identities");
        {
            let resolver = IdentityResolver::open(&path).unwrap();
            let mut bob = update("b1", None, Some("https://b.example"), 10);
            bob.identifier = "did:plc:bob".to_string();
            let mut carol = update("k1", None, Some("https://c.example"), 10);
            carol.identifier = "did:plc:carol".to_string();
            let carol_gone = Operation {
                identifier: "did:plc:carol".to_string(),
                ..tombstone("k2", "k1", 11)
            };
            resolver
                .apply_all(&[
                    update("c1", None, Some("https://a.example"), 10),
                    bob,
                    carol,
                    carol_gone,
                ])
                .unwrap();
        }

        let resolver = IdentityResolver::open(&path).unwrap();
        let mut endpoints: Vec<_> = resolver.current_endpoints().map(|r| r.unwrap()).collect();
        endpoints.sort();
        assert_eq!(
            endpoints,
            vec![
                ("did:plc:alice".to_string(), "https://a.example".to_string()),
                ("did:plc:bob".to_string(), "https://b.example".to_string()),
            ]
        );
        // Chain head survives the restart.
        resolver
            .apply(&update("c2", Some("c1"), Some("https://z.example"), 30))
            .unwrap();
    }
}
