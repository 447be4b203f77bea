//! Repository snapshot decoding.
//!
//! A repository snapshot is a CAR container whose root is a signed commit
//! `{did, rev, data, ...}`. `data` points at the root of a Merkle Search Tree
//! whose nodes look like `{l, e: [{p, k, v, t}]}`: `l` is the left subtree,
//! each entry's full key is `prev_key[..p] + k`, `v` links to the record and
//! `t` to the subtree to the right of the entry. Keys have the form
//! `<collection>/<record_key>`.
//!
//! Containers are usually written in tree order, but nothing guarantees it,
//! so [`RepoWalker`] accepts blocks in any order. A block is classified as soon
//! as it is reachable from the commit; blocks that arrive before their parent
//! are parked until the parent shows up.

use crate::car::{Block, CarReader};
use crate::cbor;
use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use cid::Cid;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;

/// One record decoded from a repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoRecord {
    pub collection: String,
    #[serde(rename = "rkey")]
    pub record_key: String,
    #[serde(serialize_with = "serialize_cid")]
    pub cid: Cid,
    #[serde(rename = "record")]
    pub value: serde_json::Value,
}

/// The signed commit at the root of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub did: String,
    pub rev: Option<String>,
    pub data: Cid,
}

/// Leftovers once the container is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// Records referenced by the tree but absent from the container.
    pub missing_records: usize,
    /// Tree nodes referenced by the commit but absent from the container.
    pub missing_nodes: usize,
    /// Blocks never reached from the commit.
    pub unreferenced_blocks: usize,
}

/// Incremental tree walker fed one verified block at a time.
pub struct RepoWalker {
    root: Cid,
    commit: Option<Commit>,
    expected_nodes: HashSet<Cid>,
    expected_records: HashMap<Cid, Vec<String>>,
    parked: HashMap<Cid, Vec<u8>>,
    ready: VecDeque<RepoRecord>,
}

impl RepoWalker {
    /// Create a walker for the repository whose commit has CID `root`.
    pub fn new(root: Cid) -> Self {
        Self {
            root,
            commit: None,
            expected_nodes: HashSet::new(),
            expected_records: HashMap::new(),
            parked: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// The commit, once its block has been seen.
    pub fn commit(&self) -> Option<&Commit> {
        self.commit.as_ref()
    }

    /// Feed one block. Records it unlocks become available from [`pop`](Self::pop).
    pub fn push(&mut self, block: Block) -> Result<()> {
        let mut work = vec![block];

        while let Some(Block { cid, data }) = work.pop() {
            if cid == self.root && self.commit.is_none() {
                let commit = decode_commit(&cid, &data)?;
                self.expect_node(commit.data, &mut work);
                self.commit = Some(commit);
            } else if self.expected_nodes.remove(&cid) {
                let node = decode_node(&cid, &data)?;
                if let Some(left) = node.left {
                    self.expect_node(left, &mut work);
                }
                for entry in node.entries {
                    self.expect_record(entry.value, entry.key, &mut work);
                    if let Some(tree) = entry.tree {
                        self.expect_node(tree, &mut work);
                    }
                }
            } else if let Some(keys) = self.expected_records.remove(&cid) {
                let value = decode_record(&data);
                for key in keys {
                    let (collection, record_key) = split_key(&key)?;
                    self.ready.push_back(RepoRecord {
                        collection,
                        record_key,
                        cid,
                        value: value.clone(),
                    });
                }
            } else {
                self.parked.insert(cid, data);
            }
        }
        Ok(())
    }

    /// Next decoded record, if any is ready.
    pub fn pop(&mut self) -> Option<RepoRecord> {
        self.ready.pop_front()
    }

    /// Report what was never resolved.
    pub fn summary(&self) -> WalkSummary {
        WalkSummary {
            missing_records: self.expected_records.values().map(Vec::len).sum(),
            missing_nodes: self.expected_nodes.len(),
            unreferenced_blocks: self.parked.len(),
        }
    }

    fn expect_node(&mut self, cid: Cid, work: &mut Vec<Block>) {
        self.expected_nodes.insert(cid);
        if let Some(data) = self.parked.remove(&cid) {
            work.push(Block { cid, data });
        }
    }

    fn expect_record(&mut self, cid: Cid, key: String, work: &mut Vec<Block>) {
        self.expected_records.entry(cid).or_default().push(key);
        if let Some(data) = self.parked.remove(&cid) {
            work.push(Block { cid, data });
        }
    }
}

/// Lazily yields the records of a repository container.
///
/// The first error ends the iteration; records that were already yielded stay
/// valid, nothing after the failing block is produced.
pub struct RepoReader<R> {
    car: CarReader<R>,
    walker: RepoWalker,
    failed: bool,
}

impl<R: Read> RepoReader<R> {
    /// Read the container header and prepare to walk from its first root.
    pub fn new(reader: R) -> Result<Self> {
        let car = CarReader::new(reader)?;
        let root = *car
            .roots()
            .first()
            .ok_or_else(|| Error::Car("container has no root".to_string()))?;
        Ok(Self {
            car,
            walker: RepoWalker::new(root),
            failed: false,
        })
    }

    /// The commit, once it has been read.
    pub fn commit(&self) -> Option<&Commit> {
        self.walker.commit()
    }

    /// Unresolved references so far.
    pub fn summary(&self) -> WalkSummary {
        self.walker.summary()
    }

    fn fail(&mut self, err: Error) -> Option<Result<RepoRecord>> {
        self.failed = true;
        self.walker.ready.clear();
        Some(Err(err))
    }
}

impl<R: Read> Iterator for RepoReader<R> {
    type Item = Result<RepoRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.walker.pop() {
                return Some(Ok(record));
            }
            if self.failed {
                return None;
            }
            match self.car.next_block() {
                Ok(Some(block)) => {
                    if let Err(e) = self.walker.push(block) {
                        return self.fail(e);
                    }
                }
                Ok(None) => return None,
                Err(e) => return self.fail(e),
            }
        }
    }
}

struct Node {
    left: Option<Cid>,
    entries: Vec<Entry>,
}

struct Entry {
    key: String,
    value: Cid,
    tree: Option<Cid>,
}

fn decode_commit(cid: &Cid, data: &[u8]) -> Result<Commit> {
    let inner = || -> Result<Commit> {
        let value = cbor::decode_value(data)?;
        let data = cbor::get_opt_link(&value, "data")?
            .ok_or_else(|| Error::field("data", "missing"))?;
        Ok(Commit {
            did: cbor::get_text(&value, "did")?.to_string(),
            rev: cbor::get_opt_text(&value, "rev").map(str::to_string),
            data,
        })
    };
    inner().map_err(|e| Error::Car(format!("commit {cid}: {e}")))
}

fn decode_node(cid: &Cid, data: &[u8]) -> Result<Node> {
    let inner = || -> Result<Node> {
        let value = cbor::decode_value(data)?;
        let left = cbor::get_opt_link(&value, "l")?;
        let raw_entries = cbor::map_get(&value, "e")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::field("e", "missing or not an array"))?;

        let mut prev_key: Vec<u8> = Vec::new();
        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let prefix = cbor::get_u64(raw, "p")? as usize;
            let suffix = cbor::get_bytes(raw, "k")?;
            if prefix > prev_key.len() {
                return Err(Error::field("p", "prefix longer than previous key"));
            }

            let mut key = prev_key[..prefix].to_vec();
            key.extend_from_slice(suffix);

            let value = cbor::map_get(raw, "v")
                .ok_or_else(|| Error::field("v", "missing"))
                .and_then(cbor::as_link)?;
            let tree = cbor::get_opt_link(raw, "t")?;

            let key_text = String::from_utf8(key.clone())
                .map_err(|_| Error::field("k", "key is not UTF-8"))?;
            entries.push(Entry {
                key: key_text,
                value,
                tree,
            });
            prev_key = key;
        }

        Ok(Node { left, entries })
    };
    inner().map_err(|e| Error::Car(format!("tree node {cid}: {e}")))
}

/// Decode a record body to JSON, falling back to the raw bytes.
fn decode_record(data: &[u8]) -> serde_json::Value {
    match cbor::decode_value(data) {
        Ok(value) => cbor::to_json(&value),
        Err(_) => serde_json::json!({ "$bytes": STANDARD_NO_PAD.encode(data) }),
    }
}

fn split_key(key: &str) -> Result<(String, String)> {
    match key.split_once('/') {
        Some((collection, rkey)) if !collection.is_empty() && !rkey.is_empty() => {
            Ok((collection.to_string(), rkey.to_string()))
        }
        _ => Err(Error::Car(format!("tree key '{key}' is not collection/rkey"))),
    }
}

fn serialize_cid<S: serde::Serializer>(cid: &Cid, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(cid)
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    //! Builds small but structurally real repositories.

    use super::*;
    use crate::car::test_support::encode_car;
    use crate::cbor::test_support::{cid_for, encode, link, map, text};
    use ciborium::value::Value;

    pub struct TestRepo {
        pub commit: Cid,
        /// Blocks in tree order: commit, root node, left subtree, records.
        pub blocks: Vec<(Cid, Vec<u8>)>,
        /// `(key, record cid)` in key order.
        pub records: Vec<(String, Cid)>,
    }

    impl TestRepo {
        pub fn to_car(&self) -> Vec<u8> {
            encode_car(&[self.commit], &self.blocks)
        }
    }

    fn block(value: &Value) -> (Cid, Vec<u8>) {
        let data = encode(value);
        (cid_for(&data), data)
    }

    fn entry(prefix: usize, suffix: &str, value: &Cid, tree: Option<&Cid>) -> Value {
        map(vec![
            ("p", Value::Integer((prefix as u64).into())),
            ("k", Value::Bytes(suffix.as_bytes().to_vec())),
            ("v", link(value)),
            ("t", tree.map(link).unwrap_or(Value::Null)),
        ])
    }

    /// Three posts: one in a left subtree, two in the root node with
    /// prefix-compressed keys.
    pub fn build() -> TestRepo {
        let post = |t: &str| {
            block(&map(vec![
                ("$type", text("app.bsky.feed.post")),
                ("text", text(t)),
            ]))
        };
        let r1 = post("first");
        let r2 = post("second");
        let r3 = post("third");

        let k1 = "app.bsky.feed.post/3aaa";
        let k2 = "app.bsky.feed.post/3bbb";
        let k3 = "app.bsky.feed.post/3bbc";

        let left = block(&map(vec![
            ("l", Value::Null),
            ("e", Value::Array(vec![entry(0, k1, &r1.0, None)])),
        ]));
        let root = block(&map(vec![
            ("l", link(&left.0)),
            (
                "e",
                Value::Array(vec![
                    entry(0, k2, &r2.0, None),
                    entry(k3.len() - 1, "c", &r3.0, None),
                ]),
            ),
        ]));
        let commit = block(&map(vec![
            ("did", text("did:plc:testuser")),
            ("version", Value::Integer(3.into())),
            ("rev", text("3kabc")),
            ("data", link(&root.0)),
            ("prev", Value::Null),
            ("sig", Value::Bytes(vec![0; 8])),
        ]));

        TestRepo {
            commit: commit.0,
            records: vec![
                (k1.to_string(), r1.0),
                (k2.to_string(), r2.0),
                (k3.to_string(), r3.0),
            ],
            blocks: vec![commit, root, left, r1, r2, r3],
        }
    }
}
