//! Firehose frame decoding.
//!
//! Every message on the repository subscription is two concatenated DAG-CBOR
//! items: a header `{op, t}` and a body. `op = 1` carries a message whose type
//! is named by `t` (`#commit`, `#identity`, ...); `op = -1` is an error frame
//! after which the relay closes the connection.
//!
//! Decoding is split in two steps so the connection owner only pays for what
//! it needs to validate ordering:
//!
//! 1. [`decode_frame`] parses the envelope and extracts the sequence number.
//! 2. [`RawEvent::decode`] turns the body into a typed [`FirehoseEvent`].
//!    This runs on the append worker.

use crate::car::CarReader;
use crate::cbor;
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use ciborium::value::Value;
use cid::Cid;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Cursor;

/// Event kinds written to the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Commit,
    Identity,
    Account,
    Tombstone,
}

impl EventKind {
    fn from_type(t: &str) -> Option<Self> {
        match t {
            "#commit" => Some(Self::Commit),
            "#identity" => Some(Self::Identity),
            "#account" => Some(Self::Account),
            "#tombstone" => Some(Self::Tombstone),
            _ => None,
        }
    }

    /// Lowercase name, as written in the `kind` field of output lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Identity => "identity",
            Self::Account => "account",
            Self::Tombstone => "tombstone",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded frame envelope.
#[derive(Debug, Clone)]
pub enum Frame {
    /// An event of one of the archived kinds, body not yet interpreted.
    Event(RawEvent),
    /// A sequenced message of a kind that is not archived (`#sync`, `#handle`, ...).
    Other {
        kind: String,
        sequence: Option<u64>,
    },
    /// Informational message from the relay (`OutdatedCursor`, ...).
    Info {
        name: String,
        message: Option<String>,
    },
    /// The relay reported an error and will close the stream.
    Error {
        error: String,
        message: Option<String>,
    },
}

impl Frame {
    /// Sequence number carried by the frame, if any.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Event(raw) => Some(raw.sequence),
            Self::Other { sequence, .. } => *sequence,
            Self::Info { .. } | Self::Error { .. } => None,
        }
    }
}

/// An archived-kind event whose body has only been parsed as generic CBOR.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: EventKind,
    pub sequence: u64,
    body: Value,
    raw: Vec<u8>,
}

/// Parse a frame envelope.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let mut cursor = Cursor::new(bytes);
    let header = cbor::decode_prefix(&mut cursor)?;
    let body = cbor::decode_prefix(&mut cursor)?;

    let op = cbor::map_get(&header, "op")
        .and_then(Value::as_integer)
        .map(i128::from)
        .ok_or_else(|| Error::field("op", "missing or not an integer"))?;

    match op {
        -1 => Ok(Frame::Error {
            error: cbor::get_opt_text(&body, "error")
                .unwrap_or("Unknown")
                .to_string(),
            message: cbor::get_opt_text(&body, "message").map(str::to_string),
        }),
        1 => {
            let t = cbor::get_text(&header, "t")?;
            if t == "#info" {
                return Ok(Frame::Info {
                    name: cbor::get_text(&body, "name")?.to_string(),
                    message: cbor::get_opt_text(&body, "message").map(str::to_string),
                });
            }
            match EventKind::from_type(t) {
                Some(kind) => Ok(Frame::Event(RawEvent {
                    kind,
                    sequence: cbor::get_u64(&body, "seq")?,
                    body,
                    raw: bytes.to_vec(),
                })),
                None => Ok(Frame::Other {
                    kind: t.to_string(),
                    sequence: cbor::get_u64(&body, "seq").ok(),
                }),
            }
        }
        other => Err(Error::field("op", format!("unknown op {other}"))),
    }
}

/// A decoded, archivable event.
///
/// Serializes to one output line: `{"seq", "did", "time", "kind", "payload"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirehoseEvent {
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(rename = "did")]
    pub identifier: String,
    pub time: Option<String>,
    #[serde(flatten)]
    pub body: EventBody,
    /// The complete frame as received.
    #[serde(skip)]
    pub raw_payload: Vec<u8>,
}

/// Kind-specific event content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum EventBody {
    Commit(CommitPayload),
    Identity {
        handle: Option<String>,
    },
    Account {
        active: bool,
        status: Option<String>,
    },
    Tombstone,
}

/// Content of a `#commit` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitPayload {
    pub rev: Option<String>,
    #[serde(rename = "tooBig")]
    pub too_big: bool,
    #[serde(rename = "ops")]
    pub operations: Vec<CommitOperation>,
}

/// One record-level change inside a commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitOperation {
    pub action: String,
    pub path: String,
    pub collection: String,
    #[serde(rename = "rkey")]
    pub record_key: String,
    pub cid: Option<String>,
    /// The record body, when the commit carried it and it decoded.
    pub record: Option<serde_json::Value>,
}

impl FirehoseEvent {
    pub fn kind(&self) -> EventKind {
        match self.body {
            EventBody::Commit(_) => EventKind::Commit,
            EventBody::Identity { .. } => EventKind::Identity,
            EventBody::Account { .. } => EventKind::Account,
            EventBody::Tombstone => EventKind::Tombstone,
        }
    }

    /// UTC day of the event's own timestamp, if it has a parseable one.
    pub fn date(&self) -> Option<NaiveDate> {
        let time = self.time.as_deref()?;
        DateTime::parse_from_rfc3339(time)
            .ok()
            .map(|t| t.with_timezone(&Utc).date_naive())
    }
}

impl RawEvent {
    /// Interpret the body according to the event kind.
    pub fn decode(&self) -> Result<FirehoseEvent> {
        let body = &self.body;
        let time = cbor::get_opt_text(body, "time").map(str::to_string);

        let (identifier, event_body) = match self.kind {
            EventKind::Commit => {
                let repo = cbor::get_text(body, "repo")?.to_string();
                (repo, EventBody::Commit(decode_commit(body)?))
            }
            EventKind::Identity => (
                cbor::get_text(body, "did")?.to_string(),
                EventBody::Identity {
                    handle: cbor::get_opt_text(body, "handle").map(str::to_string),
                },
            ),
            EventKind::Account => (
                cbor::get_text(body, "did")?.to_string(),
                EventBody::Account {
                    active: cbor::get_opt_bool(body, "active").unwrap_or(true),
                    status: cbor::get_opt_text(body, "status").map(str::to_string),
                },
            ),
            EventKind::Tombstone => (cbor::get_text(body, "did")?.to_string(), EventBody::Tombstone),
        };

        Ok(FirehoseEvent {
            sequence: self.sequence,
            identifier,
            time,
            body: event_body,
            raw_payload: self.raw.clone(),
        })
    }
}

fn decode_commit(body: &Value) -> Result<CommitPayload> {
    let blocks = match cbor::map_get(body, "blocks").and_then(Value::as_bytes) {
        Some(bytes) if !bytes.is_empty() => load_blocks(bytes),
        _ => HashMap::new(),
    };

    let raw_ops = cbor::map_get(body, "ops")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::field("ops", "missing or not an array"))?;

    let mut operations = Vec::with_capacity(raw_ops.len());
    for raw in raw_ops {
        let path = cbor::get_text(raw, "path")?.to_string();
        let (collection, record_key) = match path.split_once('/') {
            Some((c, r)) => (c.to_string(), r.to_string()),
            None => (path.clone(), String::new()),
        };
        let cid = cbor::get_opt_link(raw, "cid").ok().flatten();
        let record = cid
            .as_ref()
            .and_then(|cid| blocks.get(cid))
            .and_then(|data| cbor::decode_value(data).ok())
            .map(|value| cbor::to_json(&value));

        operations.push(CommitOperation {
            action: cbor::get_text(raw, "action")?.to_string(),
            path,
            collection,
            record_key,
            cid: cid.map(|c| c.to_string()),
            record,
        });
    }

    Ok(CommitPayload {
        rev: cbor::get_opt_text(body, "rev").map(str::to_string),
        too_big: cbor::get_opt_bool(body, "tooBig").unwrap_or(false),
        operations,
    })
}

/// Collect the verified blocks of a commit's embedded container.
///
/// Best effort: a damaged slice yields whatever verified before the damage.
fn load_blocks(bytes: &[u8]) -> HashMap<Cid, Vec<u8>> {
    let mut blocks = HashMap::new();
    let reader = match CarReader::new(bytes) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::debug!("Commit blocks unreadable: {}", e);
            return blocks;
        }
    };
    for block in reader {
        match block {
            Ok(block) => {
                blocks.insert(block.cid, block.data);
            }
            Err(e) => {
                tracing::debug!("Commit blocks truncated: {}", e);
                break;
            }
        }
    }
    blocks
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    //! Frame builders.

    use crate::cbor::test_support::{encode, map, text};
    use ciborium::value::Value;

    pub fn frame(t: &str, body: Value) -> Vec<u8> {
        let mut out = encode(&map(vec![("op", Value::Integer(1.into())), ("t", text(t))]));
        out.extend(encode(&body));
        out
    }

    pub fn error_frame(error: &str) -> Vec<u8> {
        let mut out = encode(&map(vec![("op", Value::Integer((-1).into()))]));
        out.extend(encode(&map(vec![("error", text(error))])));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::car::test_support::encode_car;
    use crate::cbor::test_support::{cid_for, encode, link, map, text};

    fn int(n: u64) -> Value {
        Value::Integer(n.into())
    }

    fn commit_body(seq: u64) -> Value {
        let record = encode(&map(vec![
            ("$type", text("app.bsky.feed.post")),
            ("text", text("hello")),
        ]));
        let record_cid = cid_for(&record);
        let missing_cid = cid_for(b"not included");
        let blocks = encode_car(&[record_cid], &[(record_cid, record)]);

        map(vec![
            ("seq", int(seq)),
            ("repo", text("did:plc:alice")),
            ("rev", text("3kabc")),
            ("time", text("2024-03-01T23:59:59.500Z")),
            ("tooBig", Value::Bool(false)),
            ("blocks", Value::Bytes(blocks)),
            (
                "ops",
                Value::Array(vec![
                    map(vec![
                        ("action", text("create")),
                        ("path", text("app.bsky.feed.post/3kpost")),
                        ("cid", link(&record_cid)),
                    ]),
                    map(vec![
                        ("action", text("update")),
                        ("path", text("app.bsky.actor.profile/self")),
                        ("cid", link(&missing_cid)),
                    ]),
                    map(vec![
                        ("action", text("delete")),
                        ("path", text("app.bsky.feed.like/3klike")),
                        ("cid", Value::Null),
                    ]),
                ]),
            ),
        ])
    }

    fn decode_event(bytes: &[u8]) -> FirehoseEvent {
        match decode_frame(bytes).unwrap() {
            Frame::Event(raw) => raw.decode().unwrap(),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_commit_frame() {
        let bytes = frame("#commit", commit_body(42));
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.sequence(), Some(42));

        let event = decode_event(&bytes);
        assert_eq!(event.kind(), EventKind::Commit);
        assert_eq!(event.identifier, "did:plc:alice");
        assert_eq!(event.date(), NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(event.raw_payload, bytes);

        let EventBody::Commit(commit) = &event.body else {
            panic!("expected commit body");
        };
        assert_eq!(commit.rev.as_deref(), Some("3kabc"));
        assert_eq!(commit.operations.len(), 3);

        let create = &commit.operations[0];
        assert_eq!(create.collection, "app.bsky.feed.post");
        assert_eq!(create.record_key, "3kpost");
        assert_eq!(create.record.as_ref().unwrap()["text"], "hello");

        // Referenced but not shipped: the operation survives without a body.
        assert!(commit.operations[1].record.is_none());
        assert!(commit.operations[1].cid.is_some());

        let delete = &commit.operations[2];
        assert_eq!(delete.action, "delete");
        assert!(delete.cid.is_none());
        assert!(delete.record.is_none());
    }

    #[test]
    fn test_event_line_shape() {
        let event = decode_event(&frame("#commit", commit_body(7)));
        let line = serde_json::to_value(&event).unwrap();
        assert_eq!(line["kind"], "commit");
        assert_eq!(line["seq"], 7);
        assert_eq!(line["did"], "did:plc:alice");
        assert_eq!(line["payload"]["ops"][0]["rkey"], "3kpost");
        assert!(line["payload"]["ops"][1]["record"].is_null());
        assert!(line.get("raw_payload").is_none());
    }

    #[test]
    fn test_identity_account_tombstone() {
        let identity = decode_event(&frame(
            "#identity",
            map(vec![
                ("seq", int(1)),
                ("did", text("did:plc:bob")),
                ("time", text("2024-01-01T00:00:00Z")),
                ("handle", text("bob.example.com")),
            ]),
        ));
        assert_eq!(
            identity.body,
            EventBody::Identity {
                handle: Some("bob.example.com".to_string())
            }
        );

        let account = decode_event(&frame(
            "#account",
            map(vec![
                ("seq", int(2)),
                ("did", text("did:plc:bob")),
                ("active", Value::Bool(false)),
                ("status", text("takendown")),
            ]),
        ));
        assert_eq!(
            account.body,
            EventBody::Account {
                active: false,
                status: Some("takendown".to_string())
            }
        );
        assert_eq!(account.date(), None);

        let tombstone = decode_event(&frame(
            "#tombstone",
            map(vec![("seq", int(3)), ("did", text("did:plc:bob"))]),
        ));
        assert_eq!(tombstone.kind(), EventKind::Tombstone);
        let line = serde_json::to_value(&tombstone).unwrap();
        assert_eq!(line["kind"], "tombstone");
    }

    #[test]
    fn test_info_other_and_error_frames() {
        let info = decode_frame(&frame(
            "#info",
            map(vec![("name", text("OutdatedCursor"))]),
        ))
        .unwrap();
        assert!(matches!(info, Frame::Info { ref name, .. } if name == "OutdatedCursor"));
        assert_eq!(info.sequence(), None);

        let sync = decode_frame(&frame(
            "#sync",
            map(vec![("seq", int(9)), ("did", text("did:plc:x"))]),
        ))
        .unwrap();
        assert!(matches!(sync, Frame::Other { ref kind, sequence: Some(9) } if kind == "#sync"));

        let error = decode_frame(&error_frame("FutureCursor")).unwrap();
        assert!(matches!(error, Frame::Error { ref error, .. } if error == "FutureCursor"));
    }

    #[test]
    fn test_garbage_frame_is_error() {
        assert!(decode_frame(&[0xff, 0x00, 0x13]).is_err());

        let mut header_only = encode(&map(vec![("op", int(1)), ("t", text("#commit"))]));
        assert!(decode_frame(&header_only).is_err());

        header_only.extend(encode(&map(vec![("repo", text("did:plc:x"))])));
        // Known kind without a sequence number cannot be placed in the stream.
        assert!(decode_frame(&header_only).is_err());
    }

    #[test]
    fn test_commit_without_repo_fails_body_decode() {
        let bytes = frame(
            "#commit",
            map(vec![("seq", int(5)), ("ops", Value::Array(vec![]))]),
        );
        let Frame::Event(raw) = decode_frame(&bytes).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(raw.sequence, 5);
        assert!(raw.decode().is_err());
    }
}
