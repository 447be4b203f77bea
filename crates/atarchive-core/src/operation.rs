//! Directory log operations.
//!
//! The directory export is JSON lines of
//! `{did, operation, cid, nullified, createdAt}`. The `operation` object
//! comes in three shapes:
//!
//! - `plc_operation`: current format with `services`, `rotationKeys`, `alsoKnownAs`
//! - `create`: legacy genesis format with flat `service`/`signingKey`/`recoveryKey`/`handle`
//! - `plc_tombstone`: permanently retires the identifier
//!
//! [`LogEntry`] is the wire line, kept as-is for archiving. [`Operation`] is the
//! normalized form the resolver consumes.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Service id of the hosting server inside `services`.
const PDS_SERVICE: &str = "atproto_pds";

/// One line of the directory export, as served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub did: String,
    pub operation: Value,
    pub cid: String,
    #[serde(default)]
    pub nullified: bool,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl LogEntry {
    /// Parse one export line.
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Normalize into an [`Operation`].
    pub fn to_operation(&self) -> Result<Operation> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| Error::field("createdAt", e.to_string()))?
            .with_timezone(&Utc);

        let op = &self.operation;
        let op_type = op
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::field("type", "missing"))?;

        let prev = op.get("prev").and_then(Value::as_str).map(str::to_string);

        let payload = match op_type {
            "plc_operation" => OperationPayload::Update {
                endpoint: op
                    .pointer(&format!("/services/{PDS_SERVICE}/endpoint"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                rotation_keys: string_list(op.get("rotationKeys")),
                handles: string_list(op.get("alsoKnownAs")),
            },
            "create" => OperationPayload::Update {
                endpoint: op.get("service").and_then(Value::as_str).map(str::to_string),
                rotation_keys: ["recoveryKey", "signingKey"]
                    .iter()
                    .filter_map(|k| op.get(*k).and_then(Value::as_str))
                    .map(str::to_string)
                    .collect(),
                handles: op
                    .get("handle")
                    .and_then(Value::as_str)
                    .map(|h| vec![format!("at://{h}")])
                    .unwrap_or_default(),
            },
            "plc_tombstone" => {
                if prev.is_none() {
                    return Err(Error::InvalidOperation(format!(
                        "tombstone {} without prev",
                        self.cid
                    )));
                }
                OperationPayload::Tombstone
            }
            other => {
                return Err(Error::InvalidOperation(format!(
                    "unknown operation type '{other}'"
                )));
            }
        };

        Ok(Operation {
            identifier: self.did.clone(),
            cid: self.cid.clone(),
            prev,
            payload,
            created_at,
            nullified: self.nullified,
        })
    }
}

/// A normalized directory operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub identifier: String,
    pub cid: String,
    /// CID of the operation this one follows; `None` for a genesis operation.
    pub prev: Option<String>,
    pub payload: OperationPayload,
    pub created_at: DateTime<Utc>,
    /// Set when a later recovery operation invalidated this one.
    pub nullified: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationPayload {
    /// Genesis or update. `endpoint` is absent when the identifier has no hosting server.
    Update {
        endpoint: Option<String>,
        rotation_keys: Vec<String>,
        handles: Vec<String>,
    },
    Tombstone,
}

impl Operation {
    /// Hosting endpoint declared by this operation.
    pub fn endpoint(&self) -> Option<&str> {
        match &self.payload {
            OperationPayload::Update { endpoint, .. } => endpoint.as_deref(),
            OperationPayload::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.payload, OperationPayload::Tombstone)
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
