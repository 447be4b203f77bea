//! DAG-CBOR helpers.
//!
//! Frames, container headers, repository nodes and records are all DAG-CBOR.
//! They are decoded into a generic [`Value`] and picked apart with the
//! accessors here, so unknown fields never break decoding.
//!
//! Conversion to JSON follows the network's JSON convention:
//!
//! - CID links (CBOR tag 42) become `{"$link": "<cid>"}`
//! - byte strings become `{"$bytes": "<base64, no padding>"}`

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ciborium::value::Value;
use cid::Cid;
use std::io::Cursor;

/// CBOR tag used by DAG-CBOR for CID links.
pub const CID_LINK_TAG: u64 = 42;

/// Decode one CBOR item from the start of `bytes`, advancing the cursor past it.
pub fn decode_prefix(cursor: &mut Cursor<&[u8]>) -> Result<Value> {
    ciborium::de::from_reader::<Value, _>(cursor).map_err(|e| Error::Cbor(e.to_string()))
}

/// Decode a buffer that holds exactly one CBOR item.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    let mut cursor = Cursor::new(bytes);
    let value = decode_prefix(&mut cursor)?;
    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(Error::Cbor(format!(
            "{} trailing bytes after item",
            bytes.len() - consumed
        )));
    }
    Ok(value)
}

/// Look up a text key in a CBOR map.
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

/// Required text field.
pub fn get_text<'a>(value: &'a Value, field: &'static str) -> Result<&'a str> {
    map_get(value, field)
        .and_then(Value::as_text)
        .ok_or_else(|| Error::field(field, "missing or not a string"))
}

/// Optional text field; `null` and absent both map to `None`.
pub fn get_opt_text<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    map_get(value, key).and_then(Value::as_text)
}

/// Required unsigned integer field.
pub fn get_u64(value: &Value, field: &'static str) -> Result<u64> {
    let int = map_get(value, field)
        .and_then(Value::as_integer)
        .ok_or_else(|| Error::field(field, "missing or not an integer"))?;
    u64::try_from(i128::from(int)).map_err(|_| Error::field(field, "out of range"))
}

/// Optional boolean field.
pub fn get_opt_bool(value: &Value, key: &str) -> Option<bool> {
    map_get(value, key).and_then(Value::as_bool)
}

/// Required byte-string field.
pub fn get_bytes<'a>(value: &'a Value, field: &'static str) -> Result<&'a [u8]> {
    map_get(value, field)
        .and_then(Value::as_bytes)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::field(field, "missing or not a byte string"))
}

/// Interpret a value as a DAG-CBOR CID link.
pub fn as_link(value: &Value) -> Result<Cid> {
    match value {
        Value::Tag(CID_LINK_TAG, inner) => {
            let bytes = inner
                .as_bytes()
                .ok_or_else(|| Error::Cid("link payload is not a byte string".to_string()))?;
            // Binary CIDs inside tag 42 carry the identity multibase prefix 0x00.
            match bytes.split_first() {
                Some((0x00, rest)) => Ok(Cid::try_from(rest)?),
                _ => Err(Error::Cid("link missing multibase prefix".to_string())),
            }
        }
        _ => Err(Error::Cid("value is not a CID link".to_string())),
    }
}

/// Optional link field; `null` and absent both map to `None`.
pub fn get_opt_link(value: &Value, key: &str) -> Result<Option<Cid>> {
    match map_get(value, key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => as_link(v).map(Some),
    }
}

/// Convert a CBOR value into JSON using the network's `$link`/`$bytes` convention.
pub fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => {
            let n = i128::from(*i);
            if let Ok(v) = i64::try_from(n) {
                Json::from(v)
            } else if let Ok(v) = u64::try_from(n) {
                Json::from(v)
            } else {
                Json::String(n.to_string())
            }
        }
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => serde_json::json!({ "$bytes": STANDARD_NO_PAD.encode(b) }),
        Value::Tag(CID_LINK_TAG, _) => match as_link(value) {
            Ok(cid) => serde_json::json!({ "$link": cid.to_string() }),
            Err(_) => Json::Null,
        },
        Value::Tag(_, inner) => to_json(inner),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .filter_map(|(k, v)| k.as_text().map(|k| (k.to_string(), to_json(v))))
                .collect(),
        ),
        _ => Json::Null,
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    //! Builders shared by the decoding tests.

    use super::*;
    use sha2::{Digest, Sha256};

    /// Multicodec for DAG-CBOR.
    pub const DAG_CBOR: u64 = 0x71;

    /// Multihash code for SHA-256.
    pub const SHA2_256: u64 = 0x12;

    pub fn encode(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(value, &mut out).unwrap();
        out
    }

    pub fn cid_for(data: &[u8]) -> Cid {
        let digest = Sha256::digest(data);
        let hash = cid::multihash::Multihash::<64>::wrap(SHA2_256, &digest).unwrap();
        Cid::new_v1(DAG_CBOR, hash)
    }

    pub fn link(cid: &Cid) -> Value {
        let mut bytes = vec![0x00];
        bytes.extend(cid.to_bytes());
        Value::Tag(CID_LINK_TAG, Box::new(Value::Bytes(bytes)))
    }

    pub fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    pub fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (text(k), v)).collect())
    }
}
