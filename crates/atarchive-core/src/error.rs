//! Error types for protocol decoding.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding network data.
#[derive(Error, Debug)]
pub enum Error {
    /// A block's recomputed hash doesn't match the hash in its CID.
    #[error("corrupt block {cid}: content hash mismatch")]
    CorruptBlock {
        /// The CID the block was declared under.
        cid: String,
    },

    /// The container uses a multihash we cannot verify.
    #[error("unsupported multihash code 0x{0:x}")]
    UnsupportedHash(u64),

    /// The container is structurally invalid (bad header, oversized block, bad CID).
    #[error("malformed container: {0}")]
    Car(String),

    /// The input ended in the middle of a varint, header or block.
    #[error("truncated input: {0}")]
    Truncated(String),

    /// CBOR decoding error.
    #[error("CBOR error: {0}")]
    Cbor(String),

    /// CID parsing error.
    #[error("CID error: {0}")]
    Cid(String),

    /// A field is missing or has the wrong shape.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// A directory log entry could not be interpreted.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the container bytes themselves are bad.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptBlock { .. } | Self::UnsupportedHash(_) | Self::Car(_) | Self::Cid(_)
        )
    }

    /// Whether the input simply ended too early.
    pub fn is_truncation(&self) -> bool {
        match self {
            Self::Truncated(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }

    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

impl From<cid::Error> for Error {
    fn from(e: cid::Error) -> Self {
        Self::Cid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_block_display() {
        let err = Error::CorruptBlock {
            cid: "bafyabc".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bafyabc"));
        assert!(msg.contains("hash mismatch"));
        assert!(err.is_corruption());
        assert!(!err.is_truncation());
    }

    #[test]
    fn test_unsupported_hash_display() {
        let err = Error::UnsupportedHash(0x1e);
        assert_eq!(err.to_string(), "unsupported multihash code 0x1e");
        assert!(err.is_corruption());
    }

    #[test]
    fn test_invalid_field_display() {
        let err = Error::field("seq", "missing");
        let msg = err.to_string();
        assert!(msg.contains("seq"));
        assert!(msg.contains("missing"));
    }

    #[test]
    fn test_truncation_classification() {
        assert!(Error::Truncated("block".to_string()).is_truncation());

        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(Error::from(eof).is_truncation());

        let other = std::io::Error::other("disk");
        assert!(!Error::from(other).is_truncation());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}
