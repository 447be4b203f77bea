//! CAR v1 container reader.
//!
//! A container is a varint-prefixed DAG-CBOR header `{version: 1, roots: [cid]}`
//! followed by sections of `varint(len) || cid || data`. Every block is checked
//! against the hash in its CID before it is handed out, so a consumer never
//! sees bytes that do not match their address.
//!
//! The reader pulls from any [`Read`] one section at a time and never holds
//! more than a single block in memory.

use crate::cbor;
use crate::error::{Error, Result};
use cid::Cid;
use sha2::{Digest, Sha256};
use std::io::{Cursor, ErrorKind, Read};

/// Multihash code for SHA2-256.
pub const SHA2_256: u64 = 0x12;

/// Multihash code for the identity "hash" (digest is the data itself).
pub const IDENTITY: u64 = 0x00;

/// Largest header accepted, in bytes.
const MAX_HEADER_LEN: u64 = 64 * 1024;

/// Largest section accepted, in bytes.
pub const MAX_BLOCK_LEN: u64 = 16 * 1024 * 1024;

/// One verified block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

/// Streaming reader over a CAR v1 container.
pub struct CarReader<R> {
    reader: R,
    roots: Vec<Cid>,
    done: bool,
}

impl<R: Read> CarReader<R> {
    /// Read and validate the container header.
    pub fn new(mut reader: R) -> Result<Self> {
        let len = read_varint(&mut reader)?
            .ok_or_else(|| Error::Truncated("empty container".to_string()))?;
        if len == 0 || len > MAX_HEADER_LEN {
            return Err(Error::Car(format!("header length {len} out of range")));
        }

        let buf = read_section(&mut reader, len, "header")?;
        let header =
            cbor::decode_value(&buf).map_err(|e| Error::Car(format!("header: {e}")))?;

        let version = cbor::get_u64(&header, "version")
            .map_err(|e| Error::Car(format!("header: {e}")))?;
        if version != 1 {
            return Err(Error::Car(format!("unsupported version {version}")));
        }

        let roots = cbor::map_get(&header, "roots")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Car("header has no roots".to_string()))?
            .iter()
            .map(cbor::as_link)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::Car(format!("header root: {e}")))?;

        Ok(Self {
            reader,
            roots,
            done: false,
        })
    }

    /// Root CIDs declared in the header.
    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// Read and verify the next block, or `None` at a clean end of input.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        if self.done {
            return Ok(None);
        }

        let result = self.read_block();
        if !matches!(result, Ok(Some(_))) {
            self.done = true;
        }
        result
    }

    fn read_block(&mut self) -> Result<Option<Block>> {
        let Some(len) = read_varint(&mut self.reader)? else {
            return Ok(None);
        };
        if len == 0 || len > MAX_BLOCK_LEN {
            return Err(Error::Car(format!("section length {len} out of range")));
        }

        let buf = read_section(&mut self.reader, len, "block")?;
        let mut cursor = Cursor::new(buf.as_slice());
        let cid =
            Cid::read_bytes(&mut cursor).map_err(|e| Error::Car(format!("block CID: {e}")))?;
        let data = buf[cursor.position() as usize..].to_vec();

        verify_block(&cid, &data)?;
        Ok(Some(Block { cid, data }))
    }
}

impl<R: Read> Iterator for CarReader<R> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block().transpose()
    }
}

/// Check that `data` hashes to the digest carried by `cid`.
pub fn verify_block(cid: &Cid, data: &[u8]) -> Result<()> {
    let hash = cid.hash();
    let matches = match hash.code() {
        SHA2_256 => Sha256::digest(data).as_slice() == hash.digest(),
        IDENTITY => hash.digest() == data,
        other => return Err(Error::UnsupportedHash(other)),
    };

    if matches {
        Ok(())
    } else {
        Err(Error::CorruptBlock {
            cid: cid.to_string(),
        })
    }
}

/// Read an unsigned LEB128 varint. `None` means the input ended before the first byte.
fn read_varint<R: Read>(reader: &mut R) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    for i in 0..10 {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return if i == 0 {
                    Ok(None)
                } else {
                    Err(Error::Truncated("varint".to_string()))
                };
            }
            Err(e) => return Err(e.into()),
        }

        value |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(Error::Car("varint longer than 10 bytes".to_string()))
}

fn read_section<R: Read>(reader: &mut R, len: u64, what: &str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Truncated(format!("{what} of {len} bytes"))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(buf)
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    //! Container builders for tests.

    use super::*;
    use crate::cbor::test_support::{encode, link, map};
    use ciborium::value::Value;

    pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    pub fn encode_car(roots: &[Cid], blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
        let header = encode(&map(vec![
            ("version", Value::Integer(1.into())),
            ("roots", Value::Array(roots.iter().map(link).collect())),
        ]));

        let mut out = Vec::new();
        write_varint(&mut out, header.len() as u64);
        out.extend(header);

        for (cid, data) in blocks {
            let cid_bytes = cid.to_bytes();
            write_varint(&mut out, (cid_bytes.len() + data.len()) as u64);
            out.extend(cid_bytes);
            out.extend(data);
        }
        out
    }
}
