//! Versioned byte envelope for cache entries.
//!
//! Layout:
//!
//! ```text
//! MAGIC (2) | format version (1) | registration table len (2, BE) | table | tag (1) | JSON payload
//! ```
//!
//! The registration table is reserved and currently always empty; readers skip
//! it. Bytes that do not start with `MAGIC` were written before the envelope
//! existed and are read as version 0, a bare JSON `RawMatrix`.

use serde::{Deserialize, Serialize};

use super::{CacheEntry, RawMatrix, ValuesList};
use crate::Error;

const MAGIC: [u8; 2] = [0xC4, 0xE7];
pub const FORMAT_VERSION: u8 = 1;

const TAG_MATRIX: u8 = 1;
const TAG_REFERENCE: u8 = 2;
const TAG_VALUES_LIST: u8 = 3;

#[derive(Serialize, Deserialize)]
struct ReferencePayload {
    reference_key: String,
}

/// Serialize an entry into the current envelope format.
pub fn encode(entry: &CacheEntry) -> Result<Vec<u8>, Error> {
    let (tag, payload) = match entry {
        CacheEntry::Matrix(matrix) => (TAG_MATRIX, serde_json::to_vec(matrix)?),
        CacheEntry::Reference { reference_key } => {
            (TAG_REFERENCE, serde_json::to_vec(&ReferencePayload { reference_key: reference_key.clone() })?)
        }
        CacheEntry::ValuesList(list) => (TAG_VALUES_LIST, serde_json::to_vec(list)?),
    };

    let mut out = Vec::with_capacity(payload.len() + 6);
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&0u16.to_be_bytes());
    out.push(tag);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Deserialize the bytes stored at `key`.
///
/// # Errors
///
/// `UnknownTypeTag` for a tag this build does not know and `Decode` for a
/// truncated envelope, an unsupported format version or a malformed payload.
pub fn decode(key: &str, bytes: &[u8]) -> Result<CacheEntry, Error> {
    if !bytes.starts_with(&MAGIC) {
        let matrix: RawMatrix = serde_json::from_slice(bytes)
            .map_err(|e| Error::Decode(format!("legacy entry at {key}: {e}")))?;
        return Ok(CacheEntry::Matrix(matrix));
    }

    let truncated = || Error::Decode(format!("truncated envelope at {key}"));

    let version = *bytes.get(2).ok_or_else(truncated)?;
    if version == 0 || version > FORMAT_VERSION {
        return Err(Error::Decode(format!("unsupported format version {version} at {key}")));
    }

    let table_len = bytes.get(3..5).ok_or_else(truncated)?;
    let table_len = u16::from_be_bytes([table_len[0], table_len[1]]) as usize;
    let tag_pos = 5 + table_len;
    let tag = *bytes.get(tag_pos).ok_or_else(truncated)?;
    let payload = &bytes[tag_pos + 1..];

    match tag {
        TAG_MATRIX => Ok(CacheEntry::Matrix(serde_json::from_slice(payload)?)),
        TAG_REFERENCE => {
            let reference: ReferencePayload = serde_json::from_slice(payload)?;
            Ok(CacheEntry::Reference { reference_key: reference.reference_key })
        }
        TAG_VALUES_LIST => Ok(CacheEntry::ValuesList(serde_json::from_slice::<ValuesList>(payload)?)),
        other => Err(Error::UnknownTypeTag { key: key.to_string(), tag: other }),
    }
}
