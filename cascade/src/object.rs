//! The versioned object model and its canonical wire encoding. The
//! canonical bytes are what gets hashed for the signed chain and what a
//! verifying client reconstructs independently, so the format here must
//! match bit-for-bit across implementations: all integers little-endian,
//! fixed field order, no padding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Sentinel denoting "unset / invalid / current" for a version number.
pub const INVALID_VERSION: i64 = -1;

/// A single versioned object: an opaque blob addressed by a string key,
/// carrying the version/timestamp assigned at commit and the two
/// predecessor links (one for the whole shard's commit order, one for
/// this key's own history).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub key: String,
    pub blob: Vec<u8>,
    pub version: i64,
    pub timestamp_us: u64,
    pub previous_version: i64,
    pub previous_version_by_key: i64,
    pub message_id: Option<u64>,

    /// Marks this object as a tombstone. Distinct from
    /// `version == INVALID_VERSION`: a removed key still occupies a real
    /// slot in the shard's version chain (it was committed, and has a
    /// genuine `version`/`previous_version`), whereas `INVALID_VERSION`
    /// alone means "no object has ever been committed for this key". Not
    /// part of the canonical wire encoding — a purely local bookkeeping
    /// bit, defaulted to `false` on decode.
    #[serde(default)]
    pub tombstone: bool,
}

impl Object {
    /// Constructs an object for a fresh client put: not yet assigned a
    /// version, timestamp, or predecessor links — those are filled in by
    /// the shard once the write is ordered and committed.
    pub fn new(key: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            blob,
            version: INVALID_VERSION,
            timestamp_us: 0,
            previous_version: INVALID_VERSION,
            previous_version_by_key: INVALID_VERSION,
            message_id: None,
            tombstone: false,
        }
    }

    /// The pool-defined "invalid value" sentinel for `key`: an object with
    /// `version == INVALID_VERSION`, marked as a tombstone. Used as
    /// `DeltaMap`'s sentinel (a key that was never written) and, with its
    /// `version` overwritten to a real commit, as the value stored for a
    /// key that was explicitly removed.
    pub fn invalid(key: impl Into<String>) -> Self {
        let mut obj = Self::new(key, Vec::new());
        obj.tombstone = true;
        obj
    }

    pub fn is_invalid(&self) -> bool {
        self.tombstone || self.version == INVALID_VERSION
    }

    /// Encodes this object using the fixed canonical layout. `message_id`
    /// is only written when `evaluation_mode` is set, so ordinary
    /// deployments never pay for a field they don't use.
    pub fn to_canonical_bytes(&self, evaluation_mode: bool) -> Vec<u8> {
        let key_bytes = self.key.as_bytes();
        let mut cap = 8 + 8 + 8 + 8 + 4 + key_bytes.len() + 8 + self.blob.len();
        if evaluation_mode {
            cap += 8;
        }
        let mut buf = BytesMut::with_capacity(cap);

        if evaluation_mode {
            buf.put_u64_le(self.message_id.unwrap_or(0));
        }
        buf.put_i64_le(self.version);
        buf.put_u64_le(self.timestamp_us);
        buf.put_i64_le(self.previous_version);
        buf.put_i64_le(self.previous_version_by_key);
        buf.put_u32_le(key_bytes.len() as u32);
        buf.put_slice(key_bytes);
        buf.put_u64_le(self.blob.len() as u64);
        buf.put_slice(&self.blob);

        buf.to_vec()
    }

    /// Decodes an object previously produced by `to_canonical_bytes`.
    pub fn from_canonical_bytes(bytes: &[u8], evaluation_mode: bool) -> CResult<Self> {
        let mut buf = Bytes::copy_from_slice(bytes);

        let message_id = if evaluation_mode {
            Some(take_u64(&mut buf)?)
        } else {
            None
        };
        let version = take_i64(&mut buf)?;
        let timestamp_us = take_u64(&mut buf)?;
        let previous_version = take_i64(&mut buf)?;
        let previous_version_by_key = take_i64(&mut buf)?;

        let key_len = take_u32(&mut buf)? as usize;
        if buf.remaining() < key_len {
            return Err(Error::CorruptDelta("key length exceeds remaining bytes".into()));
        }
        let key_bytes = buf.copy_to_bytes(key_len);
        let key = String::from_utf8(key_bytes.to_vec())
            .map_err(|e| Error::CorruptDelta(format!("key is not valid utf-8: {}", e)))?;

        let blob_len = take_u64(&mut buf)? as usize;
        if buf.remaining() < blob_len {
            return Err(Error::CorruptDelta("blob length exceeds remaining bytes".into()));
        }
        let blob = buf.copy_to_bytes(blob_len).to_vec();

        Ok(Object {
            key,
            blob,
            version,
            timestamp_us,
            previous_version,
            previous_version_by_key,
            message_id,
            tombstone: false,
        })
    }
}

fn take_u64(buf: &mut Bytes) -> CResult<u64> {
    if buf.remaining() < 8 {
        return Err(Error::CorruptDelta("buffer truncated reading u64".into()));
    }
    Ok(buf.get_u64_le())
}

fn take_i64(buf: &mut Bytes) -> CResult<i64> {
    if buf.remaining() < 8 {
        return Err(Error::CorruptDelta("buffer truncated reading i64".into()));
    }
    Ok(buf.get_i64_le())
}

fn take_u32(buf: &mut Bytes) -> CResult<u32> {
    if buf.remaining() < 4 {
        return Err(Error::CorruptDelta("buffer truncated reading u32".into()));
    }
    Ok(buf.get_u32_le())
}
