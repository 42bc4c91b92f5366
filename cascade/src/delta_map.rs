//! `DeltaMap`: an ordered key→value map with an appendable delta log. The
//! invalid-value sentinel is carried as an owned field rather than a
//! static pointer, so construction needs no global initialization order.
//!
//! Keys and values must be `Codable`: encodable/decodable to the exact byte
//! sequence persisted in a delta, so that `DeltaMap<String, Object>`
//! deltas are the on-disk wire format verbatim.

use std::collections::BTreeMap;

use crate::error::{CResult, Error};
use crate::object::Object;

/// Types that can appear as a `DeltaMap` key or value. The encoding must be
/// self-delimiting (the decoder consumes exactly the bytes `encode` wrote)
/// so deltas can be read back-to-back from a single buffer.
pub trait Codable: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> CResult<(Self, usize)>;
}

impl Codable for String {
    fn encode(&self) -> Vec<u8> {
        let bytes = self.as_bytes();
        let mut out = Vec::with_capacity(4 + bytes.len());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
        out
    }

    fn decode(bytes: &[u8]) -> CResult<(Self, usize)> {
        if bytes.len() < 4 {
            return Err(Error::CorruptDelta("string length prefix truncated".into()));
        }
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if bytes.len() < 4 + len {
            return Err(Error::CorruptDelta("string bytes exceed remaining buffer".into()));
        }
        let s = String::from_utf8(bytes[4..4 + len].to_vec())
            .map_err(|e| Error::CorruptDelta(format!("invalid utf-8 in delta key: {}", e)))?;
        Ok((s, 4 + len))
    }
}

impl Codable for Object {
    /// Internal delta-log persistence always carries `message_id` (the
    /// extra 8 bytes are harmless) plus a trailing tombstone byte that
    /// `to_canonical_bytes` deliberately omits — that method also produces
    /// the signed chain's hash input, which must depend only on the fields
    /// a client can observe, not on this store's internal bookkeeping bit.
    /// Without the trailing byte a removed key would decode back as a live
    /// object on the next delta replay, since its version alone can't be
    /// told apart from an ordinary commit.
    fn encode(&self) -> Vec<u8> {
        let mut bytes = self.to_canonical_bytes(true);
        bytes.push(self.tombstone as u8);
        bytes
    }

    fn decode(bytes: &[u8]) -> CResult<(Self, usize)> {
        let mut obj = Object::from_canonical_bytes(bytes, true)?;
        let consumed = obj_encoded_len(&obj);
        if bytes.len() < consumed {
            return Err(Error::CorruptDelta("object delta missing tombstone byte".into()));
        }
        obj.tombstone = bytes[consumed - 1] != 0;
        Ok((obj, consumed))
    }
}

fn obj_encoded_len(obj: &Object) -> usize {
    8 + 8 + 8 + 8 + 8 + 4 + obj.key.as_bytes().len() + 8 + obj.blob.len() + 1
}

/// Ordered key→value map with a delta journal of keys changed since the
/// last checkpoint.
pub struct DeltaMap<K: Ord + Clone + Codable, V: Clone + PartialEq + Codable> {
    current_map: BTreeMap<K, V>,
    invalid_value: V,
    pending_delta: Vec<K>,
}

impl<K: Ord + Clone + Codable, V: Clone + PartialEq + Codable> DeltaMap<K, V> {
    pub fn new(invalid_value: V) -> Self {
        Self { current_map: BTreeMap::new(), invalid_value, pending_delta: Vec::new() }
    }

    /// Alternate constructor taking a deserialization-manager handle. The
    /// handle is unused: constructing a `DeltaMap` doesn't need to touch
    /// any deserialization registry, but the parameter is kept so call
    /// sites that plumb one through don't need a separate code path.
    pub fn create(_deserialization_marker: Option<&()>, invalid_value: V) -> Self {
        Self::new(invalid_value)
    }

    /// Replaces the entry for `key`, recording it in the pending delta.
    pub fn put(&mut self, key: K, value: V) {
        self.pending_delta.push(key.clone());
        self.apply_put(key, value);
    }

    /// Writes the sentinel over `key`'s entry (a tombstone), unless the key
    /// is already absent or already a tombstone, in which case this is a
    /// logged no-op.
    pub fn remove(&mut self, key: K) {
        match self.current_map.get(&key) {
            None => {
                log::warn!("DeltaMap failed to remove a nonexistent key");
            }
            Some(v) if *v == self.invalid_value => {
                log::warn!("DeltaMap remove failed; key has been removed already");
            }
            Some(_) => {
                self.pending_delta.push(key.clone());
                let sentinel = self.invalid_value.clone();
                self.apply_put(key, sentinel);
            }
        }
    }

    /// Returns the current value for `key`, or a clone of the invalid-value
    /// sentinel if absent.
    pub fn get(&self, key: &K) -> V {
        self.current_map.get(key).cloned().unwrap_or_else(|| self.invalid_value.clone())
    }

    /// An immutable view over the current state of the map.
    pub fn snapshot(&self) -> &BTreeMap<K, V> {
        &self.current_map
    }

    pub fn invalid_value(&self) -> &V {
        &self.invalid_value
    }

    /// Serialized byte count of the pending delta; 0 when empty, since an
    /// empty delta carries no information and is never emitted.
    pub fn current_delta_size(&self) -> usize {
        if self.pending_delta.is_empty() {
            return 0;
        }
        let mut size = 8; // u64 count
        for key in &self.pending_delta {
            size += key.encode().len();
            size += self.get(key).encode().len();
        }
        size
    }

    /// Serializes the pending delta into `buf` (which must be at least
    /// `current_delta_size()` bytes), then clears the pending delta.
    /// Returns the number of bytes written (0 if there was nothing
    /// pending). A too-small buffer means a caller didn't call
    /// `current_delta_size()` first; that's a bug in the caller, reported
    /// as `Error::Internal` rather than aborting the process.
    pub fn current_delta_to_bytes(&mut self, buf: &mut [u8]) -> CResult<usize> {
        let needed = self.current_delta_size();
        if needed == 0 {
            return Ok(0);
        }
        if needed > buf.len() {
            log::error!(
                "DeltaMap::current_delta_to_bytes needs {} bytes but only {} were given",
                needed,
                buf.len()
            );
            return Err(Error::Internal(format!(
                "delta buffer too small: need {} bytes, have {}",
                needed,
                buf.len()
            )));
        }

        let mut offset = 0usize;
        buf[offset..offset + 8].copy_from_slice(&(self.pending_delta.len() as u64).to_le_bytes());
        offset += 8;
        for key in std::mem::take(&mut self.pending_delta) {
            let kb = key.encode();
            buf[offset..offset + kb.len()].copy_from_slice(&kb);
            offset += kb.len();

            let v = self.current_map.get(&key).cloned().unwrap_or_else(|| self.invalid_value.clone());
            let vb = v.encode();
            buf[offset..offset + vb.len()].copy_from_slice(&vb);
            offset += vb.len();
        }
        Ok(offset)
    }

    /// Convenience wrapper that allocates exactly the needed buffer.
    pub fn current_delta_to_vec(&mut self) -> CResult<Vec<u8>> {
        let needed = self.current_delta_size();
        let mut buf = vec![0u8; needed];
        let written = self.current_delta_to_bytes(&mut buf)?;
        debug_assert_eq!(written, needed);
        Ok(buf)
    }

    /// Serializes the entire current map (not just the pending delta) in
    /// the same `[count][(key,value)*]` shape, so it can be replayed with
    /// `apply_delta` exactly like an ordinary delta. Used by the
    /// persistence layer to write periodic snapshots, so recovery can
    /// start from the latest snapshot instead of replaying the full log.
    pub fn full_dump(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.current_map.len() as u64).to_le_bytes());
        for (key, value) in &self.current_map {
            out.extend_from_slice(&key.encode());
            out.extend_from_slice(&value.encode());
        }
        out
    }

    /// Applies a previously-serialized delta. Never touches `pending_delta`
    /// — replaying history must not itself produce new deltas.
    pub fn apply_delta(&mut self, bytes: &[u8]) -> CResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.len() < 8 {
            return Err(Error::CorruptDelta("delta count prefix truncated".into()));
        }
        let count = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let mut offset = 8usize;
        for _ in 0..count {
            if offset >= bytes.len() {
                return Err(Error::CorruptDelta("delta truncated before declared count".into()));
            }
            let (key, key_len) = K::decode(&bytes[offset..])?;
            offset += key_len;
            if offset > bytes.len() {
                return Err(Error::CorruptDelta("delta key length exceeds remaining bytes".into()));
            }
            let (value, value_len) = V::decode(&bytes[offset..])?;
            offset += value_len;
            if offset > bytes.len() {
                return Err(Error::CorruptDelta("delta value length exceeds remaining bytes".into()));
            }
            self.apply_put(key, value);
        }
        Ok(())
    }

    fn apply_put(&mut self, key: K, value: V) {
        self.current_map.insert(key, value);
    }
}
