//! Signed-chain extension: layers a *signature pool* over a persistent
//! data shard. Every committed data object gets a paired hash-object entry
//! in the signature pool, signed and chained to the previous signature so
//! a client holding only the public key can verify the whole history
//! without trusting this node.
//!
//! The signature pool is itself a `DeltaMap<String, Object>` exactly like
//! a plain shard's map, and reuses the same `DeltaLog` machinery for its
//! `signature.log`, just rooted at its own subdirectory so its version
//! space and snapshot files never collide with the data shard's.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::delta_map::DeltaMap;
use crate::error::{CResult, Error};
use crate::object::{Object, INVALID_VERSION};
use crate::persist::DeltaLog;
use crate::store::{Store, StoreOptions};

/// One entry of the signature log: a hash object, the signature covering
/// it chained to the previous entry, and that predecessor's own
/// signature-pool version.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedLogEntry {
    pub hash_object: Object,
    pub signature: Vec<u8>,
    pub previous_signed_version: i64,
}

impl SignedLogEntry {
    /// Encodes as `<canonical hash_object> u32 signature_length u8[]
    /// signature i64 previous_signed_version`. `hash_object` is always
    /// encoded without evaluation-mode `message_id`, since it is a
    /// server-internal derived object, not a client-submitted one.
    fn encode(&self) -> Vec<u8> {
        let hash_bytes = self.hash_object.to_canonical_bytes(false);
        let mut buf = BytesMut::with_capacity(hash_bytes.len() + 4 + self.signature.len() + 8);
        buf.put_slice(&hash_bytes);
        buf.put_u32_le(self.signature.len() as u32);
        buf.put_slice(&self.signature);
        buf.put_i64_le(self.previous_signed_version);
        buf.to_vec()
    }

    fn decode(bytes: &[u8]) -> CResult<Self> {
        // `hash_object` has no fixed width (key/blob are variable-length),
        // so it is decoded first and the rest of the buffer consumed after.
        let hash_object = Object::from_canonical_bytes(bytes, false)?;
        let consumed = hash_object.to_canonical_bytes(false).len();
        let mut rest = Bytes::copy_from_slice(&bytes[consumed..]);
        if rest.remaining() < 4 {
            return Err(Error::CorruptDelta("signed log entry missing signature length".into()));
        }
        let sig_len = rest.get_u32_le() as usize;
        if rest.remaining() < sig_len + 8 {
            return Err(Error::CorruptDelta("signed log entry truncated".into()));
        }
        let signature = rest.copy_to_bytes(sig_len).to_vec();
        let previous_signed_version = rest.get_i64_le();
        Ok(Self { hash_object, signature, previous_signed_version })
    }
}

/// Persisted as a sidecar next to `signature.log`: which signature-pool
/// version signs a given (key, data version) pair, so `get_signature`
/// doesn't need to linear-scan the whole chain. The public interface is
/// keyed by data version, the log itself by signature version — this is
/// the local index bridging the two.
struct SignedIndex {
    file: std::fs::File,
    by_data_version: std::collections::HashMap<(String, i64), i64>,
}

impl SignedIndex {
    fn open(dir: &Path) -> CResult<Self> {
        use std::io::Read;
        let path = dir.join("sig_index");
        let mut file =
            std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let mut by_data_version = std::collections::HashMap::new();
        let mut offset = 0;
        while offset + 4 <= bytes.len() {
            let key_len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + key_len + 16 > bytes.len() {
                log::error!("sig_index: truncating incomplete trailing record");
                file.set_len(offset.saturating_sub(4) as u64)?;
                break;
            }
            let key = String::from_utf8_lossy(&bytes[offset..offset + key_len]).into_owned();
            offset += key_len;
            let data_version = i64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
            offset += 8;
            let sig_version = i64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
            offset += 8;
            by_data_version.insert((key, data_version), sig_version);
        }
        file.seek_to_end()?;
        Ok(Self { file, by_data_version })
    }

    fn record(&mut self, key: &str, data_version: i64, sig_version: i64) -> CResult<()> {
        use std::io::Write;
        let key_bytes = key.as_bytes();
        let mut buf = BytesMut::with_capacity(4 + key_bytes.len() + 16);
        buf.put_u32_le(key_bytes.len() as u32);
        buf.put_slice(key_bytes);
        buf.put_i64_le(data_version);
        buf.put_i64_le(sig_version);
        self.file.write_all(&buf)?;
        self.file.flush()?;
        self.by_data_version.insert((key.to_string(), data_version), sig_version);
        Ok(())
    }
}

trait SeekToEnd {
    fn seek_to_end(&mut self) -> std::io::Result<u64>;
}

impl SeekToEnd for std::fs::File {
    fn seek_to_end(&mut self) -> std::io::Result<u64> {
        use std::io::{Seek, SeekFrom};
        self.seek(SeekFrom::End(0))
    }
}

/// A persistent data shard paired with its signature pool. Exposes the
/// same data-path surface as `Store` (construction wires a plain `Store`
/// underneath) plus the signature accessors.
pub struct SignedStore {
    data: Store,
    signature_pool: Mutex<DeltaMap<String, Object>>,
    sig_log: Mutex<DeltaLog>,
    sig_index: Mutex<SignedIndex>,
    last_signature: Mutex<Vec<u8>>,
    last_signed_version: Mutex<i64>,
    signing_key: SigningKey,
}

impl SignedStore {
    /// `dir` roots both the data shard (`dir/data`) and the signature
    /// pool (`dir/signed`), kept in separate subdirectories so their
    /// independent version spaces never collide on a shared `snapshot.N`
    /// file name.
    pub fn open(dir: impl AsRef<Path>, signing_key: SigningKey, options: StoreOptions) -> CResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let data_options = StoreOptions { dir: Some(dir.join("data")), ..options };
        let data = Store::open(data_options)?;

        let signed_dir: PathBuf = dir.join("signed");
        let mut sig_log = DeltaLog::open_named(&signed_dir, "signature.log")?;
        let sig_index = SignedIndex::open(&signed_dir)?;

        let mut signature_pool = DeltaMap::new(Object::invalid(""));
        let mut last_signature = Vec::new();
        let mut last_signed_version = INVALID_VERSION;
        for version in sig_log.versions() {
            let bytes = sig_log.read_delta(version)?;
            let entry = SignedLogEntry::decode(&bytes)?;
            signature_pool.put(entry.hash_object.key.clone(), entry.hash_object.clone());
            last_signature = entry.signature;
            last_signed_version = version;
        }

        Ok(Self {
            data,
            signature_pool: Mutex::new(signature_pool),
            sig_log: Mutex::new(sig_log),
            sig_index: Mutex::new(sig_index),
            last_signature: Mutex::new(last_signature),
            last_signed_version: Mutex::new(last_signed_version),
            signing_key,
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Commits `object` to the data shard, then signs and chains it. The
    /// data commit and the signature-pool update are not atomic with each
    /// other in this single-process model — a crash between them leaves a
    /// committed data version with no signature yet, which is visible to a
    /// verifying client as "signature not found", not as a forged or
    /// skipped chain link.
    pub async fn put(&self, object: Object) -> CResult<(i64, u64)> {
        let key = object.key.clone();
        let committed = self.data.put(object).await?;
        let data_object = self.data.get(&key, Some(committed.0), false).await?;
        self.sign_commit(data_object)?;
        Ok(committed)
    }

    pub async fn remove(&self, key: impl Into<String>) -> CResult<(i64, u64)> {
        let key = key.into();
        let committed = self.data.remove(key.clone()).await?;
        let data_object = self.data.get(&key, Some(committed.0), false).await?;
        self.sign_commit(data_object)?;
        Ok(committed)
    }

    /// Permitted but a no-op for signing purposes: a triggered put has no
    /// durable commit to sign over, so the signature pool is left
    /// untouched and a warning logged.
    pub async fn trigger_put(&self, object: Object) -> CResult<(i64, u64)> {
        log::warn!("trigger_put on a signed shard does not update the signature pool (key={})", object.key);
        self.data.trigger_put(object).await
    }

    pub async fn get(&self, key: &str, version: Option<i64>, stable: bool) -> CResult<Object> {
        self.data.get(key, version, stable).await
    }

    /// `data_object` is the just-committed object re-read at its own
    /// version (not the live current value), so the hash is taken over
    /// exactly the committed bytes even if a later write to the same key
    /// races with this call.
    fn sign_commit(&self, data_object: Object) -> CResult<()> {
        let data_version = data_object.version;
        let data_bytes = data_object.to_canonical_bytes(self.data.evaluation_mode());
        let hash = Sha256::digest(&data_bytes).to_vec();

        let mut signature_pool = self.signature_pool.lock().unwrap();
        let actual_prev = signature_pool.get(&data_object.key).version;
        let prior_version = self
            .sig_log
            .lock()
            .unwrap()
            .latest_version()
            .unwrap_or(INVALID_VERSION);

        let mut hash_object = Object::new(data_object.key.clone(), hash);
        hash_object.previous_version = prior_version;
        hash_object.previous_version_by_key = actual_prev;
        let sig_version = prior_version + 1;
        hash_object.version = sig_version;
        hash_object.timestamp_us = data_object.timestamp_us;

        signature_pool.put(hash_object.key.clone(), hash_object.clone());

        let mut last_signature = self.last_signature.lock().unwrap();
        let previous_signature = last_signature.clone();
        let to_sign = {
            let mut buf = hash_object.to_canonical_bytes(false);
            buf.extend_from_slice(&previous_signature);
            buf
        };
        let signature = self.signing_key.sign(&to_sign).to_bytes().to_vec();

        let entry = SignedLogEntry {
            hash_object: hash_object.clone(),
            signature: signature.clone(),
            previous_signed_version: prior_version,
        };
        self.sig_log.lock().unwrap().append(sig_version, &entry.encode())?;
        self.sig_index
            .lock()
            .unwrap()
            .record(&hash_object.key, data_version, sig_version)?;

        *last_signature = signature;
        *self.last_signed_version.lock().unwrap() = sig_version;
        Ok(())
    }

    /// `get_signature(key, version) -> (signature, previous_signed_version)`.
    pub fn get_signature(&self, key: &str, data_version: i64) -> CResult<(Vec<u8>, i64)> {
        let sig_version = *self
            .sig_index
            .lock()
            .unwrap()
            .by_data_version
            .get(&(key.to_string(), data_version))
            .ok_or(Error::VersionTruncated)?;
        self.get_signature_by_version(sig_version)
    }

    /// `get_signature_by_version(sig_version)`: direct lookup by the
    /// signature pool's own version.
    pub fn get_signature_by_version(&self, sig_version: i64) -> CResult<(Vec<u8>, i64)> {
        let bytes = self.sig_log.lock().unwrap().read_delta(sig_version)?;
        let entry = SignedLogEntry::decode(&bytes)?;
        Ok((entry.signature, entry.previous_signed_version))
    }

    /// The hash object stored at signature-pool version `sig_version`.
    pub fn get_hash_object(&self, sig_version: i64) -> CResult<Object> {
        let bytes = self.sig_log.lock().unwrap().read_delta(sig_version)?;
        Ok(SignedLogEntry::decode(&bytes)?.hash_object)
    }
}

/// Client-side verification: confirms
/// `SHA256(canonical(data)) == hash_object.blob`, then
/// `Verify(pk, canonical(hash_object) || previous_signature, signature)`.
/// `previous_signature` is empty at genesis, since there is no prior
/// signature to chain the first entry to.
pub fn verify(
    verifying_key: &VerifyingKey,
    data_object: &Object,
    data_evaluation_mode: bool,
    hash_object: &Object,
    signature: &[u8],
    previous_signature: &[u8],
) -> CResult<()> {
    let expected_hash = Sha256::digest(data_object.to_canonical_bytes(data_evaluation_mode)).to_vec();
    if expected_hash != hash_object.blob {
        return Err(Error::SignatureVerificationFailed);
    }

    let mut to_verify = hash_object.to_canonical_bytes(false);
    to_verify.extend_from_slice(previous_signature);

    let sig_bytes: [u8; 64] =
        signature.try_into().map_err(|_| Error::SignatureVerificationFailed)?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(&to_verify, &signature)
        .map_err(|_| Error::SignatureVerificationFailed)
}
