//! On-disk delta-log persistence: an append-only file with an `fs4`
//! exclusive lock taken for the process lifetime, a scan-to-rebuild-index
//! recovery pass on open, and truncate-on-incomplete-write to drop a torn
//! tail left by a crash mid-append.
//!
//! A delta entry has no key of its own — it is keyed by the shard version
//! that produced it: `[i64 version][u64 length][delta bytes]`, repeated to
//! EOF. A side-by-side `snapshot.<version>` file may hold a
//! `DeltaMap::full_dump` so startup doesn't replay the whole history from
//! version 0.

use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::delta_map::{Codable, DeltaMap};
use crate::error::{CResult, Error};

/// One entry in the in-memory index built by scanning `delta.log` on open:
/// the version it carries, and where its payload lives in the file.
#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    version: i64,
    offset: u64,
    length: u64,
}

/// An append-only log of per-version deltas, plus the latest snapshot (if
/// any) that bounds how far back a cold start must replay.
pub struct DeltaLog {
    dir: PathBuf,
    file: std::fs::File,
    index: Vec<IndexEntry>,
    snapshot_version: Option<i64>,
}

impl DeltaLog {
    /// Opens (creating if absent) the delta log rooted at `dir`, takes an
    /// exclusive lock on `dir/delta.log`, and rebuilds the in-memory index
    /// by scanning it from the start.
    pub fn open(dir: impl AsRef<Path>) -> CResult<Self> {
        Self::open_named(dir, "delta.log")
    }

    /// Like `open`, but under a caller-chosen file name. Used by the signed
    /// chain extension to keep its `signature.log` alongside but separate
    /// from the data shard's `delta.log`, reusing the same
    /// append/index/recovery machinery.
    pub fn open_named(dir: impl AsRef<Path>, file_name: &str) -> CResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let log_path = dir.join(file_name);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;
        file.try_lock_exclusive()?;

        let snapshot_version = latest_snapshot_version(&dir)?;
        let mut log = Self { dir, file, index: Vec::new(), snapshot_version };
        log.rebuild_index()?;
        Ok(log)
    }

    fn rebuild_index(&mut self) -> CResult<()> {
        let file_len = self.file.metadata()?.len();
        let mut pos = self.file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; 16];

        while pos < file_len {
            let mut attempt = || -> Result<(i64, u64), std::io::Error> {
                self.file.read_exact(&mut header)?;
                let version = i64::from_le_bytes(header[0..8].try_into().unwrap());
                let length = u64::from_le_bytes(header[8..16].try_into().unwrap());
                if pos + 16 + length > file_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "delta payload extends beyond end of file",
                    ));
                }
                self.file.seek(SeekFrom::Current(length as i64))?;
                Ok((version, length))
            };

            match attempt() {
                Ok((version, length)) => {
                    self.index.push(IndexEntry { version, offset: pos + 16, length });
                    pos = pos + 16 + length;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!("delta.log: incomplete entry at offset {}, truncating", pos);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Appends a delta for `version`. Deltas must be appended in strictly
    /// increasing version order; callers (the replicated store) only ever
    /// append the version they just assigned, so this is enforced with a
    /// debug assertion rather than a recoverable error.
    pub fn append(&mut self, version: i64, delta: &[u8]) -> CResult<()> {
        debug_assert!(self.index.last().map_or(true, |e| version > e.version));

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(16 + delta.len(), &mut self.file);
        w.write_all(&version.to_le_bytes())?;
        w.write_all(&(delta.len() as u64).to_le_bytes())?;
        w.write_all(delta)?;
        w.flush()?;

        self.index.push(IndexEntry { version, offset: pos + 16, length: delta.len() as u64 });
        Ok(())
    }

    /// Reads back the exact bytes appended for `version`, or
    /// `Error::VersionTruncated` if no longer retained (e.g. compacted away
    /// by a snapshot).
    pub fn read_delta(&mut self, version: i64) -> CResult<Vec<u8>> {
        let entry = self
            .index
            .binary_search_by_key(&version, |e| e.version)
            .ok()
            .map(|i| self.index[i])
            .ok_or(Error::VersionTruncated)?;

        let mut buf = vec![0u8; entry.length as usize];
        self.file.seek(SeekFrom::Start(entry.offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// The oldest version retained in the log, if any.
    pub fn oldest_version(&self) -> Option<i64> {
        self.index.first().map(|e| e.version)
    }

    /// The newest version appended, if any.
    pub fn latest_version(&self) -> Option<i64> {
        self.index.last().map(|e| e.version)
    }

    /// Every version currently retained, in ascending order.
    pub fn versions(&self) -> Vec<i64> {
        self.index.iter().map(|e| e.version).collect()
    }

    /// Writes a full snapshot of `map` tagged with `version`, so a future
    /// `reconstruct` doesn't need to replay anything before it. Atomic via
    /// write-to-temp-then-rename.
    pub fn write_snapshot<K, V>(&mut self, version: i64, map: &DeltaMap<K, V>) -> CResult<()>
    where
        K: Ord + Clone + Codable,
        V: Clone + PartialEq + Codable,
    {
        let final_path = self.dir.join(format!("snapshot.{}", version));
        let tmp_path = self.dir.join(format!("snapshot.{}.tmp", version));
        std::fs::write(&tmp_path, map.full_dump())?;
        std::fs::rename(&tmp_path, &final_path)?;
        self.snapshot_version = Some(version);
        Ok(())
    }

    /// Rebuilds a `DeltaMap` by loading the latest snapshot (if any) and
    /// replaying every delta appended after it.
    pub fn reconstruct<K, V>(&mut self, invalid_value: V) -> CResult<DeltaMap<K, V>>
    where
        K: Ord + Clone + Codable,
        V: Clone + PartialEq + Codable,
    {
        let mut map = DeltaMap::new(invalid_value);
        let from_version = if let Some(sv) = self.snapshot_version {
            let bytes = std::fs::read(self.dir.join(format!("snapshot.{}", sv)))?;
            map.apply_delta(&bytes)?;
            sv
        } else {
            i64::MIN
        };

        let versions: Vec<i64> = self
            .index
            .iter()
            .map(|e| e.version)
            .filter(|v| *v > from_version)
            .collect();
        for version in versions {
            let bytes = self.read_delta(version)?;
            map.apply_delta(&bytes)?;
        }
        Ok(map)
    }

    /// Like `reconstruct`, but stops folding deltas once `target_version`
    /// is reached, for version-indexed point-in-time reads. Errors with
    /// `Error::VersionTruncated` if `target_version` predates everything
    /// retained (including the latest snapshot).
    pub fn reconstruct_at<K, V>(&mut self, invalid_value: V, target_version: i64) -> CResult<DeltaMap<K, V>>
    where
        K: Ord + Clone + Codable,
        V: Clone + PartialEq + Codable,
    {
        let oldest = self.snapshot_version.or_else(|| self.oldest_version());
        if let Some(oldest) = oldest {
            if target_version < oldest {
                return Err(Error::VersionTruncated);
            }
        } else {
            return Err(Error::VersionTruncated);
        }

        let mut map = DeltaMap::new(invalid_value);
        let from_version = if let Some(sv) = self.snapshot_version {
            let bytes = std::fs::read(self.dir.join(format!("snapshot.{}", sv)))?;
            map.apply_delta(&bytes)?;
            sv
        } else {
            i64::MIN
        };

        let versions: Vec<i64> = self
            .index
            .iter()
            .map(|e| e.version)
            .filter(|v| *v > from_version && *v <= target_version)
            .collect();
        for version in versions {
            let bytes = self.read_delta(version)?;
            map.apply_delta(&bytes)?;
        }
        Ok(map)
    }
}

fn latest_snapshot_version(dir: &Path) -> CResult<Option<i64>> {
    let mut best: Option<i64> = None;
    if !dir.exists() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix("snapshot.") {
            if suffix.ends_with(".tmp") {
                continue;
            }
            if let Ok(v) = suffix.parse::<i64>() {
                best = Some(best.map_or(v, |b: i64| b.max(v)));
            }
        }
    }
    Ok(best)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_then_read_delta_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DeltaLog::open(dir.path()).unwrap();
        log.append(1, b"first").unwrap();
        log.append(2, b"second").unwrap();

        assert_eq!(log.read_delta(1).unwrap(), b"first");
        assert_eq!(log.read_delta(2).unwrap(), b"second");
        assert_eq!(log.oldest_version(), Some(1));
        assert_eq!(log.latest_version(), Some(2));
    }

    #[test]
    fn reopen_rebuilds_index_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = DeltaLog::open(dir.path()).unwrap();
            log.append(1, b"a").unwrap();
            log.append(2, b"bb").unwrap();
        }
        let mut log = DeltaLog::open(dir.path()).unwrap();
        assert_eq!(log.read_delta(2).unwrap(), b"bb");
    }

    #[test]
    fn read_of_unknown_version_is_truncated_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DeltaLog::open(dir.path()).unwrap();
        log.append(5, b"x").unwrap();
        assert!(matches!(log.read_delta(1), Err(Error::VersionTruncated)));
    }

    #[test]
    fn torn_tail_write_is_truncated_on_reopen() {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = DeltaLog::open(dir.path()).unwrap();
            log.append(1, b"whole").unwrap();
        }
        // Simulate a crash mid-append: a header announcing more bytes than follow.
        {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .append(true)
                .open(dir.path().join("delta.log"))
                .unwrap();
            f.write_all(&2i64.to_le_bytes()).unwrap();
            f.write_all(&100u64.to_le_bytes()).unwrap();
            f.write_all(b"short").unwrap();
        }

        let mut log = DeltaLog::open(dir.path()).unwrap();
        assert_eq!(log.latest_version(), Some(1));
        assert_eq!(log.read_delta(1).unwrap(), b"whole");
    }

    #[test]
    fn snapshot_bounds_reconstruction() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DeltaLog::open(dir.path()).unwrap();

        let mut map: DeltaMap<String, String> = DeltaMap::new("<tombstone>".to_string());
        map.put("a".into(), "1".into());
        let delta = map.current_delta_to_vec().unwrap();
        log.append(1, &delta).unwrap();

        log.write_snapshot(1, &map).unwrap();

        map.put("b".into(), "2".into());
        let delta = map.current_delta_to_vec().unwrap();
        log.append(2, &delta).unwrap();

        let reconstructed: DeltaMap<String, String> =
            log.reconstruct("<tombstone>".to_string()).unwrap();
        assert_eq!(reconstructed.snapshot(), map.snapshot());
    }

    #[test]
    fn reconstruct_at_stops_at_target_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DeltaLog::open(dir.path()).unwrap();

        let mut map: DeltaMap<String, String> = DeltaMap::new("<tombstone>".to_string());
        map.put("a".into(), "v1".into());
        log.append(1, &map.current_delta_to_vec().unwrap()).unwrap();
        map.put("a".into(), "v2".into());
        log.append(2, &map.current_delta_to_vec().unwrap()).unwrap();

        let at_v1: DeltaMap<String, String> = log.reconstruct_at("<tombstone>".to_string(), 1).unwrap();
        assert_eq!(at_v1.get(&"a".to_string()), "v1");

        let at_v2: DeltaMap<String, String> = log.reconstruct_at("<tombstone>".to_string(), 2).unwrap();
        assert_eq!(at_v2.get(&"a".to_string()), "v2");
    }

    #[test]
    fn reconstruct_at_below_oldest_version_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DeltaLog::open(dir.path()).unwrap();
        let mut map: DeltaMap<String, String> = DeltaMap::new("<tombstone>".to_string());
        map.put("a".into(), "1".into());
        log.append(5, &map.current_delta_to_vec().unwrap()).unwrap();

        let result: CResult<DeltaMap<String, String>> = log.reconstruct_at("<tombstone>".to_string(), 1);
        assert!(matches!(result, Err(Error::VersionTruncated)));
    }

    #[test]
    fn reconstruct_without_snapshot_replays_full_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DeltaLog::open(dir.path()).unwrap();

        let mut map: DeltaMap<String, String> = DeltaMap::new("<tombstone>".to_string());
        for i in 0..5 {
            map.put(format!("k{}", i), format!("v{}", i));
            let delta = map.current_delta_to_vec().unwrap();
            log.append(i as i64, &delta).unwrap();
        }

        let reconstructed: DeltaMap<String, String> =
            log.reconstruct("<tombstone>".to_string()).unwrap();
        assert_eq!(reconstructed.snapshot(), map.snapshot());
    }
}
