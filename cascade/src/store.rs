//! The replicated store core: per-shard state machine that applies ordered
//! puts/removes, maintains the per-key and per-shard version chains, and
//! answers point/size/listing reads at the current version, an explicit
//! version, or a wall-clock timestamp.
//!
//! Every mutating call is submitted to a `LocalOrderedDelivery`
//! (`crate::ordering`), and the commit logic below runs on its single
//! delivery task, so it never competes with another commit for the
//! exclusive lock. Reads take the shared side of the same `RwLock` and
//! never touch the delivery channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use crate::delta_map::{Codable, DeltaMap};
use crate::error::{CResult, Error};
use crate::object::{Object, INVALID_VERSION};
use crate::ocdpo::{Dispatcher, EmitSink};
use crate::ordering::{LocalOrderedDelivery, OrderedDelivery};
use crate::persist::DeltaLog;

/// How long a stable read waits for `latest_stable_version` to catch up
/// before failing with `Error::NotStable`.
const STABLE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Supplies the commit timestamp. Abstracted so tests can inject a
/// deterministic clock instead of the system clock.
pub trait WallClock: Send + Sync {
    fn now_us(&self) -> u64;
}

pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_us(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_micros() as u64
    }
}

enum Durability {
    Volatile,
    Persistent(std::sync::Mutex<DeltaLog>),
}

struct StoreState {
    map: DeltaMap<String, Object>,
    shard_last_version: i64,
    last_ts: u64,
    /// `(version, timestamp_us)` in commit order, for `get_by_time`. Holds
    /// only as much history as `durability` can itself recover on restart:
    /// for persistent shards this is rebuilt from the delta log, for
    /// volatile shards it lives only as long as the process does.
    commit_log: Vec<(i64, u64)>,
}

enum PutMode {
    Normal,
    /// Bypasses storage entirely; fires OCDPO only.
    Trigger,
    /// Internal: rides the delivery queue to establish a happens-after
    /// point without committing anything or invoking observers. Used by
    /// `multi_get` to linearize a read against concurrent writes.
    Barrier,
}

struct PutCommand {
    object: Object,
    mode: PutMode,
    reply: Option<oneshot::Sender<CResult<(i64, u64)>>>,
}

/// Construction options for a `Store`.
pub struct StoreOptions {
    /// `None` makes the shard volatile: state lives only in memory and
    /// `get` with an explicit version/time always fails with
    /// `Error::VersionTruncated`, since nothing before the current map is
    /// retained.
    pub dir: Option<PathBuf>,
    /// Gates whether `message_id` is carried in the canonical encoding.
    pub evaluation_mode: bool,
    pub clock: Arc<dyn WallClock>,
    /// Invoked after every successful commit; `None` if this shard has no
    /// registered observers.
    pub dispatcher: Option<Arc<Dispatcher>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { dir: None, evaluation_mode: false, clock: Arc::new(SystemWallClock), dispatcher: None }
    }
}

/// A single shard's replicated store.
pub struct Store {
    state: Arc<RwLock<StoreState>>,
    durability: Arc<Durability>,
    next_version: Arc<AtomicI64>,
    latest_stable_version: Arc<AtomicI64>,
    stable_notify: Arc<Notify>,
    delivery: LocalOrderedDelivery<PutCommand>,
    evaluation_mode: bool,
}

impl Store {
    pub fn open(options: StoreOptions) -> CResult<Self> {
        let (map, commit_log, shard_last_version, durability) = match options.dir {
            None => (DeltaMap::new(Object::invalid("")), Vec::new(), INVALID_VERSION, Durability::Volatile),
            Some(dir) => {
                let mut log = DeltaLog::open(&dir)?;
                let map: DeltaMap<String, Object> = log.reconstruct(Object::invalid(""))?;
                let mut commit_log = Vec::new();
                for version in log.versions() {
                    let bytes = log.read_delta(version)?;
                    if let Ok(ts) = single_commit_timestamp(&bytes) {
                        commit_log.push((version, ts));
                    }
                }
                let shard_last_version = log.latest_version().unwrap_or(INVALID_VERSION);
                (map, commit_log, shard_last_version, Durability::Persistent(std::sync::Mutex::new(log)))
            }
        };
        let last_ts = commit_log.last().map(|(_, ts)| *ts).unwrap_or(0);

        let state = Arc::new(RwLock::new(StoreState { map, shard_last_version, last_ts, commit_log }));
        let durability = Arc::new(durability);
        let next_version = Arc::new(AtomicI64::new(shard_last_version + 1));
        let latest_stable_version = Arc::new(AtomicI64::new(shard_last_version));
        let stable_notify = Arc::new(Notify::new());

        let handler_state = state.clone();
        let handler_durability = durability.clone();
        let handler_next_version = next_version.clone();
        let handler_stable_version = latest_stable_version.clone();
        let handler_stable_notify = stable_notify.clone();
        let clock = options.clock;
        let dispatcher = options.dispatcher;

        let delivery = LocalOrderedDelivery::spawn(move |cmd: PutCommand| {
            let is_normal_commit = matches!(cmd.mode, PutMode::Normal);
            let result = apply_commit(
                &handler_state,
                &handler_durability,
                &handler_next_version,
                clock.as_ref(),
                dispatcher.as_deref(),
                cmd.object,
                cmd.mode,
            );
            if is_normal_commit {
                if let Ok((version, _)) = result {
                    handler_stable_version.store(version, Ordering::SeqCst);
                    handler_stable_notify.notify_waiters();
                }
            }
            if let Some(reply) = cmd.reply {
                let _ = reply.send(result);
            }
        });

        Ok(Self { state, durability, next_version, latest_stable_version, stable_notify, delivery, evaluation_mode: options.evaluation_mode })
    }

    pub fn evaluation_mode(&self) -> bool {
        self.evaluation_mode
    }

    /// Commits `object` and waits for the assigned `(version, timestamp_us)`.
    pub async fn put(&self, object: Object) -> CResult<(i64, u64)> {
        self.submit(object, PutMode::Normal).await
    }

    /// Commits `object` without waiting for the result.
    pub fn put_and_forget(&self, object: Object) {
        self.delivery.submit(PutCommand { object, mode: PutMode::Normal, reply: None });
    }

    /// Bypasses storage; fires OCDPO only. `object.version == INVALID_VERSION`
    /// requests a freshly assigned version/timestamp (not persisted either
    /// way); otherwise the caller's values are used verbatim.
    pub async fn trigger_put(&self, object: Object) -> CResult<(i64, u64)> {
        self.submit(object, PutMode::Trigger).await
    }

    /// Commits a tombstone for `key`. Always advances the version counter,
    /// even if `key` is already absent or already removed — unlike
    /// `DeltaMap::remove`'s no-op-on-already-gone rule, a store-level
    /// remove is itself a committed operation with its own version.
    pub async fn remove(&self, key: impl Into<String>) -> CResult<(i64, u64)> {
        let mut tombstone = Object::invalid(key);
        tombstone.previous_version = INVALID_VERSION;
        tombstone.previous_version_by_key = INVALID_VERSION;
        self.submit(tombstone, PutMode::Normal).await
    }

    async fn submit(&self, object: Object, mode: PutMode) -> CResult<(i64, u64)> {
        let (tx, rx) = oneshot::channel();
        self.delivery.submit(PutCommand { object, mode, reply: Some(tx) });
        rx.await.map_err(|_| Error::Internal("delivery task dropped the reply channel".into()))?
    }

    /// `version = None` reads the current map (subject to `stable`);
    /// `version = Some(v)` reconstructs the snapshot as of `v`.
    pub async fn get(&self, key: &str, version: Option<i64>, stable: bool) -> CResult<Object> {
        match version {
            None => {
                if stable {
                    let target = self.state.read().unwrap().shard_last_version;
                    self.wait_for_stable(target).await?;
                }
                Ok(self.state.read().unwrap().map.get(&key.to_string()))
            }
            Some(v) => self.get_at_version(key, v),
        }
    }

    pub async fn get_by_time(&self, key: &str, ts_us: u64, stable: bool) -> CResult<Object> {
        let version = self.version_at_or_before(ts_us)?;
        match version {
            None => Ok(Object::invalid(key)),
            Some(v) => {
                if stable {
                    self.wait_for_stable(v).await?;
                }
                self.get_at_version(key, v)
            }
        }
    }

    pub async fn get_size(&self, key: &str, version: Option<i64>, stable: bool) -> CResult<u64> {
        Ok(self.get(key, version, stable).await?.blob.len() as u64)
    }

    pub async fn get_size_by_time(&self, key: &str, ts_us: u64, stable: bool) -> CResult<u64> {
        Ok(self.get_by_time(key, ts_us, stable).await?.blob.len() as u64)
    }

    pub async fn list_keys(&self, version: Option<i64>, stable: bool) -> CResult<Vec<String>> {
        match version {
            None => {
                if stable {
                    let target = self.state.read().unwrap().shard_last_version;
                    self.wait_for_stable(target).await?;
                }
                let state = self.state.read().unwrap();
                Ok(state
                    .map
                    .snapshot()
                    .iter()
                    .filter(|(_, v)| !v.is_invalid())
                    .map(|(k, _)| k.clone())
                    .collect())
            }
            Some(v) => {
                let snapshot = self.reconstruct_snapshot_at(v)?;
                Ok(snapshot
                    .snapshot()
                    .iter()
                    .filter(|(_, v)| !v.is_invalid())
                    .map(|(k, _)| k.clone())
                    .collect())
            }
        }
    }

    pub async fn list_keys_by_time(&self, ts_us: u64, stable: bool) -> CResult<Vec<String>> {
        match self.version_at_or_before(ts_us)? {
            None => Ok(Vec::new()),
            Some(v) => self.list_keys(Some(v), stable).await,
        }
    }

    /// A linearized read: round-trips through ordered delivery so it sees
    /// every write submitted before it. A barrier probe (no dispatcher
    /// registered for it, since `dispatcher.notify_commit` only fires for
    /// real commits) rides the same FIFO delivery channel as every write;
    /// once it is acknowledged, every write submitted before this call has
    /// necessarily already been applied.
    pub async fn multi_get(&self, key: &str) -> CResult<Object> {
        self.submit(Object::invalid(key), PutMode::Barrier).await?;
        Ok(self.state.read().unwrap().map.get(&key.to_string()))
    }

    fn get_at_version(&self, key: &str, version: i64) -> CResult<Object> {
        let snapshot = self.reconstruct_snapshot_at(version)?;
        Ok(snapshot.get(&key.to_string()))
    }

    fn reconstruct_snapshot_at(&self, version: i64) -> CResult<DeltaMap<String, Object>> {
        match self.durability.as_ref() {
            Durability::Volatile => Err(Error::VersionTruncated),
            Durability::Persistent(log) => {
                log.lock().unwrap().reconstruct_at(Object::invalid(""), version)
            }
        }
    }

    fn version_at_or_before(&self, ts_us: u64) -> CResult<Option<i64>> {
        let state = self.state.read().unwrap();
        Ok(state
            .commit_log
            .iter()
            .rev()
            .find(|(_, ts)| *ts <= ts_us)
            .map(|(v, _)| *v))
    }

    async fn wait_for_stable(&self, target: i64) -> CResult<()> {
        if self.latest_stable_version.load(Ordering::SeqCst) >= target {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + STABLE_WAIT_TIMEOUT;
        loop {
            if self.latest_stable_version.load(Ordering::SeqCst) >= target {
                return Ok(());
            }
            let notified = self.stable_notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if self.latest_stable_version.load(Ordering::SeqCst) >= target {
                        return Ok(());
                    }
                    return Err(Error::NotStable);
                }
            }
        }
    }

    pub fn next_version_peek(&self) -> i64 {
        self.next_version.load(Ordering::SeqCst)
    }
}

fn apply_commit(
    state: &Arc<RwLock<StoreState>>,
    durability: &Arc<Durability>,
    next_version: &Arc<AtomicI64>,
    clock: &dyn WallClock,
    dispatcher: Option<&Dispatcher>,
    object: Object,
    mode: PutMode,
) -> CResult<(i64, u64)> {
    match mode {
        PutMode::Barrier => Ok((INVALID_VERSION, 0)),
        PutMode::Trigger => {
            let version = if object.version == INVALID_VERSION {
                next_version.fetch_add(1, Ordering::SeqCst)
            } else {
                object.version
            };
            let ts = if object.timestamp_us == 0 { clock.now_us() } else { object.timestamp_us };
            if let Some(dispatcher) = dispatcher {
                let mut obj = object;
                obj.version = version;
                obj.timestamp_us = ts;
                dispatcher.notify_commit(obj);
            }
            Ok((version, ts))
        }
        PutMode::Normal => {
            let mut state = state.write().unwrap();

            let actual_prev = state.shard_last_version;
            let actual_prev_by_key = state.map.get(&object.key).version;

            if !previous_version_ok(object.previous_version, actual_prev)
                || !previous_version_ok(object.previous_version_by_key, actual_prev_by_key)
            {
                return Err(Error::PreviousVersionMismatch);
            }

            let version = next_version.fetch_add(1, Ordering::SeqCst);
            let ts = clock.now_us().max(state.last_ts + 1);

            let mut committed = object;
            committed.version = version;
            committed.timestamp_us = ts;
            committed.previous_version = actual_prev;
            committed.previous_version_by_key = actual_prev_by_key;

            state.map.put(committed.key.clone(), committed.clone());
            state.shard_last_version = version;
            state.last_ts = ts;
            state.commit_log.push((version, ts));

            if let Durability::Persistent(log) = durability.as_ref() {
                let delta = state.map.current_delta_to_vec()?;
                log.lock().unwrap().append(version, &delta)?;
            }

            drop(state);

            if let Some(dispatcher) = dispatcher {
                dispatcher.notify_commit(committed);
            }

            Ok((version, ts))
        }
    }
}

/// Accepts `declared == INVALID_VERSION` ("don't care") or any declared
/// value at or after the shard's actual predecessor — rejects only when
/// the shard's actual value is strictly ahead of what the client declared.
fn previous_version_ok(declared: i64, actual: i64) -> bool {
    declared == INVALID_VERSION || actual <= declared
}

/// Lets a `Dispatcher` call back into this store on behalf of an OCDPO
/// observer's `emit_fn`. Wired in after construction via
/// `Dispatcher::set_emit_sink`, once the store exists to wire in.
impl EmitSink for Store {
    fn emit(&self, key: &str, version: i64, _ts_us: u64, previous_version: i64, previous_version_by_key: i64, blob: Vec<u8>) {
        let mut obj = Object::new(key, blob);
        obj.previous_version = previous_version;
        obj.previous_version_by_key = previous_version_by_key;
        // `apply_commit` always reassigns version/timestamp/predecessor
        // links for a normal commit after validating the declared ones, so
        // the INVALID_VERSION-means-fresh distinction collapses to the same
        // code path either way.
        let _ = version;
        self.put_and_forget(obj);
    }
}

fn single_commit_timestamp(delta_bytes: &[u8]) -> CResult<u64> {
    if delta_bytes.len() < 8 {
        return Err(Error::CorruptDelta("commit delta too short".into()));
    }
    let count = u64::from_le_bytes(delta_bytes[0..8].try_into().unwrap());
    if count == 0 {
        return Err(Error::CorruptDelta("empty commit delta has no timestamp".into()));
    }
    let (_, key_len) = <String as Codable>::decode(&delta_bytes[8..])?;
    let (obj, _) = <Object as Codable>::decode(&delta_bytes[8 + key_len..])?;
    Ok(obj.timestamp_us)
}

#[cfg(test)]
mod test {
    use super::*;

    fn opts_volatile() -> StoreOptions {
        StoreOptions { dir: None, evaluation_mode: false, clock: Arc::new(SystemWallClock), dispatcher: None }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = Store::open(opts_volatile()).unwrap();
        let (v1, t1) = store.put(Object::new("/pool/a", b"hello".to_vec())).await.unwrap();
        assert!(v1 >= 0);
        assert!(t1 > 0);

        let got = store.get("/pool/a", None, false).await.unwrap();
        assert_eq!(got.blob, b"hello");
        assert_eq!(got.version, v1);
        assert_eq!(got.previous_version_by_key, INVALID_VERSION);
    }

    #[tokio::test]
    async fn overwrite_chains_previous_version_by_key() {
        let store = Store::open(opts_volatile()).unwrap();
        let (v1, _) = store.put(Object::new("/pool/a", b"hello".to_vec())).await.unwrap();
        let (v2, _) = store.put(Object::new("/pool/a", b"world".to_vec())).await.unwrap();
        assert!(v2 > v1);

        let got = store.get("/pool/a", None, false).await.unwrap();
        assert_eq!(got.blob, b"world");
        assert_eq!(got.previous_version_by_key, v1);
    }

    #[tokio::test]
    async fn mismatched_previous_version_is_rejected() {
        let store = Store::open(opts_volatile()).unwrap();
        let mut obj = Object::new("/pool/a", b"x".to_vec());
        obj.previous_version_by_key = 99; // claims a predecessor that cannot exist yet
        let result = store.put(obj).await;
        assert!(matches!(result, Err(Error::PreviousVersionMismatch)));
    }

    #[tokio::test]
    async fn remove_then_get_returns_invalid_value() {
        let store = Store::open(opts_volatile()).unwrap();
        store.put(Object::new("/pool/a", b"world".to_vec())).await.unwrap();
        let (v3, _) = store.remove("/pool/a").await.unwrap();
        assert!(v3 >= 0);

        let got = store.get("/pool/a", None, false).await.unwrap();
        assert!(got.is_invalid());

        let keys = store.list_keys(None, false).await.unwrap();
        assert!(!keys.contains(&"/pool/a".to_string()));
    }

    #[tokio::test]
    async fn volatile_shard_rejects_historical_version_reads() {
        let store = Store::open(opts_volatile()).unwrap();
        let (v1, _) = store.put(Object::new("/pool/a", b"hello".to_vec())).await.unwrap();
        let result = store.get("/pool/a", Some(v1), false).await;
        assert!(matches!(result, Err(Error::VersionTruncated)));
    }

    #[tokio::test]
    async fn persistent_shard_answers_historical_version_reads() {
        let dir = tempfile::tempdir().unwrap();
        let opts = StoreOptions {
            dir: Some(dir.path().to_path_buf()),
            evaluation_mode: false,
            clock: Arc::new(SystemWallClock),
            dispatcher: None,
        };
        let store = Store::open(opts).unwrap();
        let (v1, _) = store.put(Object::new("/pool/a", b"hello".to_vec())).await.unwrap();
        let (v2, _) = store.put(Object::new("/pool/a", b"world".to_vec())).await.unwrap();

        let at_v1 = store.get("/pool/a", Some(v1), false).await.unwrap();
        assert_eq!(at_v1.blob, b"hello");
        let at_v2 = store.get("/pool/a", Some(v2), false).await.unwrap();
        assert_eq!(at_v2.blob, b"world");
    }

    #[tokio::test]
    async fn persistent_shard_recovers_current_state_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let opts = StoreOptions {
                dir: Some(dir.path().to_path_buf()),
                evaluation_mode: false,
                clock: Arc::new(SystemWallClock),
                dispatcher: None,
            };
            let store = Store::open(opts).unwrap();
            store.put(Object::new("/pool/a", b"hello".to_vec())).await.unwrap();
        }
        let opts = StoreOptions {
            dir: Some(dir.path().to_path_buf()),
            evaluation_mode: false,
            clock: Arc::new(SystemWallClock),
            dispatcher: None,
        };
        let store = Store::open(opts).unwrap();
        let got = store.get("/pool/a", None, false).await.unwrap();
        assert_eq!(got.blob, b"hello");
    }

    #[tokio::test]
    async fn removed_key_stays_removed_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let opts = || StoreOptions {
            dir: Some(dir.path().to_path_buf()),
            evaluation_mode: false,
            clock: Arc::new(SystemWallClock),
            dispatcher: None,
        };
        let removed_version = {
            let store = Store::open(opts()).unwrap();
            store.put(Object::new("/pool/a", b"hello".to_vec())).await.unwrap();
            let (version, _) = store.remove("/pool/a").await.unwrap();
            version
        };

        let store = Store::open(opts()).unwrap();
        let current = store.get("/pool/a", None, false).await.unwrap();
        assert!(current.is_invalid(), "removed key must not resurrect as live on reopen");

        let at_removal = store.get("/pool/a", Some(removed_version), false).await.unwrap();
        assert!(at_removal.is_invalid(), "reading exactly the removal version must still see the tombstone");
    }

    #[tokio::test]
    async fn stable_read_with_no_pending_writes_resolves_immediately() {
        let store = Store::open(opts_volatile()).unwrap();
        store.put(Object::new("/pool/a", b"hello".to_vec())).await.unwrap();
        let got = store.get("/pool/a", None, true).await.unwrap();
        assert_eq!(got.blob, b"hello");
    }
}
