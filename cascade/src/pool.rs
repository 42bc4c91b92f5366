//! Object-pool directory & routing: resolves a pool pathname to its
//! metadata, a key to a shard index within that pool, and a shard index to
//! a responding member under one of the seven selection policies.
//!
//! Pools live in a dedicated meta-subgroup and are themselves versioned
//! objects, so the directory is just a tiny replicated store of its own,
//! reusing `Store` rather than inventing a second persistence mechanism.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::fnv::fnv1a64;
use crate::object::Object;
use crate::store::Store;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ShardingPolicy {
    Hash,
    /// Shards own half-open lexicographic intervals; `boundaries[i]` is the
    /// exclusive upper bound of shard `i` (the last shard has no upper
    /// bound).
    Range { boundaries: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectPoolMetadata {
    pub pathname: String,
    pub subgroup_type_index: usize,
    pub subgroup_index: usize,
    pub shard_count: usize,
    pub sharding_policy: ShardingPolicy,
    pub object_locations: HashMap<String, usize>,
    pub deleted: bool,
    pub version: i64,
    pub timestamp_us: u64,
    pub previous_version: i64,
    pub previous_version_by_key: i64,
}

impl ObjectPoolMetadata {
    /// Resolves `key` to a shard index: an explicit `object_locations`
    /// entry wins, otherwise `HASH` or `RANGE` as configured.
    pub fn resolve_shard(&self, key: &str) -> CResult<usize> {
        if let Some(&shard) = self.object_locations.get(key) {
            return Ok(shard);
        }
        match &self.sharding_policy {
            ShardingPolicy::Hash => Ok((fnv1a64(key.as_bytes()) as usize) % self.shard_count.max(1)),
            ShardingPolicy::Range { boundaries } => {
                // `boundaries[i]` is shard i's exclusive upper bound; the
                // first boundary key strictly greater than `key` names the
                // owning shard, the last shard owns everything beyond the
                // final boundary.
                let shard = boundaries.iter().position(|b| key < b.as_str()).unwrap_or(boundaries.len());
                Ok(shard.min(self.shard_count.saturating_sub(1)))
            }
        }
    }
}

/// The pool-metadata directory: a replicated map from pathname to
/// `ObjectPoolMetadata`, backed by its own `Store` instance.
pub struct PoolDirectory {
    meta_store: Arc<Store>,
    /// Caches prefix-walk resolutions: a query path maps to the pool
    /// pathname that owns it.
    resolution_cache: RwLock<HashMap<String, String>>,
}

impl PoolDirectory {
    pub fn new(meta_store: Arc<Store>) -> Self {
        Self { meta_store, resolution_cache: RwLock::new(HashMap::new()) }
    }

    /// Atomically inserts pool metadata; fails with `PoolAlreadyExists` if
    /// `path` already names a non-deleted pool.
    pub async fn create_object_pool(
        &self,
        path: impl Into<String>,
        subgroup_type_index: usize,
        subgroup_index: usize,
        shard_count: usize,
        sharding_policy: ShardingPolicy,
        object_locations: HashMap<String, usize>,
    ) -> CResult<(i64, u64)> {
        let path = path.into();
        if let Ok(existing) = self.find_object_pool(&path).await {
            if !existing.deleted {
                return Err(Error::PoolAlreadyExists(path));
            }
        }

        let metadata = ObjectPoolMetadata {
            pathname: path.clone(),
            subgroup_type_index,
            subgroup_index,
            shard_count,
            sharding_policy,
            object_locations,
            deleted: false,
            version: -1,
            timestamp_us: 0,
            previous_version: -1,
            previous_version_by_key: -1,
        };
        let blob = bincode::serialize(&metadata).map_err(|e| Error::Parse(e.to_string()))?;
        let (version, ts) = self.meta_store.put(Object::new(path.clone(), blob)).await?;
        self.resolution_cache.write().unwrap().insert(path.clone(), path);
        Ok((version, ts))
    }

    pub async fn remove_object_pool(&self, path: &str) -> CResult<(i64, u64)> {
        let mut metadata = self.find_object_pool(path).await?;
        metadata.deleted = true;
        let blob = bincode::serialize(&metadata).map_err(|e| Error::Parse(e.to_string()))?;
        self.meta_store.put(Object::new(path.to_string(), blob)).await
    }

    /// Walks `path` from longest prefix downward until a registered pool is
    /// found.
    pub async fn find_object_pool(&self, path: &str) -> CResult<ObjectPoolMetadata> {
        if let Some(hit) = self.resolution_cache.read().unwrap().get(path).cloned() {
            if let Some(metadata) = self.load(&hit).await? {
                return Ok(metadata);
            }
        }

        let mut candidate = path;
        loop {
            if let Some(metadata) = self.load(candidate).await? {
                self.resolution_cache.write().unwrap().insert(path.to_string(), candidate.to_string());
                return Ok(metadata);
            }
            match candidate.rfind('/') {
                Some(0) if candidate.len() > 1 => candidate = &candidate[..1],
                Some(idx) if idx > 0 => candidate = &candidate[..idx],
                _ => return Err(Error::NoSuchPool(path.to_string())),
            }
        }
    }

    async fn load(&self, path: &str) -> CResult<Option<ObjectPoolMetadata>> {
        let object = self.meta_store.get(path, None, false).await?;
        if object.is_invalid() {
            return Ok(None);
        }
        let metadata: ObjectPoolMetadata = bincode::deserialize(&object.blob).map_err(|e| Error::Parse(e.to_string()))?;
        Ok(Some(metadata))
    }
}

pub type NodeId = u64;

/// The membership service, reduced to the one query the router needs: who
/// is in a shard, and are they reachable.
pub trait MemberDirectory: Send + Sync {
    fn members(&self, subgroup_type_index: usize, subgroup_index: usize, shard_index: usize) -> Vec<NodeId>;
    fn is_reachable(&self, node: NodeId) -> bool;
}

/// A fixed, in-process membership table: every shard's member list is
/// known up front and never changes except via explicit
/// `mark_unreachable`/`mark_reachable` calls (used to simulate failures in
/// tests).
pub struct StaticMemberDirectory {
    // subgroup_type_index -> subgroup_index -> shard_index -> members
    table: Vec<Vec<Vec<Vec<NodeId>>>>,
    unreachable: RwLock<HashSet<NodeId>>,
}

impl StaticMemberDirectory {
    pub fn new(table: Vec<Vec<Vec<Vec<NodeId>>>>) -> Self {
        Self { table, unreachable: RwLock::new(HashSet::new()) }
    }

    pub fn mark_unreachable(&self, node: NodeId) {
        self.unreachable.write().unwrap().insert(node);
    }

    pub fn mark_reachable(&self, node: NodeId) {
        self.unreachable.write().unwrap().remove(&node);
    }
}

impl MemberDirectory for StaticMemberDirectory {
    fn members(&self, subgroup_type_index: usize, subgroup_index: usize, shard_index: usize) -> Vec<NodeId> {
        self.table
            .get(subgroup_type_index)
            .and_then(|types| types.get(subgroup_index))
            .and_then(|subgroups| subgroups.get(shard_index))
            .cloned()
            .unwrap_or_default()
    }

    fn is_reachable(&self, node: NodeId) -> bool {
        !self.unreachable.read().unwrap().contains(&node)
    }
}

/// The seven per-shard responder-selection policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardMemberSelectionPolicy {
    FirstMember,
    LastMember,
    Random,
    FixedRandom,
    RoundRobin,
    KeyHashing,
    UserSpecified,
}

type ShardCoords = (usize, usize, usize);

/// A routing handle bound to one selection policy. `FixedRandom` and
/// `RoundRobin` need per-client state, so a `Router` models one logical
/// client's routing state for its lifetime: the fixed pick and the
/// round-robin cursor are cached per shard for as long as the `Router`
/// lives.
pub struct Router {
    directory: Arc<dyn MemberDirectory>,
    policy: ShardMemberSelectionPolicy,
    fixed_random_cache: Mutex<HashMap<ShardCoords, NodeId>>,
    round_robin_counters: Mutex<HashMap<ShardCoords, usize>>,
}

impl Router {
    pub fn new(directory: Arc<dyn MemberDirectory>, policy: ShardMemberSelectionPolicy) -> Self {
        Self {
            directory,
            policy,
            fixed_random_cache: Mutex::new(HashMap::new()),
            round_robin_counters: Mutex::new(HashMap::new()),
        }
    }

    /// Selects the member to contact for `key`'s operations against the
    /// given shard. Unreachable members are filtered out before selection,
    /// so a stale pick is never returned; `Error::NoMemberAvailable` once
    /// the shard has no reachable member left.
    pub fn select_member(
        &self,
        subgroup_type_index: usize,
        subgroup_index: usize,
        shard_index: usize,
        key: &str,
        user_specified: Option<NodeId>,
    ) -> CResult<NodeId> {
        let mut candidates = self.directory.members(subgroup_type_index, subgroup_index, shard_index);
        candidates.retain(|node| self.directory.is_reachable(*node));
        if candidates.is_empty() {
            return Err(Error::NoMemberAvailable);
        }
        let coords = (subgroup_type_index, subgroup_index, shard_index);

        match self.policy {
            ShardMemberSelectionPolicy::FirstMember => Ok(*candidates.iter().min().unwrap()),
            ShardMemberSelectionPolicy::LastMember => Ok(*candidates.iter().max().unwrap()),
            ShardMemberSelectionPolicy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Ok(candidates[idx])
            }
            ShardMemberSelectionPolicy::FixedRandom => {
                let mut cache = self.fixed_random_cache.lock().unwrap();
                if let Some(&node) = cache.get(&coords) {
                    if candidates.contains(&node) {
                        return Ok(node);
                    }
                }
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                let node = candidates[idx];
                cache.insert(coords, node);
                Ok(node)
            }
            ShardMemberSelectionPolicy::RoundRobin => {
                let mut counters = self.round_robin_counters.lock().unwrap();
                let counter = counters.entry(coords).or_insert(0);
                let node = candidates[*counter % candidates.len()];
                *counter = counter.wrapping_add(1);
                Ok(node)
            }
            ShardMemberSelectionPolicy::KeyHashing => {
                let idx = (fnv1a64(key.as_bytes()) as usize) % candidates.len();
                Ok(candidates[idx])
            }
            ShardMemberSelectionPolicy::UserSpecified => user_specified
                .filter(|node| candidates.contains(node))
                .ok_or(Error::NoMemberAvailable),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::StoreOptions;

    fn meta_store() -> Arc<Store> {
        Arc::new(Store::open(StoreOptions::default()).unwrap())
    }

    #[tokio::test]
    async fn create_then_find_round_trips() {
        let dir = PoolDirectory::new(meta_store());
        dir.create_object_pool("/pool/a", 0, 0, 4, ShardingPolicy::Hash, HashMap::new()).await.unwrap();
        let found = dir.find_object_pool("/pool/a").await.unwrap();
        assert_eq!(found.pathname, "/pool/a");
        assert_eq!(found.shard_count, 4);
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let dir = PoolDirectory::new(meta_store());
        dir.create_object_pool("/pool/a", 0, 0, 4, ShardingPolicy::Hash, HashMap::new()).await.unwrap();
        let result = dir.create_object_pool("/pool/a", 0, 0, 4, ShardingPolicy::Hash, HashMap::new()).await;
        assert!(matches!(result, Err(Error::PoolAlreadyExists(_))));
    }

    #[tokio::test]
    async fn find_resolves_longest_matching_prefix() {
        let dir = PoolDirectory::new(meta_store());
        dir.create_object_pool("/pool", 0, 0, 2, ShardingPolicy::Hash, HashMap::new()).await.unwrap();
        let found = dir.find_object_pool("/pool/a/b/c").await.unwrap();
        assert_eq!(found.pathname, "/pool");
    }

    #[tokio::test]
    async fn removed_pool_can_be_recreated() {
        let dir = PoolDirectory::new(meta_store());
        dir.create_object_pool("/pool/a", 0, 0, 2, ShardingPolicy::Hash, HashMap::new()).await.unwrap();
        dir.remove_object_pool("/pool/a").await.unwrap();
        dir.create_object_pool("/pool/a", 0, 0, 2, ShardingPolicy::Hash, HashMap::new()).await.unwrap();
        let found = dir.find_object_pool("/pool/a").await.unwrap();
        assert!(!found.deleted);
    }

    #[test]
    fn hash_policy_is_deterministic_and_bounded() {
        let metadata = ObjectPoolMetadata {
            pathname: "/pool/a".into(),
            subgroup_type_index: 0,
            subgroup_index: 0,
            shard_count: 4,
            sharding_policy: ShardingPolicy::Hash,
            object_locations: HashMap::new(),
            deleted: false,
            version: 0,
            timestamp_us: 0,
            previous_version: -1,
            previous_version_by_key: -1,
        };
        let s1 = metadata.resolve_shard("a").unwrap();
        let s2 = metadata.resolve_shard("a").unwrap();
        assert_eq!(s1, s2);
        assert!(s1 < 4);
    }

    #[test]
    fn object_locations_override_wins() {
        let mut locations = HashMap::new();
        locations.insert("special".to_string(), 3);
        let metadata = ObjectPoolMetadata {
            pathname: "/pool/a".into(),
            subgroup_type_index: 0,
            subgroup_index: 0,
            shard_count: 4,
            sharding_policy: ShardingPolicy::Hash,
            object_locations: locations,
            deleted: false,
            version: 0,
            timestamp_us: 0,
            previous_version: -1,
            previous_version_by_key: -1,
        };
        assert_eq!(metadata.resolve_shard("special").unwrap(), 3);
    }

    #[test]
    fn range_policy_picks_by_boundary() {
        let metadata = ObjectPoolMetadata {
            pathname: "/pool/a".into(),
            subgroup_type_index: 0,
            subgroup_index: 0,
            shard_count: 3,
            sharding_policy: ShardingPolicy::Range { boundaries: vec!["g".into(), "n".into()] },
            object_locations: HashMap::new(),
            deleted: false,
            version: 0,
            timestamp_us: 0,
            previous_version: -1,
            previous_version_by_key: -1,
        };
        assert_eq!(metadata.resolve_shard("a").unwrap(), 0);
        assert_eq!(metadata.resolve_shard("h").unwrap(), 1);
        assert_eq!(metadata.resolve_shard("z").unwrap(), 2);
    }

    #[test]
    fn first_and_last_member_policies() {
        let directory: Arc<dyn MemberDirectory> =
            Arc::new(StaticMemberDirectory::new(vec![vec![vec![vec![3, 1, 2]]]]));
        let first_router = Router::new(directory.clone(), ShardMemberSelectionPolicy::FirstMember);
        assert_eq!(first_router.select_member(0, 0, 0, "k", None).unwrap(), 1);

        let last_router = Router::new(directory, ShardMemberSelectionPolicy::LastMember);
        assert_eq!(last_router.select_member(0, 0, 0, "k", None).unwrap(), 3);
    }

    #[test]
    fn fixed_random_sticks_across_calls() {
        let directory: Arc<dyn MemberDirectory> =
            Arc::new(StaticMemberDirectory::new(vec![vec![vec![vec![1, 2, 3, 4, 5]]]]));
        let router = Router::new(directory, ShardMemberSelectionPolicy::FixedRandom);
        let first = router.select_member(0, 0, 0, "k", None).unwrap();
        for _ in 0..10 {
            assert_eq!(router.select_member(0, 0, 0, "k", None).unwrap(), first);
        }
    }

    #[test]
    fn round_robin_cycles_through_members() {
        let directory: Arc<dyn MemberDirectory> =
            Arc::new(StaticMemberDirectory::new(vec![vec![vec![vec![10, 20, 30]]]]));
        let router = Router::new(directory, ShardMemberSelectionPolicy::RoundRobin);
        let picks: Vec<NodeId> = (0..6).map(|_| router.select_member(0, 0, 0, "k", None).unwrap()).collect();
        assert_eq!(picks, vec![10, 20, 30, 10, 20, 30]);
    }

    #[test]
    fn key_hashing_is_deterministic() {
        let directory: Arc<dyn MemberDirectory> =
            Arc::new(StaticMemberDirectory::new(vec![vec![vec![vec![10, 20, 30]]]]));
        let router = Router::new(directory, ShardMemberSelectionPolicy::KeyHashing);
        let a = router.select_member(0, 0, 0, "same-key", None).unwrap();
        let b = router.select_member(0, 0, 0, "same-key", None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unreachable_member_is_skipped_and_exhaustion_errors() {
        let directory = Arc::new(StaticMemberDirectory::new(vec![vec![vec![vec![1, 2]]]]));
        directory.mark_unreachable(1);
        directory.mark_unreachable(2);
        let router = Router::new(directory, ShardMemberSelectionPolicy::FirstMember);
        assert!(matches!(router.select_member(0, 0, 0, "k", None), Err(Error::NoMemberAvailable)));
    }

    #[test]
    fn user_specified_must_be_a_real_member() {
        let directory: Arc<dyn MemberDirectory> = Arc::new(StaticMemberDirectory::new(vec![vec![vec![vec![1, 2]]]]));
        let router = Router::new(directory, ShardMemberSelectionPolicy::UserSpecified);
        assert_eq!(router.select_member(0, 0, 0, "k", Some(2)).unwrap(), 2);
        assert!(matches!(router.select_member(0, 0, 0, "k", Some(99)), Err(Error::NoMemberAvailable)));
    }
}
