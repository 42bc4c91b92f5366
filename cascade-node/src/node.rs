//! In-process node state: the pool directory plus lazily-opened,
//! per-shard `Store`s, each with its own `Dispatcher` and OCDPO worker
//! pool, all rooted under the configured data directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cascade::ocdpo::EmitSink;
use cascade::pool::{PoolDirectory, ShardingPolicy};
use cascade::store::{Store, StoreOptions};
use cascade::{CResult, Dispatcher};

struct Shard {
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
}

pub struct Node {
    data_dir: PathBuf,
    evaluation_mode: bool,
    ocdpo_pool_size: usize,
    directory: Arc<PoolDirectory>,
    shards: tokio::sync::Mutex<HashMap<(String, usize), Shard>>,
}

impl Node {
    pub fn open(data_dir: PathBuf, evaluation_mode: bool, ocdpo_pool_size: usize) -> CResult<Arc<Self>> {
        let meta_store = Arc::new(Store::open(StoreOptions {
            dir: Some(data_dir.join("_meta")),
            evaluation_mode,
            ..StoreOptions::default()
        })?);
        let directory = Arc::new(PoolDirectory::new(meta_store));
        Ok(Arc::new(Self {
            data_dir,
            evaluation_mode,
            ocdpo_pool_size,
            directory,
            shards: tokio::sync::Mutex::new(HashMap::new()),
        }))
    }

    pub fn directory(&self) -> &Arc<PoolDirectory> {
        &self.directory
    }

    pub async fn create_pool(
        &self,
        pathname: &str,
        shard_count: usize,
        policy: ShardingPolicy,
    ) -> CResult<(i64, u64)> {
        self.directory
            .create_object_pool(pathname, 0, 0, shard_count, policy, HashMap::new())
            .await
    }

    /// Resolves `key` to its owning shard under `pathname`'s pool and
    /// returns that shard's store, opening it on first use.
    pub async fn shard_for_key(&self, pathname: &str, key: &str) -> CResult<Arc<Store>> {
        let metadata = self.directory.find_object_pool(pathname).await?;
        let shard_index = metadata.resolve_shard(key)?;
        self.shard(pathname, shard_index).await
    }

    async fn shard(&self, pathname: &str, shard_index: usize) -> CResult<Arc<Store>> {
        let cache_key = (pathname.to_string(), shard_index);
        let mut shards = self.shards.lock().await;
        if let Some(shard) = shards.get(&cache_key) {
            return Ok(shard.store.clone());
        }

        let dispatcher = Dispatcher::new(self.ocdpo_pool_size);
        let store = Arc::new(Store::open(StoreOptions {
            dir: Some(self.shard_dir(pathname, shard_index)),
            evaluation_mode: self.evaluation_mode,
            dispatcher: Some(dispatcher.clone()),
            ..StoreOptions::default()
        })?);
        dispatcher.set_emit_sink(store.clone() as Arc<dyn EmitSink>);

        shards.insert(cache_key, Shard { store: store.clone(), dispatcher });
        Ok(store)
    }

    fn shard_dir(&self, pathname: &str, shard_index: usize) -> PathBuf {
        let sanitized: String =
            pathname.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect();
        self.data_dir.join("pools").join(sanitized).join(format!("shard_{}", shard_index))
    }

    /// Shuts down every shard's dispatcher, joining its worker threads.
    /// Cancellation only happens here, at process shutdown — an in-flight
    /// observer is never interrupted mid-commit.
    pub async fn shutdown(&self) {
        for shard in self.shards.lock().await.values() {
            shard.dispatcher.shutdown();
        }
    }
}
