//! Cascade: a distributed, versioned key-value storage service layered
//! atop a reliable totally-ordered group-communication substrate. Clients
//! put and get opaque byte blobs addressed by string keys grouped into
//! object pools; each pool is hosted by a shard whose replication class
//! (volatile, persistent, or persistent-signed) determines durability and
//! integrity guarantees.
//!
//! This crate provides the five components of a shard's data path:
//! `delta_map` (A, the versioned map + delta journal), `persist` (the
//! on-disk delta log), `store` (B, the replicated shard core), `signed`
//! (C, the hash-chained signature extension), `pool` (D, directory &
//! routing), and `ocdpo` (E, off-critical-data-path dispatch). The
//! out-of-scope group-communication/membership substrate is modeled as
//! the `ordering::OrderedDelivery` and `pool::MemberDirectory` traits,
//! each with one concrete single-process implementation.

pub mod error;
pub mod object;
pub mod fnv;
pub mod delta_map;
pub mod persist;
pub mod ordering;
pub mod ocdpo;
pub mod store;
pub mod signed;
pub mod pool;

pub use error::{CResult, Error};
pub use object::{Object, INVALID_VERSION};
pub use ocdpo::{Dispatcher, EmitSink, OffCriticalDataPathObserver, ThreadAffinity};
pub use ordering::{LocalOrderedDelivery, OrderedDelivery};
pub use pool::{
    MemberDirectory, NodeId, ObjectPoolMetadata, PoolDirectory, Router, ShardMemberSelectionPolicy,
    ShardingPolicy, StaticMemberDirectory,
};
pub use signed::SignedStore;
pub use store::{Store, StoreOptions, SystemWallClock, WallClock};
