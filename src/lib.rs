//! # Hill Storage Core
//!
//! Hill is a distributed key-value store built around persistent memory:
//! servers expose local PM to peers over RDMA, a monitor disseminates
//! membership and range ownership, and clients route requests to range
//! owners. This crate is the storage core of a single server node; the
//! transport (RPC framing, RDMA verbs, monitor sockets) and the drivers
//! (CLI, workload generators, config files) are external collaborators.
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------+
//! |              Store façade                 |  ownership routing,
//! |        (request tags, recovery)           |  thread registration
//! +---------------------+---------------------+
//! |    OLFIT B-link     |   Remote memory     |  lock-free readers,
//! |       index         |  (pointers, bump    |  version-locked
//! |                     |    allocators)      |  writers
//! +---------------------+---------------------+
//! |   WAL redo log      |  Cluster metadata   |  per-slot regions,
//! |                     |   (collaborator)    |  replay at open
//! +---------------------+---------------------+
//! |       PM page allocator (16KB pages)      |  crash-consistent,
//! |                                           |  thread-partitioned
//! +-------------------------------------------+
//! |     PM regions (memory-mapped files)      |
//! +-------------------------------------------+
//! ```
//!
//! ## Durability Model
//!
//! Everything that must survive a crash lives in two PM regions: the
//! arena (allocator metadata, index leaves, key/value bytes) and the
//! redo log. Multi-word mutations are bracketed by log records; single
//! linkage words are published through aligned atomic stores with
//! persist barriers in between. The inner levels of the index are
//! volatile by design and are rebuilt from the leaf chain at open.
//!
//! ## Threading
//!
//! The crate spawns no threads. Callers register worker threads with
//! the store, obtaining a slot index that names the thread's private
//! allocator pages and log region; up to 64 threads operate
//! concurrently, readers never blocking.
//!
//! ## Quick Start
//!
//! ```ignore
//! use hill::store::{Store, StoreConfig, StoreSearch};
//!
//! let store = Store::create(StoreConfig::new("./node1", 1))?;
//! let slot = store.register_thread().expect("free slot");
//!
//! store.insert(slot, b"key", b"value")?;
//! if let StoreSearch::Found(ptr, size) = store.search(b"key") {
//!     // resolve ptr locally or over RDMA
//! }
//! ```

pub mod cluster;
pub mod index;
pub mod memory;
pub mod remote;
pub mod store;
pub mod wal;

pub use cluster::{ClusterMeta, NodeInfo, RangeGroup, MAX_NODE};
pub use index::{InsertOutcome, Olfit, TreeStats, UpdateOutcome};
pub use memory::{Allocator, PmRegion};
pub use remote::{PolymorphicPointer, RemoteMemoryAgent, RemotePointer};
pub use store::{MemoryGrant, RpcOp, Store, StoreConfig, StoreInsert, StoreSearch, StoreUpdate};
pub use wal::{LogOp, Logger};
