//! # Store Façade
//!
//! The server-side entry point of a Hill node: it owns the PM regions,
//! wires the allocator, logger, and index together, runs recovery at
//! open, and routes operations by range ownership before they touch the
//! index. Request parsing, response framing, and the RPC transport stay
//! outside the core; this module only fixes the operation tags and the
//! semantics behind them.
//!
//! ## Request Kinds
//!
//! Five operations arrive over the wire, each introduced by a one-byte
//! tag ([`RpcOp`]): `Insert`, `Search`, `Update`, `Range`, and
//! `CallForMemory` (a peer asking for a slice of this node's PM).
//!
//! ## Ownership Routing
//!
//! Writes consult the [`RangeGroup`] first: a key whose range belongs to
//! another node is answered with `NotOwner` and never reaches the index.
//! Reads serve the local index directly; memory-only replicas make
//! foreign reads legitimate. A store with no configured ranges owns
//! everything, which is the standalone and test configuration.
//!
//! ## Thread Registration
//!
//! Worker threads register with the allocator and the logger as a pair;
//! the two must agree on the slot index, and a disagreement rolls both
//! registrations back. The slot is the thread's identity for every
//! subsequent call.
//!
//! ## Recovery
//!
//! `Store::open` replays the redo log against the recovered allocator
//! (abandoning every uncommitted record), then reopens the index, which
//! rebuilds its volatile inner levels from the leaf chain.

use std::path::PathBuf;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::cluster::ClusterMeta;
use crate::index::{InsertOutcome, Olfit, TreeStats, UpdateOutcome};
use crate::memory::{Allocator, PmRegion, PAGE_SIZE};
use crate::remote::{
    PolymorphicPointer, RemoteMemoryAgent, RemotePointer, REMOTE_REGION_SIZE,
};
use crate::wal::{Logger, ReplayStats, LOG_REGION_FILE_SIZE};

/// One-byte operation tags of the request protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcOp {
    Insert = 0,
    Search = 1,
    Update = 2,
    Range = 3,
    CallForMemory = 4,
    Unknown = 5,
}

impl RpcOp {
    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => RpcOp::Insert,
            1 => RpcOp::Search,
            2 => RpcOp::Update,
            3 => RpcOp::Range,
            4 => RpcOp::CallForMemory,
            _ => RpcOp::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreInsert {
    Ok,
    RepeatInsert,
    NoMemory,
    NotOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreUpdate {
    Ok,
    NotFound,
    NoMemory,
    NotOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSearch {
    Found(PolymorphicPointer, u64),
    NotFound,
}

/// A slice of this node's PM granted to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryGrant {
    pub base: RemotePointer,
    pub size: u64,
}

pub struct StoreConfig {
    pub dir: PathBuf,
    pub node_id: u8,
    /// Arena bytes; must be a multiple of the page size.
    pub arena_size: usize,
    /// 1 GiB regions this node is willing to export to peers.
    pub export_regions: usize,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>, node_id: u8) -> Self {
        Self {
            dir: dir.into(),
            node_id,
            arena_size: 64 * 1024 * 1024,
            export_regions: 1,
        }
    }
}

pub struct Store {
    node_id: u8,
    meta: RwLock<ClusterMeta>,
    allocator: Arc<Allocator>,
    logger: Arc<Logger>,
    tree: Olfit,
    agent: RemoteMemoryAgent,
    /// Serializes allocator+logger registration so the pair agrees.
    pairing: Mutex<()>,
    /// Export regions already granted to peers.
    granted: Mutex<usize>,
    export_regions: usize,
    replay: ReplayStats,
}

const ARENA_FILE: &str = "arena.pm";
const LOG_FILE: &str = "wal.pm";

impl Store {
    /// Creates a fresh store under `config.dir`.
    pub fn create(config: StoreConfig) -> Result<Self> {
        ensure!(
            config.arena_size % PAGE_SIZE == 0,
            "arena size {} is not a multiple of the page size",
            config.arena_size
        );
        std::fs::create_dir_all(&config.dir)
            .wrap_err_with(|| format!("failed to create store directory {:?}", config.dir))?;

        let arena = Arc::new(PmRegion::create(
            config.dir.join(ARENA_FILE),
            config.arena_size,
        )?);
        let log = Arc::new(PmRegion::create(
            config.dir.join(LOG_FILE),
            LOG_REGION_FILE_SIZE,
        )?);

        let allocator = Arc::new(Allocator::create(arena.clone())?);
        let logger = Arc::new(Logger::create(log)?);

        // Bootstrap the index under a short-lived slot pair, the same
        // way a worker thread would operate.
        let slot = allocator
            .register_thread()
            .ok_or_else(|| eyre::eyre!("no free slot for bootstrap"))?;
        let l_slot = logger
            .register_thread()
            .ok_or_else(|| eyre::eyre!("no free log slot for bootstrap"))?;
        ensure!(slot == l_slot, "bootstrap slot indices disagree");
        let tree = Olfit::create(arena, allocator.clone(), logger.clone(), slot)?;
        allocator.unregister_thread(slot);
        logger.unregister_thread(l_slot);

        info!(node = config.node_id, "store created");
        Ok(Self {
            node_id: config.node_id,
            meta: RwLock::new(ClusterMeta::default()),
            allocator,
            logger,
            tree,
            agent: RemoteMemoryAgent::new(),
            pairing: Mutex::new(()),
            granted: Mutex::new(0),
            export_regions: config.export_regions,
            replay: ReplayStats::default(),
        })
    }

    /// Opens an existing store, running allocator recovery, log replay,
    /// and the index rebuild.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let arena = Arc::new(PmRegion::open(config.dir.join(ARENA_FILE))?);
        let log = Arc::new(PmRegion::open(config.dir.join(LOG_FILE))?);

        let allocator = Arc::new(Allocator::open(arena.clone())?);
        // Every record still uncommitted at open names an object that
        // never became reachable; abandon them all.
        let (logger, replay) = Logger::open(log, &allocator, |_, _| true)?;
        let logger = Arc::new(logger);

        let tree = Olfit::open(arena.clone(), allocator.clone(), logger.clone())?
            .ok_or_else(|| eyre::eyre!("arena was never bootstrapped"))?;

        info!(
            node = config.node_id,
            replayed = replay.replayed,
            abandoned = replay.abandoned,
            "store recovered"
        );
        Ok(Self {
            node_id: config.node_id,
            meta: RwLock::new(ClusterMeta::default()),
            allocator,
            logger,
            tree,
            agent: RemoteMemoryAgent::new(),
            pairing: Mutex::new(()),
            granted: Mutex::new(0),
            export_regions: config.export_regions,
            replay,
        })
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers the calling thread with the allocator and the logger,
    /// returning the shared slot index. Rolls both back if the indices
    /// disagree or either side is out of slots.
    pub fn register_thread(&self) -> Option<usize> {
        let _g = self.pairing.lock();

        let slot = self.allocator.register_thread()?;
        match self.logger.register_thread() {
            Some(l_slot) if l_slot == slot => Some(slot),
            Some(l_slot) => {
                self.allocator.unregister_thread(slot);
                self.logger.unregister_thread(l_slot);
                None
            }
            None => {
                self.allocator.unregister_thread(slot);
                None
            }
        }
    }

    pub fn unregister_thread(&self, slot: usize) {
        let _g = self.pairing.lock();
        self.allocator.unregister_thread(slot);
        self.logger.unregister_thread(slot);
    }

    // ------------------------------------------------------------------
    // Cluster metadata
    // ------------------------------------------------------------------

    /// Installs a fresh gossip snapshot, merging version-wise.
    pub fn absorb_meta(&self, newer: &ClusterMeta) {
        self.meta.write().update(newer);
    }

    /// Replaces the whole snapshot; for initial configuration.
    pub fn set_meta(&self, meta: ClusterMeta) {
        *self.meta.write() = meta;
    }

    pub fn meta(&self) -> ClusterMeta {
        self.meta.read().clone()
    }

    /// Whether this node is the primary writer for `key`. A store with
    /// no configured ranges owns everything.
    fn owns(&self, key: &[u8]) -> bool {
        let meta = self.meta.read();
        if meta.group.infos.is_empty() {
            return true;
        }
        meta.group.owner_of(key) == Some(self.node_id)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub fn insert(&self, slot: usize, key: &[u8], value: &[u8]) -> Result<StoreInsert> {
        if !self.owns(key) {
            return Ok(StoreInsert::NotOwner);
        }
        Ok(match self.tree.insert(slot, key, value)? {
            InsertOutcome::Inserted => StoreInsert::Ok,
            InsertOutcome::RepeatInsert => StoreInsert::RepeatInsert,
            InsertOutcome::NoMemory => StoreInsert::NoMemory,
        })
    }

    /// Point lookup against the local index. The value comes back as an
    /// unresolved polymorphic pointer; remote values are the caller's to
    /// fetch.
    pub fn search(&self, key: &[u8]) -> StoreSearch {
        match self.tree.search(key) {
            Some((ptr, size)) => StoreSearch::Found(ptr, size),
            None => StoreSearch::NotFound,
        }
    }

    pub fn update(&self, slot: usize, key: &[u8], value: &[u8]) -> Result<StoreUpdate> {
        if !self.owns(key) {
            return Ok(StoreUpdate::NotOwner);
        }
        Ok(match self.tree.update(slot, key, value)? {
            UpdateOutcome::Updated => StoreUpdate::Ok,
            UpdateOutcome::NotFound => StoreUpdate::NotFound,
            UpdateOutcome::NoMemory => StoreUpdate::NoMemory,
        })
    }

    /// Closed-range scan over the local index.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, PolymorphicPointer, u64)> {
        self.tree.scan(start, end)
    }

    /// Grants the next unexported 1 GiB region to a peer, or `None`
    /// when the export budget is spent.
    pub fn call_for_memory(&self) -> Option<MemoryGrant> {
        let mut granted = self.granted.lock();
        if *granted >= self.export_regions {
            return None;
        }
        let base = RemotePointer::new(self.node_id, *granted as u64 * REMOTE_REGION_SIZE);
        *granted += 1;
        Some(MemoryGrant {
            base,
            size: REMOTE_REGION_SIZE,
        })
    }

    /// Records a grant received from a peer for the given slot.
    pub fn adopt_grant(&self, slot: usize, grant: MemoryGrant) -> Result<()> {
        self.agent.add_region(slot, grant.base)
    }

    /// Allocates remote PM out of previously adopted grants.
    pub fn allocate_remote(&self, slot: usize, size: u64) -> Result<Option<RemotePointer>> {
        self.agent.allocate(slot, size)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn stats(&self) -> TreeStats {
        self.tree.stats()
    }

    pub fn replay_stats(&self) -> ReplayStats {
        self.replay
    }

    pub fn tree(&self) -> &Olfit {
        &self.tree
    }
}
