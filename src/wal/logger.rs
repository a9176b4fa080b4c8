//! Redo-log regions and the per-slot logger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashSet;
use parking_lot::Mutex;
use tracing::debug;

use crate::memory::{Allocator, PmPtr, PmRegion, PmWord, PAGE_MASK, PAGE_SIZE, SLOT_COUNT};

pub const LOG_BATCH: usize = 1024;
pub const LOG_REGIONS_PER: usize = 1024;
pub const ENTRIES_PER_SLOT: usize = LOG_BATCH * LOG_REGIONS_PER;

const LOG_MAGIC: u64 = 0x1357_2468_1357_2468;

const ENTRY_SIZE: u64 = 16;
const REGION_HEADER: u64 = 16;
const REGION_STRIDE: u64 = REGION_HEADER + ENTRIES_PER_SLOT as u64 * ENTRY_SIZE;
const REGIONS_BASE: u64 = 8;

/// Bytes a log region file must provide, rounded up to whole pages.
pub const LOG_REGION_FILE_SIZE: usize = {
    let raw = REGIONS_BASE + SLOT_COUNT as u64 * REGION_STRIDE;
    (raw as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    Unknown = 0,
    Insert = 1,
    Update = 2,
    Delete = 3,
    NodeSplit = 4,
}

impl LogOp {
    fn from_u8(b: u8) -> Self {
        match b {
            1 => LogOp::Insert,
            2 => LogOp::Update,
            3 => LogOp::Delete,
            4 => LogOp::NodeSplit,
            _ => LogOp::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogStatus {
    None = 0,
    Uncommitted = 1,
    Committed = 2,
}

impl LogStatus {
    fn from_u8(b: u8) -> Self {
        match b {
            1 => LogStatus::Uncommitted,
            2 => LogStatus::Committed,
            _ => LogStatus::None,
        }
    }
}

#[inline]
fn pack_meta(op: LogOp, status: LogStatus) -> u64 {
    op as u64 | ((status as u64) << 8)
}

/// A live redo record. The allocator persists the object offset into the
/// entry's address cell before it advances any page header.
pub struct EntryHandle<'l> {
    region: &'l PmRegion,
    off: u64,
}

impl EntryHandle<'_> {
    /// The PM cell the allocator writes the object offset into.
    pub fn address_cell(&self) -> PmWord<'_> {
        self.region.word(self.off)
    }

    pub fn address(&self) -> PmPtr {
        self.region.atomic_u64(self.off).load(Ordering::Acquire)
    }

    pub fn op(&self) -> LogOp {
        let meta = self.region.atomic_u64(self.off + 8).load(Ordering::Acquire);
        LogOp::from_u8(meta as u8)
    }

    pub fn status(&self) -> LogStatus {
        let meta = self.region.atomic_u64(self.off + 8).load(Ordering::Acquire);
        LogStatus::from_u8((meta >> 8) as u8)
    }
}

/// Counts from a replay pass over the log regions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Entries examined across all regions.
    pub replayed: usize,
    /// Uncommitted entries the action abandoned.
    pub abandoned: usize,
    /// Distinct pages whose record count was rolled back.
    pub touched_pages: usize,
}

/// Per-slot redo logger over a dedicated PM region.
///
/// Slot indices are shared with the [`Allocator`]; callers register with
/// both and roll back if the indices disagree.
pub struct Logger {
    region: Arc<PmRegion>,
    registration: Mutex<()>,
    registered: [AtomicBool; SLOT_COUNT],
}

impl Logger {
    /// Initializes fresh log regions.
    pub fn create(region: Arc<PmRegion>) -> Result<Self> {
        ensure!(
            region.len() >= LOG_REGION_FILE_SIZE,
            "log region of {} bytes is smaller than the required {}",
            region.len(),
            LOG_REGION_FILE_SIZE
        );

        let logger = Self::attach(region);
        logger.init_regions();
        Ok(logger)
    }

    /// Opens existing log regions and replays them.
    ///
    /// Each entry in `[checkpointed, cursor)` that is still uncommitted
    /// names a partially created object; `action(address, op)` decides
    /// whether to abandon it (`true`) or keep it. Abandoned allocations
    /// are rolled back through the allocator, and the regions are then
    /// reset for the new run.
    ///
    /// A magic mismatch means no log was ever written here; the regions
    /// are initialized fresh and the replay is empty.
    pub fn open(
        region: Arc<PmRegion>,
        allocator: &Allocator,
        mut action: impl FnMut(PmPtr, LogOp) -> bool,
    ) -> Result<(Self, ReplayStats)> {
        ensure!(
            region.len() >= LOG_REGION_FILE_SIZE,
            "log region of {} bytes is smaller than the required {}",
            region.len(),
            LOG_REGION_FILE_SIZE
        );

        let logger = Self::attach(region);
        let mut stats = ReplayStats::default();

        if logger.magic() != LOG_MAGIC {
            logger.init_regions();
            return Ok((logger, stats));
        }

        let mut touched: HashSet<PmPtr> = HashSet::new();
        for slot in 0..SLOT_COUNT {
            let checkpointed = logger.cursor_word(slot, 0).get();
            let cursor = logger.cursor_word(slot, 8).get();
            if cursor > ENTRIES_PER_SLOT as u64 || checkpointed > cursor {
                // Cursors beyond the region are corruption, not replay.
                eyre::bail!(
                    "log region {} cursors are corrupt ({} / {})",
                    slot,
                    checkpointed,
                    cursor
                );
            }

            for idx in checkpointed..cursor {
                stats.replayed += 1;
                let entry = logger.entry(slot, idx);
                if entry.status() != LogStatus::Uncommitted {
                    continue;
                }
                let (address, op) = (entry.address(), entry.op());
                if action(address, op) {
                    stats.abandoned += 1;
                    if allocator.undo_allocation(address) {
                        touched.insert(address & PAGE_MASK);
                    }
                }
            }
        }
        stats.touched_pages = touched.len();
        debug!(
            replayed = stats.replayed,
            abandoned = stats.abandoned,
            pages = stats.touched_pages,
            "log replay complete"
        );

        logger.init_regions();
        Ok((logger, stats))
    }

    fn attach(region: Arc<PmRegion>) -> Self {
        Self {
            region,
            registration: Mutex::new(()),
            registered: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    fn magic(&self) -> u64 {
        self.region.atomic_u64(0).load(Ordering::Acquire)
    }

    /// Resets cursors and stamps the magic. Entry slots are not wiped;
    /// nothing past a zero cursor is ever read.
    fn init_regions(&self) {
        for slot in 0..SLOT_COUNT {
            self.cursor_word(slot, 0).set(0);
            self.cursor_word(slot, 8).set(0);
        }
        self.region.word(0).set(LOG_MAGIC);
    }

    #[inline]
    fn region_off(slot: usize) -> u64 {
        REGIONS_BASE + slot as u64 * REGION_STRIDE
    }

    /// `field` is 0 for `checkpointed`, 8 for `cursor`.
    #[inline]
    fn cursor_word(&self, slot: usize, field: u64) -> PmWord<'_> {
        self.region.word(Self::region_off(slot) + field)
    }

    #[inline]
    fn entry_off(slot: usize, idx: u64) -> u64 {
        Self::region_off(slot) + REGION_HEADER + idx * ENTRY_SIZE
    }

    fn entry(&self, slot: usize, idx: u64) -> EntryHandle<'_> {
        EntryHandle {
            region: &self.region,
            off: Self::entry_off(slot, idx),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Claims a free slot index. The caller pairs this with the
    /// allocator's registration and rolls both back on a mismatch.
    pub fn register_thread(&self) -> Option<usize> {
        let _g = self.registration.lock();
        for t in 0..SLOT_COUNT {
            if !self.registered[t].load(Ordering::Relaxed) {
                self.registered[t].store(true, Ordering::Relaxed);
                return Some(t);
            }
        }
        None
    }

    pub fn unregister_thread(&self, slot: usize) {
        if slot >= SLOT_COUNT {
            return;
        }
        let _g = self.registration.lock();
        self.registered[slot].store(false, Ordering::Relaxed);
    }

    #[inline]
    fn ensure_registered(&self, slot: usize) -> Result<()> {
        ensure!(
            slot < SLOT_COUNT && self.registered[slot].load(Ordering::Relaxed),
            "slot {} is not registered with the logger",
            slot
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entry lifecycle
    // ------------------------------------------------------------------

    /// Opens a new redo record for `op` and returns its handle.
    ///
    /// The previous record of the slot must be settled: one uncommitted
    /// entry per slot is the protocol's cap, and violating it is a caller
    /// defect, not a runtime condition.
    pub fn make_log(&self, slot: usize, op: LogOp) -> Result<EntryHandle<'_>> {
        self.ensure_registered(slot)?;

        let cursor = self.cursor_word(slot, 8);
        let idx = cursor.get();
        ensure!(
            idx < ENTRIES_PER_SLOT as u64,
            "log region {} is full ({} entries)",
            slot,
            ENTRIES_PER_SLOT
        );
        if idx > self.cursor_word(slot, 0).get() {
            ensure!(
                self.entry(slot, idx - 1).status() != LogStatus::Uncommitted,
                "slot {} already has an uncommitted log entry",
                slot
            );
        }

        let off = Self::entry_off(slot, idx);
        self.region.word(off).set(0);
        self.region
            .word(off + 8)
            .set(pack_meta(op, LogStatus::Uncommitted));
        cursor.set(idx + 1);

        Ok(EntryHandle {
            region: &self.region,
            off,
        })
    }

    /// Commits the slot's most recent record.
    pub fn commit(&self, slot: usize) -> Result<()> {
        self.settle(slot, LogStatus::Committed)
    }

    /// Explicitly discards the slot's most recent record, used when the
    /// guarded operation never started (allocation failure).
    pub fn abort(&self, slot: usize) -> Result<()> {
        self.settle(slot, LogStatus::None)
    }

    fn settle(&self, slot: usize, status: LogStatus) -> Result<()> {
        self.ensure_registered(slot)?;

        let idx = self.cursor_word(slot, 8).get();
        ensure!(idx > 0, "slot {} has no log entry to settle", slot);

        let entry = self.entry(slot, idx - 1);
        ensure!(
            entry.status() == LogStatus::Uncommitted,
            "slot {} entry {} is not uncommitted",
            slot,
            idx - 1
        );
        let op = entry.op();
        self.region
            .word(entry.off + 8)
            .set(pack_meta(op, status));
        Ok(())
    }

    /// Advances the checkpoint past every settled entry, shrinking the
    /// window the next replay has to walk.
    pub fn checkpoint(&self, slot: usize) -> Result<()> {
        self.ensure_registered(slot)?;

        let cursor = self.cursor_word(slot, 8).get();
        if cursor > 0 {
            ensure!(
                self.entry(slot, cursor - 1).status() != LogStatus::Uncommitted,
                "cannot checkpoint slot {} past an uncommitted entry",
                slot
            );
        }
        self.cursor_word(slot, 0).set(cursor);
        Ok(())
    }

    /// Index of the slot's most recent entry, for diagnostics.
    pub fn cursor(&self, slot: usize) -> u64 {
        self.cursor_word(slot, 8).get()
    }

    pub fn checkpointed(&self, slot: usize) -> u64 {
        self.cursor_word(slot, 0).get()
    }
}
