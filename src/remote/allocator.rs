//! Bump allocation over peer-granted PM regions.

use eyre::{ensure, Result};
use parking_lot::Mutex;

use super::pointer::RemotePointer;
use crate::memory::SLOT_COUNT;

/// Regions a single thread slot can hold at once.
pub const REMOTE_REGIONS: usize = 32;

/// Fixed size of one granted region.
pub const REMOTE_REGION_SIZE: u64 = 1 << 30;

const COUNTER_MASK: u64 = 0xffff_ffff;
const CURSOR_SHIFT: u32 = 32;

/// Bump allocator over one granted region.
///
/// Metadata is a 32-bit object counter and a 32-bit byte cursor packed
/// into one word so the pair updates atomically on PM. Space is only
/// reclaimed wholesale: when the counter drops to zero the cursor
/// rewinds and the region starts over.
#[derive(Debug, Clone, Copy)]
pub struct RemoteAllocator {
    base: RemotePointer,
    meta: u64,
}

impl RemoteAllocator {
    pub fn new(base: RemotePointer) -> Self {
        Self { base, meta: 0 }
    }

    #[inline]
    fn counter(&self) -> u64 {
        self.meta & COUNTER_MASK
    }

    #[inline]
    fn cursor(&self) -> u64 {
        self.meta >> CURSOR_SHIFT
    }

    /// Allocates `size` bytes; on exhaustion returns `None` and leaves
    /// the counter and cursor untouched.
    pub fn allocate(&mut self, size: u64) -> Option<RemotePointer> {
        let cursor = self.cursor();
        if cursor + size >= REMOTE_REGION_SIZE {
            return None;
        }

        let ptr = self.base.offset(cursor);
        self.meta = (self.counter() + 1) | ((cursor + size) << CURSOR_SHIFT);
        Some(ptr)
    }

    /// Drops one object. The region rewinds once nothing is live.
    pub fn free(&mut self) {
        let counter = self.counter().saturating_sub(1);
        if counter == 0 {
            self.meta = 0;
        } else {
            self.meta = counter | (self.cursor() << CURSOR_SHIFT);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.counter() == 0
    }

    #[inline]
    pub fn base(&self) -> RemotePointer {
        self.base
    }
}

#[derive(Default)]
struct SlotRegions {
    regions: Vec<RemoteAllocator>,
    /// Region currently served; allocation fails over to later ones.
    current: usize,
}

/// Per-(slot, region) matrix of remote allocators.
///
/// Each thread slot works its own region list, so allocation never
/// contends across slots; the per-slot mutex only serializes a thread
/// with the peer-grant path that appends regions.
pub struct RemoteMemoryAgent {
    slots: [Mutex<SlotRegions>; SLOT_COUNT],
}

impl RemoteMemoryAgent {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(SlotRegions::default())),
        }
    }

    /// Records a region granted by a peer for `slot`.
    pub fn add_region(&self, slot: usize, base: RemotePointer) -> Result<()> {
        ensure!(slot < SLOT_COUNT, "slot {} out of range", slot);
        let mut regions = self.slots[slot].lock();
        ensure!(
            regions.regions.len() < REMOTE_REGIONS,
            "slot {} already holds {} remote regions",
            slot,
            REMOTE_REGIONS
        );
        regions.regions.push(RemoteAllocator::new(base));
        Ok(())
    }

    /// Allocates `size` bytes of remote PM for `slot`, failing over to
    /// the next granted region when the current one is exhausted.
    /// Returns `None` when every region is full or none was granted.
    pub fn allocate(&self, slot: usize, size: u64) -> Result<Option<RemotePointer>> {
        ensure!(slot < SLOT_COUNT, "slot {} out of range", slot);
        let mut regions = self.slots[slot].lock();

        let start = regions.current;
        for idx in start..regions.regions.len() {
            if let Some(ptr) = regions.regions[idx].allocate(size) {
                regions.current = idx;
                return Ok(Some(ptr));
            }
        }
        Ok(None)
    }

    /// Releases one object previously allocated from `region_idx`.
    pub fn free(&self, slot: usize, region_idx: usize) -> Result<()> {
        ensure!(slot < SLOT_COUNT, "slot {} out of range", slot);
        let mut regions = self.slots[slot].lock();
        ensure!(
            region_idx < regions.regions.len(),
            "slot {} has no remote region {}",
            slot,
            region_idx
        );
        regions.regions[region_idx].free();
        Ok(())
    }

    pub fn region_count(&self, slot: usize) -> usize {
        self.slots[slot].lock().regions.len()
    }
}

impl Default for RemoteMemoryAgent {
    fn default() -> Self {
        Self::new()
    }
}
