//! # Crash-Consistent Page Allocator
//!
//! The allocator manages a PM arena at 16KB page granularity. Its own
//! metadata lives in page 0 of the arena it manages, so an arena carries
//! everything needed to repair itself after a crash.
//!
//! ## Thread Slots
//!
//! Threads register to obtain a slot in `[0, SLOT_COUNT)`. Each slot owns
//! a busy page (the current bump target), a private free-page list, a
//! pending page parked at unregistration, and two staging words that make
//! `free()` repairable. Fine-grained allocation happens inside the busy
//! page with no cross-thread coordination; only free-list refills take
//! the arena-wide mutex.
//!
//! ## Refill Order
//!
//! When a slot's free list runs dry, recycled pages are preferred:
//! a run of [`PREALLOC`] pages is detached from the global freelist.
//! Only when the freelist is empty are `PREALLOC + 1` fresh pages carved
//! from the watermark and stitched into a chain before publication.
//!
//! ## Recovery Rules
//!
//! Every multi-word transition publishes through a staging equality that
//! recovery can observe. The repair rules run in a fixed order and are
//! idempotent; running recovery twice is a no-op:
//!
//! | Observation                     | In-flight operation | Repair |
//! |---------------------------------|---------------------|--------|
//! | `pending[t] == busy[t]`         | unregister          | splice busy onto `free[t]`, clear busy and pending |
//! | `free[t] == freelist` head      | freelist detach     | advance `freelist` past the run, cut the run |
//! | `free[t] == cursor`             | heap carve          | advance `cursor` by `PREALLOC + 1` pages |
//! | `busy[t] == free[t]` head       | busy pop            | advance `free[t]`, null the popped `next` |
//! | `free_staged[t]` set            | free                | link the staged page if it emptied, clear staging |
//!
//! A magic mismatch means the arena was never initialized; structural
//! inconsistencies beyond the rules (watermark out of bounds, misaligned
//! list heads) are corruption and abort startup.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;
use tracing::debug;

use super::page::PageRef;
use super::region::{PmRegion, PmWord};
use super::{
    PmPtr, ALLOCATOR_MAGIC, MAX_ALLOC_SIZE, PAGE_MASK, PAGE_SIZE, PM_NULL, PREALLOC,
    SLOT_AVAILABLE, SLOT_COUNT,
};

/// Arena metadata at the base of the region. Every field is an 8-byte PM
/// word stored atomically and persisted individually.
#[repr(C)]
struct Header {
    magic: AtomicU64,
    total_size: AtomicU64,
    /// First usable page offset (one page past the metadata page).
    base: AtomicU64,
    /// Watermark: lowest never-used page offset.
    cursor: AtomicU64,
    /// Head of the global recycled-page list.
    freelist: AtomicU64,
    /// Per-slot free-list heads; `SLOT_AVAILABLE` marks an open slot.
    free: [AtomicU64; SLOT_COUNT],
    /// Page parked by unregistration, promoted on the next registration.
    pending: [AtomicU64; SLOT_COUNT],
    /// Current bump target per slot.
    busy: [AtomicU64; SLOT_COUNT],
    /// Page being freed, staged so a crash cannot leak it.
    to_be_freed: [AtomicU64; SLOT_COUNT],
    /// Written before a page is staged in `to_be_freed`, cleared after it
    /// is linked; the recovery trigger for in-flight frees.
    free_staged: [AtomicU64; SLOT_COUNT],
}

const _: () = assert!(std::mem::size_of::<Header>() == 40 + 5 * SLOT_COUNT * 8);
const _: () = assert!(std::mem::size_of::<Header>() <= super::STORE_META_OFFSET as usize);

pub struct Allocator {
    region: Arc<PmRegion>,
    /// Arena-wide lock for free-list refills and freelist folds.
    refill: Mutex<()>,
    /// Registration lock; slot scans must be mutually exclusive.
    registration: Mutex<()>,
    /// Slots claimed by live threads of this process. Volatile on
    /// purpose: a crash unregisters everyone.
    registered: [AtomicBool; SLOT_COUNT],
}

impl Allocator {
    /// Initializes a fresh arena in `region` and returns the allocator.
    pub fn create(region: Arc<PmRegion>) -> Result<Self> {
        ensure!(
            region.len() >= 2 * PAGE_SIZE,
            "arena of {} bytes cannot hold metadata and at least one page",
            region.len()
        );

        let alloc = Self::attach(region);
        let hdr = alloc.header();

        alloc.store(&hdr.total_size, alloc.region.len() as u64);
        alloc.store(&hdr.base, PAGE_SIZE as u64);
        alloc.store(&hdr.cursor, PAGE_SIZE as u64);
        alloc.store(&hdr.freelist, PM_NULL);
        for t in 0..SLOT_COUNT {
            alloc.store(&hdr.free[t], SLOT_AVAILABLE);
            alloc.store(&hdr.pending[t], PM_NULL);
            alloc.store(&hdr.busy[t], PM_NULL);
            alloc.store(&hdr.to_be_freed[t], PM_NULL);
            alloc.store(&hdr.free_staged[t], 0);
        }
        // The magic goes last; a crash during initialization leaves an
        // arena that open() refuses.
        alloc.store(&hdr.magic, ALLOCATOR_MAGIC);

        Ok(alloc)
    }

    /// Attaches to an existing arena, validates it, and runs recovery.
    pub fn open(region: Arc<PmRegion>) -> Result<Self> {
        let alloc = Self::attach(region);
        let hdr = alloc.header();

        ensure!(
            hdr.magic.load(Ordering::Acquire) == ALLOCATOR_MAGIC,
            "region carries no allocator (magic mismatch)"
        );
        alloc.validate()?;
        alloc.recover();
        Ok(alloc)
    }

    fn attach(region: Arc<PmRegion>) -> Self {
        Self {
            region,
            refill: Mutex::new(()),
            registration: Mutex::new(()),
            registered: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    #[inline]
    fn header(&self) -> &Header {
        // SAFETY: the header is at offset 0 of a mapping that is at least
        // OS-page-aligned and two pages long (checked at create/open);
        // all fields are atomics, so shared access is sound.
        unsafe { &*(self.region.base() as *const Header) }
    }

    #[inline]
    fn store(&self, word: &AtomicU64, value: u64) {
        word.store(value, Ordering::Release);
        self.region.persist(0, 8);
    }

    pub fn region(&self) -> &Arc<PmRegion> {
        &self.region
    }

    fn validate(&self) -> Result<()> {
        let hdr = self.header();
        let len = self.region.len() as u64;
        let base = hdr.base.load(Ordering::Acquire);
        let cursor = hdr.cursor.load(Ordering::Acquire);

        ensure!(
            hdr.total_size.load(Ordering::Acquire) == len,
            "arena header records size {} but the region is {} bytes",
            hdr.total_size.load(Ordering::Acquire),
            len
        );
        ensure!(
            base == PAGE_SIZE as u64,
            "arena base {:#x} is not the first page",
            base
        );
        ensure!(
            cursor >= base && cursor <= len && (cursor & !PAGE_MASK) == 0,
            "arena watermark {:#x} is corrupt",
            cursor
        );

        let head_ok = |head: u64| {
            head == PM_NULL
                || head == SLOT_AVAILABLE
                || ((head & !PAGE_MASK) == 0 && head >= base && head < len)
        };
        ensure!(
            head_ok(hdr.freelist.load(Ordering::Acquire)),
            "arena freelist head is corrupt"
        );
        for t in 0..SLOT_COUNT {
            ensure!(
                head_ok(hdr.free[t].load(Ordering::Acquire))
                    && head_ok(hdr.busy[t].load(Ordering::Acquire))
                    && head_ok(hdr.pending[t].load(Ordering::Acquire))
                    && head_ok(hdr.to_be_freed[t].load(Ordering::Acquire)),
                "slot {} carries a corrupt page pointer",
                t
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Claims a free slot, promoting any pending page into the busy
    /// position. Returns `None` when all slots are taken.
    pub fn register_thread(&self) -> Option<usize> {
        let _g = self.registration.lock();
        let hdr = self.header();

        for t in 0..SLOT_COUNT {
            if self.registered[t].load(Ordering::Relaxed) {
                continue;
            }
            let free = hdr.free[t].load(Ordering::Acquire);
            let busy = hdr.busy[t].load(Ordering::Acquire);
            if free != SLOT_AVAILABLE && busy != PM_NULL {
                // Claimed by a previous run that never unregistered.
                continue;
            }

            if free == SLOT_AVAILABLE {
                self.store(&hdr.free[t], PM_NULL);
            }
            let pending = hdr.pending[t].load(Ordering::Acquire);
            if pending != PM_NULL {
                self.store(&hdr.busy[t], pending);
                self.store(&hdr.pending[t], PM_NULL);
            }
            self.registered[t].store(true, Ordering::Relaxed);
            return Some(t);
        }
        None
    }

    /// Parks the slot's busy page and releases the slot. A second call
    /// for the same slot is a no-op.
    pub fn unregister_thread(&self, slot: usize) {
        if slot >= SLOT_COUNT {
            return;
        }
        let _g = self.registration.lock();
        let hdr = self.header();

        let busy = hdr.busy[slot].load(Ordering::Acquire);
        if busy != PM_NULL {
            // pending is written first; recovery treats equality with
            // busy as an unregistration to finish.
            self.store(&hdr.pending[slot], busy);
            self.store(&hdr.busy[slot], PM_NULL);
        }
        self.registered[slot].store(false, Ordering::Relaxed);
    }

    #[inline]
    fn ensure_registered(&self, slot: usize) -> Result<()> {
        ensure!(
            slot < SLOT_COUNT && self.registered[slot].load(Ordering::Relaxed),
            "slot {} is not registered with the allocator",
            slot
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates `size` bytes from the slot's pages.
    ///
    /// When `dest` is given, the object offset is written and persisted
    /// there before the owning page's header advances; this is the hook
    /// the redo log uses so recovery can see in-flight allocations.
    ///
    /// Returns `Ok(None)` when the arena is exhausted. A size of zero or
    /// beyond one page is a caller defect and fails the `Result`.
    pub fn allocate(
        &self,
        slot: usize,
        size: usize,
        dest: Option<&PmWord<'_>>,
    ) -> Result<Option<PmPtr>> {
        self.ensure_registered(slot)?;
        ensure!(
            size > 0 && size <= MAX_ALLOC_SIZE,
            "allocation of {} bytes is outside (0, {}]",
            size,
            MAX_ALLOC_SIZE
        );

        if let Some(ptr) = self.bump_in_busy(slot, size, dest) {
            return Ok(Some(ptr));
        }

        {
            let _g = self.refill.lock();
            let hdr = self.header();
            if hdr.free[slot].load(Ordering::Acquire) == PM_NULL
                && !self.refill_from_freelist(slot)
                && !self.carve_from_heap(slot)
            {
                return Ok(None);
            }
        }

        self.pop_free_into_busy(slot);
        // A page straight off a free list is empty, so the bump fits.
        Ok(self.bump_in_busy(slot, size, dest))
    }

    fn bump_in_busy(&self, slot: usize, size: usize, dest: Option<&PmWord<'_>>) -> Option<PmPtr> {
        let busy = self.header().busy[slot].load(Ordering::Acquire);
        if busy == PM_NULL {
            return None;
        }
        let page = PageRef::at(&self.region, busy);
        let ptr = page.peek_bump(size)?;
        if let Some(dest) = dest {
            dest.set(ptr);
        }
        page.commit_bump(size);
        Some(ptr)
    }

    /// Detaches a run of up to `PREALLOC` recycled pages into the slot's
    /// free list. Caller holds the refill lock.
    fn refill_from_freelist(&self, slot: usize) -> bool {
        let hdr = self.header();
        let head = hdr.freelist.load(Ordering::Acquire);
        if head == PM_NULL {
            return false;
        }

        let end = self.freelist_run_end(head);
        let rest = PageRef::at(&self.region, end).next();

        // Publication order backs the "free head equals freelist head"
        // recovery rule.
        self.store(&hdr.free[slot], head);
        self.store(&hdr.freelist, rest);
        PageRef::at(&self.region, end).set_next(PM_NULL);
        true
    }

    /// Last page of the detach run starting at `head`. Recovery walks the
    /// identical run, so the two always agree on its length.
    fn freelist_run_end(&self, head: PmPtr) -> PmPtr {
        let mut end = head;
        for _ in 1..PREALLOC {
            let next = PageRef::at(&self.region, end).next();
            if next == PM_NULL {
                break;
            }
            end = next;
        }
        end
    }

    /// Carves `PREALLOC + 1` fresh pages from the watermark, stitching
    /// the chain before publishing it. Caller holds the refill lock.
    fn carve_from_heap(&self, slot: usize) -> bool {
        let hdr = self.header();
        let cursor = hdr.cursor.load(Ordering::Acquire);
        let need = ((PREALLOC + 1) * PAGE_SIZE) as u64;

        if cursor + need > self.region.len() as u64 {
            return false;
        }

        let mut off = cursor;
        for _ in 0..PREALLOC {
            PageRef::at(&self.region, off).init(off + PAGE_SIZE as u64);
            off += PAGE_SIZE as u64;
        }
        PageRef::at(&self.region, off).init(PM_NULL);

        // Chain is durable before it becomes reachable; the store order
        // backs the "free head equals watermark" recovery rule.
        self.store(&hdr.free[slot], cursor);
        self.store(&hdr.cursor, cursor + need);
        true
    }

    fn pop_free_into_busy(&self, slot: usize) {
        let hdr = self.header();
        let head = hdr.free[slot].load(Ordering::Acquire);
        debug_assert_ne!(head, PM_NULL);

        let page = PageRef::at(&self.region, head);
        self.store(&hdr.busy[slot], head);
        self.store(&hdr.free[slot], page.next());
        page.set_next(PM_NULL);
    }

    // ------------------------------------------------------------------
    // Free
    // ------------------------------------------------------------------

    /// Releases the object at `ptr`. When the owning page's record count
    /// reaches zero the page is reset and prepended to the slot's free
    /// list, staged so a crash at any point neither leaks nor doubly
    /// links it.
    pub fn free(&self, slot: usize, ptr: PmPtr) -> Result<()> {
        self.ensure_registered(slot)?;
        if ptr == PM_NULL {
            return Ok(());
        }

        let hdr = self.header();
        let page = PageRef::owning(&self.region, ptr);

        self.store(&hdr.free_staged[slot], 1);
        self.store(&hdr.to_be_freed[slot], page.offset());

        if page.release_record() == 0 {
            page.reset_cursor();
            // A page that is still some slot's bump target keeps serving
            // allocations in place instead of entering a free list twice.
            if !self.is_busy_anywhere(page.offset()) {
                page.set_next(hdr.free[slot].load(Ordering::Acquire));
                self.store(&hdr.free[slot], page.offset());
            }
        }

        self.store(&hdr.to_be_freed[slot], PM_NULL);
        self.store(&hdr.free_staged[slot], 0);
        Ok(())
    }

    fn is_busy_anywhere(&self, page: PmPtr) -> bool {
        let hdr = self.header();
        (0..SLOT_COUNT).any(|t| hdr.busy[t].load(Ordering::Acquire) == page)
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Replays the repair rules. Runs at open, before any thread
    /// registers; a second run observes none of the staging equalities
    /// and changes nothing.
    fn recover(&self) {
        self.recover_pending();
        self.recover_freelist_detach();
        self.recover_heap_carve();
        self.recover_busy_pop();
        // A pending promotion can only surface once the busy slot is
        // settled, so the rule runs again.
        self.recover_pending();
        self.recover_orphan_busy();
        self.recover_staged_free();
    }

    /// Every thread is dead at recovery time, so a busy page that the
    /// rules above left in place is an orphan: park it the way an
    /// unregistration would, making the slot claimable again and the
    /// page promotable by the next registrant.
    fn recover_orphan_busy(&self) {
        let hdr = self.header();
        for t in 0..SLOT_COUNT {
            let busy = hdr.busy[t].load(Ordering::Acquire);
            if busy == PM_NULL {
                continue;
            }
            debug!(slot = t, page = busy, "parking orphaned busy page");
            self.store(&hdr.pending[t], busy);
            self.store(&hdr.busy[t], PM_NULL);
        }
    }

    fn recover_pending(&self) {
        let hdr = self.header();
        for t in 0..SLOT_COUNT {
            let pending = hdr.pending[t].load(Ordering::Acquire);
            let busy = hdr.busy[t].load(Ordering::Acquire);
            if pending == PM_NULL || pending != busy {
                continue;
            }
            debug!(slot = t, page = pending, "finishing in-flight unregistration");
            let free = self.slot_free_head(t);
            PageRef::at(&self.region, busy).set_next(free);
            self.store(&hdr.free[t], busy);
            self.store(&hdr.busy[t], PM_NULL);
            // Cleared so a later registration cannot promote a page that
            // now lives on the free list.
            self.store(&hdr.pending[t], PM_NULL);
        }
    }

    fn recover_freelist_detach(&self) {
        let hdr = self.header();
        for t in 0..SLOT_COUNT {
            let free = hdr.free[t].load(Ordering::Acquire);
            let head = hdr.freelist.load(Ordering::Acquire);
            if free == PM_NULL || free == SLOT_AVAILABLE || free != head {
                continue;
            }
            debug!(slot = t, head, "finishing in-flight freelist detach");
            let end = self.freelist_run_end(head);
            self.store(&hdr.freelist, PageRef::at(&self.region, end).next());
            PageRef::at(&self.region, end).set_next(PM_NULL);
        }
    }

    fn recover_heap_carve(&self) {
        let hdr = self.header();
        for t in 0..SLOT_COUNT {
            let free = hdr.free[t].load(Ordering::Acquire);
            if free == PM_NULL || free == SLOT_AVAILABLE {
                continue;
            }
            if free == hdr.cursor.load(Ordering::Acquire) {
                debug!(slot = t, watermark = free, "finishing in-flight heap carve");
                let need = ((PREALLOC + 1) * PAGE_SIZE) as u64;
                self.store(&hdr.cursor, free + need);
            }
        }
    }

    fn recover_busy_pop(&self) {
        let hdr = self.header();
        for t in 0..SLOT_COUNT {
            let busy = hdr.busy[t].load(Ordering::Acquire);
            if busy == PM_NULL || busy != hdr.free[t].load(Ordering::Acquire) {
                continue;
            }
            debug!(slot = t, page = busy, "finishing in-flight busy pop");
            let page = PageRef::at(&self.region, busy);
            self.store(&hdr.free[t], page.next());
            page.set_next(PM_NULL);
        }
    }

    fn recover_staged_free(&self) {
        let hdr = self.header();
        for t in 0..SLOT_COUNT {
            if hdr.free_staged[t].load(Ordering::Acquire) == 0 {
                continue;
            }
            let staged = hdr.to_be_freed[t].load(Ordering::Acquire);
            if staged != PM_NULL {
                let page = PageRef::at(&self.region, staged);
                let free = self.slot_free_head(t);
                if page.records() == 0 && free != staged && !self.is_busy_anywhere(staged) {
                    debug!(slot = t, page = staged, "finishing in-flight free");
                    page.reset_cursor();
                    page.set_next(free);
                    self.store(&hdr.free[t], staged);
                }
                self.store(&hdr.to_be_freed[t], PM_NULL);
            }
            self.store(&hdr.free_staged[t], 0);
        }
    }

    /// Free-list head of a slot with the open-slot sentinel normalized
    /// away, for recovery paths that link onto the list.
    fn slot_free_head(&self, slot: usize) -> PmPtr {
        let free = self.header().free[slot].load(Ordering::Acquire);
        if free == SLOT_AVAILABLE {
            PM_NULL
        } else {
            free
        }
    }

    /// Undoes an allocation observed in an uncommitted redo record.
    ///
    /// When the owning page's cursor already advanced past `ptr` the
    /// record count is rolled back; a page that empties is folded into
    /// the global freelist. Returns whether a rollback happened.
    pub fn undo_allocation(&self, ptr: PmPtr) -> bool {
        if ptr == PM_NULL {
            return false;
        }
        let page = PageRef::owning(&self.region, ptr);
        let in_page = ptr - page.offset();

        if page.cursor() <= in_page {
            // The header never advanced; there is nothing to undo.
            return false;
        }

        if page.release_record() == 0 {
            let _g = self.refill.lock();
            let hdr = self.header();
            // Only fold pages no slot currently owns; a busy, parked, or
            // listed page stays where it is and is reused in place.
            let owned = (0..SLOT_COUNT).any(|t| {
                hdr.busy[t].load(Ordering::Acquire) == page.offset()
                    || hdr.pending[t].load(Ordering::Acquire) == page.offset()
                    || hdr.free[t].load(Ordering::Acquire) == page.offset()
            });
            if !owned {
                page.reset_cursor();
                page.set_next(hdr.freelist.load(Ordering::Acquire));
                self.store(&hdr.freelist, page.offset());
            } else {
                page.reset_cursor();
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Introspection (tests and diagnostics)
    // ------------------------------------------------------------------

    pub fn watermark(&self) -> PmPtr {
        self.header().cursor.load(Ordering::Acquire)
    }

    pub fn busy_page(&self, slot: usize) -> PmPtr {
        self.header().busy[slot].load(Ordering::Acquire)
    }

    pub fn free_head(&self, slot: usize) -> PmPtr {
        self.header().free[slot].load(Ordering::Acquire)
    }

    pub fn global_freelist(&self) -> PmPtr {
        self.header().freelist.load(Ordering::Acquire)
    }

    /// Live-record count of the page owning `ptr`.
    pub fn page_records(&self, ptr: PmPtr) -> u64 {
        PageRef::owning(&self.region, ptr).records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn arena(pages: usize) -> (tempfile::TempDir, Arc<PmRegion>) {
        let dir = tempdir().unwrap();
        let region =
            Arc::new(PmRegion::create(dir.path().join("arena"), pages * PAGE_SIZE).unwrap());
        (dir, region)
    }

    #[test]
    fn create_then_open_keeps_watermark() {
        let (_dir, region) = arena(64);
        {
            let alloc = Allocator::create(region.clone()).unwrap();
            let slot = alloc.register_thread().unwrap();
            alloc.allocate(slot, 128, None).unwrap().unwrap();
        }
        let alloc = Allocator::open(region.clone()).unwrap();
        assert_eq!(
            alloc.watermark(),
            (1 + PREALLOC as u64 + 1) * PAGE_SIZE as u64
        );
    }

    #[test]
    fn open_uninitialized_region_fails() {
        let (_dir, region) = arena(4);
        assert!(Allocator::open(region).is_err());
    }

    #[test]
    fn register_all_slots_then_none() {
        let (_dir, region) = arena(4);
        let alloc = Allocator::create(region).unwrap();

        for _ in 0..SLOT_COUNT {
            assert!(alloc.register_thread().is_some());
        }
        assert!(alloc.register_thread().is_none());
    }

    #[test]
    fn unregister_parks_busy_and_reregister_promotes() {
        let (_dir, region) = arena(64);
        let alloc = Allocator::create(region).unwrap();

        let slot = alloc.register_thread().unwrap();
        alloc.allocate(slot, 64, None).unwrap().unwrap();
        let busy = alloc.busy_page(slot);
        assert_ne!(busy, PM_NULL);

        alloc.unregister_thread(slot);
        assert_eq!(alloc.busy_page(slot), PM_NULL);

        let again = alloc.register_thread().unwrap();
        assert_eq!(again, slot);
        assert_eq!(alloc.busy_page(slot), busy);
    }

    #[test]
    fn allocate_rejects_invalid_sizes() {
        let (_dir, region) = arena(64);
        let alloc = Allocator::create(region).unwrap();
        let slot = alloc.register_thread().unwrap();

        assert!(alloc.allocate(slot, 0, None).is_err());
        assert!(alloc.allocate(slot, PAGE_SIZE, None).is_err());
        assert!(alloc
            .allocate(slot, MAX_ALLOC_SIZE, None)
            .unwrap()
            .is_some());
    }

    #[test]
    fn exhaustion_returns_none() {
        // Metadata page plus a single refill worth of pages.
        let (_dir, region) = arena(1 + PREALLOC + 1);
        let alloc = Allocator::create(region).unwrap();
        let slot = alloc.register_thread().unwrap();

        for _ in 0..(PREALLOC + 1) {
            assert!(alloc
                .allocate(slot, MAX_ALLOC_SIZE, None)
                .unwrap()
                .is_some());
        }
        assert!(alloc
            .allocate(slot, MAX_ALLOC_SIZE, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn free_recycles_page_through_slot_list() {
        let (_dir, region) = arena(64);
        let alloc = Allocator::create(region).unwrap();
        let slot = alloc.register_thread().unwrap();

        // Fill the first page completely so the second allocation moves
        // the bump target to a new page.
        let a = alloc.allocate(slot, MAX_ALLOC_SIZE, None).unwrap().unwrap();
        let b = alloc.allocate(slot, 64, None).unwrap().unwrap();
        let page = a & PAGE_MASK;
        assert_ne!(page, b & PAGE_MASK);
        assert_eq!(alloc.page_records(a), 1);

        alloc.free(slot, a).unwrap();
        assert_eq!(alloc.page_records(a), 0);
        // The emptied page went back onto the slot's free list head.
        assert_eq!(alloc.free_head(slot), page);
    }

    #[test]
    fn free_of_busy_page_resets_in_place() {
        let (_dir, region) = arena(64);
        let alloc = Allocator::create(region).unwrap();
        let slot = alloc.register_thread().unwrap();

        let a = alloc.allocate(slot, 64, None).unwrap().unwrap();
        let busy = alloc.busy_page(slot);
        let free_before = alloc.free_head(slot);

        alloc.free(slot, a).unwrap();
        // The bump target emptied but stays in place and off the lists.
        assert_eq!(alloc.busy_page(slot), busy);
        assert_eq!(alloc.free_head(slot), free_before);
        assert_eq!(alloc.page_records(a), 0);
    }

    #[test]
    fn distinct_slots_never_overlap() {
        let (_dir, region) = arena(256);
        let alloc = Arc::new(Allocator::create(region).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || {
                let slot = alloc.register_thread().unwrap();
                let mut got = Vec::new();
                for _ in 0..200 {
                    got.push(alloc.allocate(slot, 96, None).unwrap().unwrap());
                }
                got
            }));
        }

        let mut all: Vec<PmPtr> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);

        // 96 rounds to 96; no two results closer than the aligned size.
        for pair in all.windows(2) {
            assert!(pair[1] - pair[0] >= 96);
        }
    }

    #[test]
    fn recovery_finishes_interrupted_unregistration() {
        let (_dir, region) = arena(64);
        let alloc = Allocator::create(region.clone()).unwrap();
        let slot = alloc.register_thread().unwrap();
        alloc.allocate(slot, 64, None).unwrap().unwrap();
        let busy = alloc.busy_page(slot);

        // Simulate a crash between the two unregistration stores: pending
        // written, busy not yet cleared.
        let hdr = alloc.header();
        alloc.store(&hdr.pending[slot], busy);
        drop(alloc);

        let alloc = Allocator::open(region).unwrap();
        assert_eq!(alloc.busy_page(slot), PM_NULL);
        assert_eq!(alloc.free_head(slot), busy);
        let hdr = alloc.header();
        assert_eq!(hdr.pending[slot].load(Ordering::Acquire), PM_NULL);
    }

    #[test]
    fn recovery_finishes_interrupted_heap_carve() {
        let (_dir, region) = arena(64);
        let alloc = Allocator::create(region.clone()).unwrap();
        let slot = alloc.register_thread().unwrap();
        alloc.allocate(slot, 64, None).unwrap().unwrap();

        // Simulate a crash after publishing the carved chain but before
        // the watermark advanced.
        let watermark = alloc.watermark();
        let hdr = alloc.header();
        let mut off = watermark;
        for _ in 0..PREALLOC {
            PageRef::at(alloc.region(), off).init(off + PAGE_SIZE as u64);
            off += PAGE_SIZE as u64;
        }
        PageRef::at(alloc.region(), off).init(PM_NULL);
        alloc.store(&hdr.free[slot], watermark);
        drop(alloc);

        let alloc = Allocator::open(region).unwrap();
        assert_eq!(
            alloc.watermark(),
            watermark + ((PREALLOC + 1) * PAGE_SIZE) as u64
        );
        assert_eq!(alloc.free_head(slot), watermark);
    }

    #[test]
    fn recovery_finishes_interrupted_busy_pop() {
        let (_dir, region) = arena(64);
        let alloc = Allocator::create(region.clone()).unwrap();
        let slot = alloc.register_thread().unwrap();
        alloc.allocate(slot, 64, None).unwrap().unwrap();

        // Simulate a crash right after busy took the free-list head.
        let head = alloc.free_head(slot);
        assert_ne!(head, PM_NULL);
        let hdr = alloc.header();
        alloc.store(&hdr.busy[slot], head);
        drop(alloc);

        let alloc = Allocator::open(region).unwrap();
        // The pop was finished, then the orphaned busy page was parked;
        // re-registration promotes it back.
        assert_eq!(alloc.busy_page(slot), PM_NULL);
        assert_ne!(alloc.free_head(slot), head);
        assert_eq!(PageRef::at(alloc.region(), head).next(), PM_NULL);

        let again = alloc.register_thread().unwrap();
        assert_eq!(again, slot);
        assert_eq!(alloc.busy_page(slot), head);
    }

    #[test]
    fn recovery_finishes_interrupted_free() {
        let (_dir, region) = arena(64);
        let alloc = Allocator::create(region.clone()).unwrap();
        let slot = alloc.register_thread().unwrap();
        let a = alloc.allocate(slot, MAX_ALLOC_SIZE, None).unwrap().unwrap();
        // Move the bump target off the first page before freeing from it.
        alloc.allocate(slot, 64, None).unwrap().unwrap();
        let page = a & PAGE_MASK;

        // Simulate a crash after the record dropped to zero but before
        // the page was linked: staging words still set.
        let hdr = alloc.header();
        alloc.store(&hdr.free_staged[slot], 1);
        alloc.store(&hdr.to_be_freed[slot], page);
        PageRef::at(alloc.region(), page).release_record();
        drop(alloc);

        let alloc = Allocator::open(region).unwrap();
        assert_eq!(alloc.free_head(slot), page);
        let hdr = alloc.header();
        assert_eq!(hdr.to_be_freed[slot].load(Ordering::Acquire), PM_NULL);
        assert_eq!(hdr.free_staged[slot].load(Ordering::Acquire), 0);
    }

    #[test]
    fn recovery_twice_is_a_no_op() {
        let (_dir, region) = arena(64);
        {
            let alloc = Allocator::create(region.clone()).unwrap();
            let slot = alloc.register_thread().unwrap();
            alloc.allocate(slot, 64, None).unwrap().unwrap();
            let busy = alloc.busy_page(slot);
            let hdr = alloc.header();
            alloc.store(&hdr.pending[slot], busy);
        }

        let first = Allocator::open(region.clone()).unwrap();
        let watermark = first.watermark();
        let free: Vec<_> = (0..SLOT_COUNT).map(|t| first.free_head(t)).collect();
        let busy: Vec<_> = (0..SLOT_COUNT).map(|t| first.busy_page(t)).collect();
        drop(first);

        let second = Allocator::open(region).unwrap();
        assert_eq!(second.watermark(), watermark);
        for t in 0..SLOT_COUNT {
            assert_eq!(second.free_head(t), free[t]);
            assert_eq!(second.busy_page(t), busy[t]);
        }
    }

    #[test]
    fn undo_allocation_rolls_back_records() {
        let (_dir, region) = arena(64);
        let alloc = Allocator::create(region).unwrap();
        let slot = alloc.register_thread().unwrap();

        let a = alloc.allocate(slot, 64, None).unwrap().unwrap();
        let before = alloc.page_records(a);
        assert!(alloc.undo_allocation(a));
        assert_eq!(alloc.page_records(a), before - 1);
    }
}
