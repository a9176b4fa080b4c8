//! # Page Header and In-Page Allocation
//!
//! Every 16KB page carries its metadata packed into a single 8-byte word
//! at offset 0 so the header can be updated with one aligned atomic store
//! followed by a persist barrier:
//!
//! ```text
//! Bits    Field     Description
//! ------  --------  ------------------------------------------
//! 0-7     records   live allocations in this page (255 max)
//! 8-15    reserved
//! 16-63   cursor    byte offset of the next free position
//! ```
//!
//! The last 8 bytes of the page hold `next`, a PM pointer threading free
//! pages into lists. Objects are bump-allocated between the header and
//! the `next` word; positions are kept 8-aligned so every object can hold
//! atomic words of its own.
//!
//! A page with `records == 0` is reclaimable: the cursor is reset and the
//! page is pushed onto a free list. Contents are not cleared on reclaim;
//! the next allocation from the page overwrites them.

use std::sync::atomic::Ordering;

use super::region::PmRegion;
use super::{PmPtr, PAGE_HEADER_SIZE, PAGE_MASK, PAGE_NEXT_SIZE, PAGE_SIZE, PM_NULL};

const RECORDS_MASK: u64 = 0xff;
const CURSOR_SHIFT: u32 = 16;

/// End of the usable span: the trailing `next` word is never allocated.
const CONTENT_END: u64 = (PAGE_SIZE - PAGE_NEXT_SIZE) as u64;

#[inline]
fn pack(records: u64, cursor: u64) -> u64 {
    (records & RECORDS_MASK) | (cursor << CURSOR_SHIFT)
}

/// Objects stay 8-aligned so they can hold atomic words of their own.
#[inline]
fn aligned_size(size: usize) -> u64 {
    ((size + 7) & !7) as u64
}

/// A view of one page inside a PM region.
#[derive(Clone, Copy)]
pub struct PageRef<'r> {
    region: &'r PmRegion,
    off: PmPtr,
}

impl<'r> PageRef<'r> {
    /// Views the page at `off`, which must be page-aligned and non-null.
    pub fn at(region: &'r PmRegion, off: PmPtr) -> Self {
        debug_assert_ne!(off, PM_NULL);
        debug_assert_eq!(off & !PAGE_MASK, 0, "unaligned page offset {off:#x}");
        Self { region, off }
    }

    /// Views the page owning the object at `ptr`.
    pub fn owning(region: &'r PmRegion, ptr: PmPtr) -> Self {
        Self::at(region, ptr & PAGE_MASK)
    }

    #[inline]
    pub fn offset(&self) -> PmPtr {
        self.off
    }

    /// Resets the page to empty with the given `next` link and persists.
    pub fn init(&self, next: PmPtr) {
        self.set_next(next);
        self.store_header(0, PAGE_HEADER_SIZE as u64);
    }

    #[inline]
    fn header_word(&self) -> u64 {
        self.region.atomic_u64(self.off).load(Ordering::Acquire)
    }

    #[inline]
    fn store_header(&self, records: u64, cursor: u64) {
        self.region
            .atomic_u64(self.off)
            .store(pack(records, cursor), Ordering::Release);
        self.region.persist(self.off, PAGE_HEADER_SIZE);
    }

    #[inline]
    pub fn records(&self) -> u64 {
        self.header_word() & RECORDS_MASK
    }

    #[inline]
    pub fn cursor(&self) -> u64 {
        self.header_word() >> CURSOR_SHIFT
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records() == 0
    }

    #[inline]
    pub fn next(&self) -> PmPtr {
        self.region
            .atomic_u64(self.off + CONTENT_END)
            .load(Ordering::Acquire)
    }

    pub fn set_next(&self, next: PmPtr) {
        self.region
            .atomic_u64(self.off + CONTENT_END)
            .store(next, Ordering::Release);
        self.region.persist(self.off + CONTENT_END, PAGE_NEXT_SIZE);
    }

    /// First phase of a bump allocation: computes the object offset for
    /// `size` bytes without touching the header.
    ///
    /// Returns `None` when the remaining span or the record counter is
    /// exhausted. The caller records the offset wherever the redo
    /// protocol requires (typically a log entry), then calls
    /// [`commit_bump`](Self::commit_bump). A crash in between leaves the
    /// header untouched, so the reservation simply never happened.
    pub fn peek_bump(&self, size: usize) -> Option<PmPtr> {
        let word = self.header_word();
        let records = word & RECORDS_MASK;
        let cursor = word >> CURSOR_SHIFT;

        if records == RECORDS_MASK {
            return None;
        }

        if cursor + aligned_size(size) > CONTENT_END {
            return None;
        }

        Some(self.off + cursor)
    }

    /// Second phase of a bump allocation: advances the cursor and the
    /// record count in one atomic header store, so a crash leaves either
    /// the old or the new header.
    pub fn commit_bump(&self, size: usize) {
        let word = self.header_word();
        let records = word & RECORDS_MASK;
        let cursor = word >> CURSOR_SHIFT;

        debug_assert!(records < RECORDS_MASK);
        self.store_header(records + 1, cursor + aligned_size(size));
    }

    /// Reserves and commits in one step, for callers with no redo record.
    pub fn try_bump(&self, size: usize) -> Option<PmPtr> {
        let ptr = self.peek_bump(size)?;
        self.commit_bump(size);
        Some(ptr)
    }

    /// Drops one live record; returns the remaining count.
    pub fn release_record(&self) -> u64 {
        let word = self.header_word();
        let records = (word & RECORDS_MASK).saturating_sub(1);
        self.store_header(records, word >> CURSOR_SHIFT);
        records
    }

    /// Rewinds the cursor of an empty page so its space can be reused.
    pub fn reset_cursor(&self) {
        debug_assert_eq!(self.records(), 0);
        self.store_header(0, PAGE_HEADER_SIZE as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MAX_ALLOC_SIZE;
    use tempfile::tempdir;

    fn region() -> (tempfile::TempDir, PmRegion) {
        let dir = tempdir().unwrap();
        let region = PmRegion::create(dir.path().join("pm"), 4 * PAGE_SIZE).unwrap();
        (dir, region)
    }

    #[test]
    fn init_resets_header_and_next() {
        let (_dir, region) = region();
        let page = PageRef::at(&region, PAGE_SIZE as u64);

        page.init(2 * PAGE_SIZE as u64);
        assert_eq!(page.records(), 0);
        assert_eq!(page.cursor(), PAGE_HEADER_SIZE as u64);
        assert_eq!(page.next(), 2 * PAGE_SIZE as u64);
        assert!(page.is_empty());
    }

    #[test]
    fn bump_advances_cursor_and_records() {
        let (_dir, region) = region();
        let page = PageRef::at(&region, PAGE_SIZE as u64);
        page.init(PM_NULL);

        let a = page.try_bump(24).unwrap();
        let b = page.try_bump(100).unwrap();

        assert_eq!(a, PAGE_SIZE as u64 + PAGE_HEADER_SIZE as u64);
        // 24 is already 8-aligned.
        assert_eq!(b, a + 24);
        assert_eq!(page.records(), 2);
    }

    #[test]
    fn bump_rounds_to_eight_bytes() {
        let (_dir, region) = region();
        let page = PageRef::at(&region, PAGE_SIZE as u64);
        page.init(PM_NULL);

        let a = page.try_bump(3).unwrap();
        let b = page.try_bump(8).unwrap();
        assert_eq!(b - a, 8);
    }

    #[test]
    fn bump_respects_content_end() {
        let (_dir, region) = region();
        let page = PageRef::at(&region, PAGE_SIZE as u64);
        page.init(PM_NULL);

        assert!(page.try_bump(MAX_ALLOC_SIZE).is_some());
        assert!(page.try_bump(1).is_none());
    }

    #[test]
    fn release_to_zero_allows_cursor_reset() {
        let (_dir, region) = region();
        let page = PageRef::at(&region, PAGE_SIZE as u64);
        page.init(PM_NULL);

        page.try_bump(64).unwrap();
        page.try_bump(64).unwrap();

        assert_eq!(page.release_record(), 1);
        assert_eq!(page.release_record(), 0);

        page.reset_cursor();
        assert_eq!(page.cursor(), PAGE_HEADER_SIZE as u64);
    }

    #[test]
    fn owning_masks_to_page_base() {
        let (_dir, region) = region();
        let ptr = PAGE_SIZE as u64 + 1234;
        let page = PageRef::owning(&region, ptr);
        assert_eq!(page.offset(), PAGE_SIZE as u64);
    }
}
