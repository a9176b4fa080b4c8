//! # Memory-Mapped PM Region
//!
//! `PmRegion` is the low-level building block for persistent-memory
//! access. A region is a file mapped read-write into the process address
//! space; on machines with real PM the file lives on a DAX filesystem and
//! loads/stores reach the media directly, elsewhere the OS page cache
//! stands in and `sync()` provides the durability point.
//!
//! ## Access Model
//!
//! Unlike a pager, a PM region is mapped once at startup and never grows
//! or remaps, so references into it stay valid for the region's lifetime.
//! Concurrent mutation is part of the model: allocator slots and index
//! nodes are updated in place by many threads, coordinated by their own
//! protocols (per-slot ownership, version locks). The region therefore
//! hands out *shared* views with interior mutability:
//!
//! - [`PmRegion::atomic_u64`] returns an `&AtomicU64` over an aligned PM
//!   word. All cross-thread PM state (page headers, list heads, node
//!   fields) goes through these.
//! - [`PmRegion::write_bytes`] copies a byte span into PM through `&self`.
//!   Callers only write spans they exclusively own, i.e. freshly
//!   allocated memory that no other thread can reach until a subsequent
//!   atomic store publishes it.
//!
//! ## Persist Barriers
//!
//! [`PmRegion::persist`] marks the point where a preceding PM store must
//! become durable before any store that publishes it. On PM hardware this
//! is a cache-line write-back plus store fence; here it compiles to a
//! sequentially-consistent fence, which pins the ordering the recovery
//! rules depend on. [`PmRegion::sync`] flushes the whole mapping and is
//! used at coarse durability points (shutdown, tests).
//!
//! ## Error Handling
//!
//! All fallible operations return `eyre::Result` with the file path and
//! the operation attached.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::{PmPtr, PAGE_SIZE};

pub struct PmRegion {
    #[allow(dead_code)]
    file: File,
    mmap: MmapMut,
    len: usize,
}

// The mmap is only mutated through atomic words or through byte spans the
// writer exclusively owns, so shared references can cross threads.
unsafe impl Send for PmRegion {}
unsafe impl Sync for PmRegion {}

impl PmRegion {
    /// Creates a new region file of `size` bytes and maps it.
    ///
    /// The file is created sparse; untouched pages cost no disk space.
    pub fn create<P: AsRef<Path>>(path: P, size: usize) -> Result<Self> {
        let path = path.as_ref();

        ensure!(size > 0, "PM region size must be non-zero");
        ensure!(
            size % PAGE_SIZE == 0,
            "PM region size {} is not a multiple of page size {}",
            size,
            PAGE_SIZE
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create PM region '{}'", path.display()))?;

        file.set_len(size as u64)
            .wrap_err_with(|| format!("failed to size PM region '{}'", path.display()))?;

        Self::map(file, size)
    }

    /// Opens an existing region file and maps it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open PM region '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat PM region '{}'", path.display()))?
            .len();

        ensure!(len > 0, "PM region '{}' is empty", path.display());
        ensure!(
            len % PAGE_SIZE as u64 == 0,
            "PM region '{}' size {} is not a multiple of page size {}",
            path.display(),
            len,
            PAGE_SIZE
        );

        Self::map(file, len as usize)
    }

    fn map(file: File, len: usize) -> Result<Self> {
        // SAFETY: the file is held open for the lifetime of the mapping
        // and Hill region files are not shared with other processes. All
        // access is bounds-checked against `len` before touching the map.
        let mmap = unsafe {
            MmapMut::map_mut(&file).wrap_err("failed to memory-map PM region")?
        };

        Ok(Self { file, mmap, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Returns an atomic view of the 8-byte PM word at `off`.
    ///
    /// # Panics
    /// Debug-asserts that `off` is 8-aligned and in bounds; both hold for
    /// every word the allocator, logger, and index lay out.
    #[inline]
    pub fn atomic_u64(&self, off: PmPtr) -> &AtomicU64 {
        debug_assert!(off % 8 == 0, "misaligned PM word at {off:#x}");
        debug_assert!(
            off as usize + 8 <= self.len,
            "PM word at {off:#x} out of bounds"
        );
        // SAFETY: in bounds and 8-aligned (the mapping itself is
        // OS-page-aligned); the region never remaps, so the reference
        // lives as long as `self`.
        unsafe { &*(self.base().add(off as usize) as *const AtomicU64) }
    }

    /// Borrows `len` bytes of PM starting at `off`.
    pub fn bytes(&self, off: PmPtr, len: usize) -> Result<&[u8]> {
        ensure!(
            (off as usize).checked_add(len).is_some_and(|end| end <= self.len),
            "PM span {:#x}+{} out of bounds (region size {})",
            off,
            len,
            self.len
        );
        // SAFETY: bounds checked above; see module docs for the aliasing
        // protocol on concurrently mutated spans.
        unsafe { Ok(std::slice::from_raw_parts(self.base().add(off as usize), len)) }
    }

    /// Copies `data` into PM at `off`.
    ///
    /// The caller must exclusively own the destination span: a freshly
    /// allocated object that no other thread can reach until a later
    /// atomic store publishes it.
    pub fn write_bytes(&self, off: PmPtr, data: &[u8]) -> Result<()> {
        ensure!(
            (off as usize)
                .checked_add(data.len())
                .is_some_and(|end| end <= self.len),
            "PM span {:#x}+{} out of bounds (region size {})",
            off,
            data.len(),
            self.len
        );
        // SAFETY: bounds checked; exclusivity is the caller's contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base().add(off as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Zeroes `len` bytes of PM at `off`, with the same exclusivity
    /// contract as [`write_bytes`](Self::write_bytes).
    pub fn zero_bytes(&self, off: PmPtr, len: usize) -> Result<()> {
        ensure!(
            (off as usize).checked_add(len).is_some_and(|end| end <= self.len),
            "PM span {:#x}+{} out of bounds (region size {})",
            off,
            len,
            self.len
        );
        // SAFETY: bounds checked; exclusivity is the caller's contract.
        unsafe {
            std::ptr::write_bytes(self.base().add(off as usize), 0, len);
        }
        Ok(())
    }

    /// Persist barrier: orders all preceding PM stores before any
    /// following store. On PM hardware this point carries the cache-line
    /// write-back; the recovery rules assume nothing weaker.
    #[inline]
    pub fn persist(&self, _off: PmPtr, _len: usize) {
        fence(Ordering::SeqCst);
    }

    /// Flushes the whole mapping to the backing file.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync PM region")
    }

    /// A handle to one PM word, for callers that hand write access to a
    /// single cell across module boundaries.
    #[inline]
    pub fn word(&self, off: PmPtr) -> PmWord<'_> {
        PmWord { region: self, off }
    }
}

/// A single 8-byte PM cell. Stores persist immediately.
#[derive(Clone, Copy)]
pub struct PmWord<'r> {
    region: &'r PmRegion,
    off: PmPtr,
}

impl PmWord<'_> {
    #[inline]
    pub fn get(&self) -> u64 {
        self.region.atomic_u64(self.off).load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: u64) {
        self.region.atomic_u64(self.off).store(value, Ordering::Release);
        self.region.persist(self.off, 8);
    }

    #[inline]
    pub fn offset(&self) -> PmPtr {
        self.off
    }
}
