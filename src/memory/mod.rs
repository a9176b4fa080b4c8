//! # Persistent Memory Management
//!
//! This module provides the persistent-memory substrate for a Hill node:
//! a byte-addressable PM region exposed through memory-mapped I/O, a 16KB
//! page abstraction, and a crash-consistent, thread-partitioned page
//! allocator whose metadata lives inside the region it manages.
//!
//! ## Region Layout
//!
//! A PM arena is a contiguous span of 16KB pages. Page 0 is reserved for
//! metadata and never handed out:
//!
//! ```text
//! +---------------------------+
//! | Page 0                    |
//! |   AllocatorHeader         |  magic, watermark, free lists,
//! |   (per-slot arrays)       |  per-slot staging words
//! |   StoreMeta (at 8192)     |  index bootstrap block
//! +---------------------------+
//! | Page 1 .. Page N          |  allocation arena
//! +---------------------------+
//! ```
//!
//! ## Offset Addressing
//!
//! PM objects are addressed by `PmPtr`, a byte offset from the region
//! base. Offset 0 lies inside the reserved metadata page, so 0 doubles as
//! the null pointer. Offsets survive restarts regardless of where the OS
//! maps the file, which is what the recovery rules compare. The owning
//! page of any object is `offset & PAGE_MASK`.
//!
//! ## Thread Partitioning
//!
//! Up to [`SLOT_COUNT`] threads register with the allocator, each claiming
//! a slot index that names its private busy page and free list. The fast
//! path bump-allocates inside the busy page with no shared state; the slow
//! path takes one arena-wide mutex to refill the slot's free list from the
//! recycled-page list or the watermark.
//!
//! ## Crash Consistency
//!
//! Every store that links pages together is followed by a persist barrier
//! before the pointer that makes the page reachable is published. The
//! per-slot staging words in the header encode which multi-step operation
//! was in flight; recovery replays a fixed set of idempotent repair rules
//! over them (see `allocator.rs`).
//!
//! ## Module Organization
//!
//! - `region`: mmap-backed PM span with atomic word access (`PmRegion`)
//! - `page`: 16KB page header word and in-page bump allocation
//! - `allocator`: thread-slotted page allocator with recovery
//! - `record`: length-prefixed key/value records stored in PM
//! - `meta`: the store bootstrap block in page 0

mod allocator;
mod meta;
mod page;
mod record;
mod region;

pub use allocator::Allocator;
pub use meta::{StoreMeta, STORE_META_MAGIC, STORE_META_OFFSET};
pub use page::PageRef;
pub use record::{record_bytes, record_size, write_record};
pub use region::{PmRegion, PmWord};

/// Byte offset into a PM region. Offset 0 is the null pointer.
pub type PmPtr = u64;

pub const PM_NULL: PmPtr = 0;

pub const PAGE_SIZE: usize = 16384;
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Packed header word at the front of every page.
pub const PAGE_HEADER_SIZE: usize = 8;

/// Trailing word of every page, threading free-page lists.
pub const PAGE_NEXT_SIZE: usize = 8;

/// Largest single allocation a page can satisfy.
pub const MAX_ALLOC_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - PAGE_NEXT_SIZE;

/// Number of thread slots; a hard upper bound on registered threads.
pub const SLOT_COUNT: usize = 64;

/// Pages carved or detached per free-list refill.
pub const PREALLOC: usize = 10;

/// Sentinel in `free[t]` meaning the slot is open for registration.
/// The null page is offset 0, so the sentinel cannot collide with a list.
pub const SLOT_AVAILABLE: u64 = u64::MAX;

pub const ALLOCATOR_MAGIC: u64 = 0xabcd_dcba_abcd_dcba;
