//! # Remote Memory
//!
//! A Hill node exports slices of its PM to peers over RDMA. This module
//! provides the addressing and bookkeeping half of that story: pointers
//! that name bytes on another node, and per-thread bump allocators over
//! regions a peer has granted. The RDMA verbs themselves (device setup,
//! queue pairs, the actual reads and writes) live outside the core.
//!
//! ## Pointer Encoding
//!
//! A remote pointer packs everything into one canonical 64-bit word:
//!
//! ```text
//! 63 62 61          56 55                                    0
//! +-----+-------------+---------------------------------------+
//! | 1 0 |   node id   |            address (56 bits)          |
//! +-----+-------------+---------------------------------------+
//! ```
//!
//! The `0b10` tag in the top two bits marks a word as remote; anything
//! else is a local pointer. This is what lets the index store local and
//! remote values in the same leaf slot and tell them apart with one bit
//! test, without ever dereferencing the remote ones.
//!
//! ## Remote Allocation
//!
//! [`RemoteAllocator`] bump-allocates within one granted region; the
//! [`RemoteMemoryAgent`] keeps a `(slot, region)` matrix of allocators so
//! each thread works its own regions without locking others out.

mod allocator;
mod pointer;

pub use allocator::{RemoteAllocator, RemoteMemoryAgent, REMOTE_REGIONS, REMOTE_REGION_SIZE};
pub use pointer::{PolymorphicPointer, RemotePointer};
