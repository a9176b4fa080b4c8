//! # Write-Ahead Logging
//!
//! Every mutation that spans more than one PM word (an allocation paired
//! with the bytes written into it, a node split) is bracketed by a redo
//! record so that recovery can tell a finished mutation from one a crash
//! cut short.
//!
//! ## Log Regions
//!
//! The log lives in its own PM region, separate from the arena:
//!
//! ```text
//! +--------+----------------+----------------+     +----------------+
//! | magic  | LogRegion[0]   | LogRegion[1]   | ... | LogRegion[63]  |
//! +--------+----------------+----------------+     +----------------+
//!
//! LogRegion = { checkpointed, cursor, entries[BATCH * REGIONS_PER] }
//! LogEntry  = { address: 8B, op+status: 8B }
//! ```
//!
//! One region per thread slot; slot indices are shared with the page
//! allocator, so a redo record and the allocation it guards always agree
//! on ownership. Within a slot the log is strictly sequential: at most
//! one entry is uncommitted at any moment.
//!
//! ## Entry Protocol
//!
//! ```text
//! entry = make_log(slot, op)       entry written Uncommitted, persisted
//! allocate(slot, size, entry)      object offset persisted into entry
//! ... fill the object ...
//! commit(slot)                     status flipped to Committed, persisted
//! ```
//!
//! A crash before the commit leaves an Uncommitted entry. On open the
//! logger replays `[checkpointed, cursor)` of every region, hands each
//! uncommitted entry to a caller-supplied action, and rolls back the
//! allocation of every entry the action abandons. Pages whose record
//! count drops to zero this way fold back into the allocator's free
//! lists.
//!
//! The region file is created sparse: the worst-case entry capacity is
//! reserved in the address space but untouched slots never materialize.

mod logger;

pub use logger::{
    EntryHandle, LogOp, LogStatus, Logger, ReplayStats, ENTRIES_PER_SLOT, LOG_BATCH,
    LOG_REGIONS_PER, LOG_REGION_FILE_SIZE,
};
