//! Length-prefixed records stored in PM.
//!
//! Keys and values are stored as `{ size: u64 LE, bytes[size] }`. The
//! index compares records byte-wise and hands out pointers to them; it
//! never interprets the contents.

use eyre::Result;

use super::region::PmRegion;
use super::PmPtr;

/// Bytes a record of `len` payload bytes occupies in PM.
#[inline]
pub fn record_size(len: usize) -> usize {
    8 + len
}

/// Writes `{size, bytes}` at `off`. The span must be freshly allocated
/// and unpublished; the caller persists after the last record of the
/// allocation is written.
pub fn write_record(region: &PmRegion, off: PmPtr, payload: &[u8]) -> Result<()> {
    region.write_bytes(off, &(payload.len() as u64).to_le_bytes())?;
    region.write_bytes(off + 8, payload)
}

/// Borrows the payload of the record at `off`.
pub fn record_bytes(region: &PmRegion, off: PmPtr) -> Result<&[u8]> {
    let size_bytes = region.bytes(off, 8)?;
    let size = u64::from_le_bytes(size_bytes.try_into().expect("8-byte slice"));
    region.bytes(off + 8, size as usize)
}
