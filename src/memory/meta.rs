//! # Store Bootstrap Block
//!
//! A 64-byte block at a fixed offset inside arena page 0, after the
//! allocator header. It records the one PM pointer the index cannot
//! recompute on its own: the leftmost leaf of the tree, from which the
//! whole leaf chain (and therefore the volatile inner tree) is rebuilt
//! after a restart.
//!
//! The block is plain data and is read and written through `zerocopy`,
//! with the magic word distinguishing a bootstrapped arena from a fresh
//! one.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::region::PmRegion;
use super::PmPtr;

pub const STORE_META_MAGIC: u64 = 0x4869_6c6c_4d65_7461; // "HillMeta"

/// Offset of the block within arena page 0, past the allocator header.
pub const STORE_META_OFFSET: u64 = 8192;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct StoreMeta {
    magic: u64,
    root: u64,
    _reserved: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<StoreMeta>() == 64);

impl StoreMeta {
    pub fn new(root: PmPtr) -> Self {
        Self {
            magic: STORE_META_MAGIC,
            root,
            _reserved: [0; 48],
        }
    }

    /// Reads the block from the arena; `None` if never bootstrapped.
    pub fn load(region: &PmRegion) -> Result<Option<Self>> {
        let bytes = region.bytes(STORE_META_OFFSET, std::mem::size_of::<Self>())?;
        let meta = Self::read_from_bytes(bytes)
            .map_err(|e| eyre::eyre!("failed to read store meta block: {e:?}"))?;

        if meta.magic != STORE_META_MAGIC {
            return Ok(None);
        }
        ensure!(
            meta.root != 0,
            "store meta block carries a null root pointer"
        );
        Ok(Some(meta))
    }

    /// Writes the block and persists it.
    pub fn store(&self, region: &PmRegion) -> Result<()> {
        region.write_bytes(STORE_META_OFFSET, self.as_bytes())?;
        region.persist(STORE_META_OFFSET, std::mem::size_of::<Self>());
        Ok(())
    }

    pub fn root(&self) -> PmPtr {
        self.root
    }
}
