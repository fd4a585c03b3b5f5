//! On-disk records of the inode engine.
//!
//! An inode occupies exactly one sector. Its first [`DIRECT_SLOTS`] data sectors are
//! named directly in the record, the next [`INDEX_SLOTS`] through a singly-indirect
//! index block, and the rest through a doubly-indirect index block whose slots name
//! singly-indirect children.

use super::{Error, Result};
use crate::block::block_core::{BlockSector, BLOCK_SECTOR_SIZE};
use core::fmt;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Number of data sectors named directly by the inode record.
pub const DIRECT_SLOTS: usize = 118;
/// Number of sector slots in one index block.
pub const INDEX_SLOTS: usize = BLOCK_SECTOR_SIZE / core::mem::size_of::<SectorSlot>();

/// First logical sector reached through the singly-indirect block.
pub const INDIRECT_START: usize = DIRECT_SLOTS;
/// First logical sector reached through the doubly-indirect block.
pub const DOUBLY_INDIRECT_START: usize = INDIRECT_START + INDEX_SLOTS;
/// Number of logical sectors a single inode can address.
pub const MAX_SECTORS: usize = DOUBLY_INDIRECT_START + INDEX_SLOTS * INDEX_SLOTS;
/// Largest file length in bytes.
pub const MAX_FILE_SIZE: usize = MAX_SECTORS * BLOCK_SECTOR_SIZE;

/// Identifies an inode record ("INOD").
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// One slot of an index: either a sector number or nothing.
///
/// On disk an empty slot is `u32::MAX`; zero is a valid sector number.
#[derive(Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct SectorSlot(u32);

impl SectorSlot {
    pub const EMPTY: Self = Self(u32::MAX);

    pub fn new(sector: BlockSector) -> Self {
        debug_assert_ne!(sector, u32::MAX);
        Self(sector)
    }

    pub fn get(self) -> Option<BlockSector> {
        (self.0 != u32::MAX).then_some(self.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == u32::MAX
    }
}

impl Default for SectorSlot {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for SectorSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.get() {
            Some(sector) => write!(f, "{sector}"),
            None => f.write_str("-"),
        }
    }
}

/// The inode record as stored on disk.
#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct DiskInode {
    /// File size in bytes.
    pub length: u32,
    pub magic: u32,
    /// Non-zero for directories.
    pub is_directory: u32,
    /// Inode sector of the containing directory.
    pub parent: BlockSector,
    pub direct: [SectorSlot; DIRECT_SLOTS],
    pub indirect: SectorSlot,
    pub doubly_indirect: SectorSlot,
    _unused: [u32; 4],
}

const _: () = assert!(core::mem::size_of::<DiskInode>() == BLOCK_SECTOR_SIZE);

impl DiskInode {
    /// An inode of `length` bytes with no sectors attached yet.
    pub fn new(length: u32, is_directory: bool, parent: BlockSector) -> Self {
        Self {
            length,
            magic: INODE_MAGIC,
            is_directory: is_directory as u32,
            parent,
            direct: [SectorSlot::EMPTY; DIRECT_SLOTS],
            indirect: SectorSlot::EMPTY,
            doubly_indirect: SectorSlot::EMPTY,
            _unused: [0; 4],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    /// Drops every sector reference, leaving the length untouched.
    pub fn clear_slots(&mut self) {
        self.direct = [SectorSlot::EMPTY; DIRECT_SLOTS];
        self.indirect = SectorSlot::EMPTY;
        self.doubly_indirect = SectorSlot::EMPTY;
    }
}

/// A sector full of sector slots.
#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct IndexBlock {
    pub slots: [SectorSlot; INDEX_SLOTS],
}

const _: () = assert!(core::mem::size_of::<IndexBlock>() == BLOCK_SECTOR_SIZE);

impl IndexBlock {
    pub fn empty() -> Self {
        Self {
            slots: [SectorSlot::EMPTY; INDEX_SLOTS],
        }
    }

    /// Allocated sectors named by this block.
    pub fn sectors(&self) -> impl Iterator<Item = BlockSector> + '_ {
        self.slots.iter().filter_map(|slot| slot.get())
    }
}

/// Where the slot for a logical sector index lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorPosition {
    /// Slot in the inode's direct array.
    Direct(usize),
    /// Slot in the singly-indirect block.
    Indirect(usize),
    /// Slot `inner` of the child named by slot `outer` of the doubly-indirect block.
    DoublyIndirect { outer: usize, inner: usize },
}

impl SectorPosition {
    pub fn of(index: usize) -> Result<Self> {
        if index < INDIRECT_START {
            Ok(Self::Direct(index))
        } else if index < DOUBLY_INDIRECT_START {
            Ok(Self::Indirect(index - INDIRECT_START))
        } else if index < MAX_SECTORS {
            let index = index - DOUBLY_INDIRECT_START;
            Ok(Self::DoublyIndirect {
                outer: index / INDEX_SLOTS,
                inner: index % INDEX_SLOTS,
            })
        } else {
            Err(Error::FileTooLarge)
        }
    }
}

/// Number of sectors needed to hold `bytes` bytes.
pub fn bytes_to_sectors(bytes: usize) -> usize {
    bytes.div_ceil(BLOCK_SECTOR_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits() {
        assert_eq!(INDEX_SLOTS, 128);
        assert_eq!(MAX_SECTORS - 1, 16629);
        assert_eq!(MAX_FILE_SIZE, 8_514_560);
    }

    #[test]
    fn positions_at_boundaries() {
        assert_eq!(SectorPosition::of(117), Ok(SectorPosition::Direct(117)));
        assert_eq!(SectorPosition::of(118), Ok(SectorPosition::Indirect(0)));
        assert_eq!(SectorPosition::of(245), Ok(SectorPosition::Indirect(127)));
        assert_eq!(
            SectorPosition::of(246),
            Ok(SectorPosition::DoublyIndirect { outer: 0, inner: 0 })
        );
        assert_eq!(
            SectorPosition::of(246 + 129),
            Ok(SectorPosition::DoublyIndirect { outer: 1, inner: 1 })
        );
        assert_eq!(
            SectorPosition::of(16629),
            Ok(SectorPosition::DoublyIndirect {
                outer: 127,
                inner: 127
            })
        );
        assert_eq!(SectorPosition::of(16630), Err(Error::FileTooLarge));
    }

    #[test]
    fn empty_slots_are_all_ones_on_disk() {
        let inode = DiskInode::new(0, false, 1);
        let bytes = inode.as_bytes();
        assert_eq!(&bytes[16..20], &[0xff; 4]);
        // sector zero is a real sector, not a hole
        assert_eq!(SectorSlot::new(0).get(), Some(0));
        assert!(SectorSlot::default().is_empty());
    }

    #[test]
    fn record_survives_a_sector_round_trip() {
        let mut inode = DiskInode::new(70_000, true, 9);
        inode.direct[3] = SectorSlot::new(42);
        inode.doubly_indirect = SectorSlot::new(0);
        let copy = DiskInode::read_from(inode.as_bytes()).unwrap();
        assert!(copy.is_valid());
        assert_eq!(copy.length, 70_000);
        assert_eq!(copy.is_directory, 1);
        assert_eq!(copy.direct[3].get(), Some(42));
        assert_eq!(copy.direct[4].get(), None);
        assert_eq!(copy.doubly_indirect.get(), Some(0));
    }

    #[test]
    fn byte_counts_round_up() {
        assert_eq!(bytes_to_sectors(0), 0);
        assert_eq!(bytes_to_sectors(1), 1);
        assert_eq!(bytes_to_sectors(512), 1);
        assert_eq!(bytes_to_sectors(70_000), 137);
    }
}
