//! Mapping of logical sector indices onto device sectors.
//!
//! New sectors are always written before anything points at them: a fresh data sector
//! is zeroed first, fresh index blocks are written bottom-up, and a single last write
//! to an existing index block or to the inode record makes the new subtree reachable.
//! Sectors taken from the free map by a lookup that fails before that last write are
//! handed back.

use super::free_map::FreeMap;
use super::layout::{DiskInode, IndexBlock, SectorPosition, SectorSlot};
use super::Result;
use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::{collections::BTreeMap, vec::Vec};
use log::{trace, warn};
use zerocopy::{AsBytes, FromZeroes};

static ZEROS: [u8; BLOCK_SECTOR_SIZE] = [0; BLOCK_SECTOR_SIZE];

/// A sector found by [`Extent::find_or_allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub sector: BlockSector,
    /// The sector was allocated by this lookup and holds only zeros.
    pub fresh: bool,
}

/// The slot a new subtree gets linked into.
enum LinkPoint {
    Direct(usize),
    Indirect,
    DoublyIndirect,
    Index {
        sector: BlockSector,
        block: IndexBlock,
        slot: usize,
    },
}

/// Sectors taken from the free map that are not reachable yet.
///
/// Dropping the reservation returns them; [`Reservation::commit`] keeps them.
struct Reservation<'a> {
    free_map: &'a mut FreeMap,
    sectors: Vec<BlockSector>,
}

impl<'a> Reservation<'a> {
    fn new(free_map: &'a mut FreeMap) -> Self {
        Self {
            free_map,
            sectors: Vec::new(),
        }
    }

    fn take(&mut self) -> Result<BlockSector> {
        let sector = self.free_map.allocate(1)?;
        self.sectors.push(sector);
        Ok(sector)
    }

    fn commit(mut self) {
        self.sectors.clear();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        for &sector in &self.sectors {
            if let Err(err) = self.free_map.release(sector, 1) {
                warn!("extent: could not return sector {sector} to the free map: {err}");
            }
        }
    }
}

/// The index of one inode: its record plus the index blocks loaded so far.
pub struct Extent<'a> {
    pub disk: &'a mut DiskInode,
    pub cache: &'a mut BTreeMap<BlockSector, IndexBlock>,
    pub device: &'a Block,
}

impl Extent<'_> {
    fn load(&mut self, sector: BlockSector) -> Result<IndexBlock> {
        if let Some(block) = self.cache.get(&sector) {
            return Ok(block.clone());
        }
        let mut block = IndexBlock::new_zeroed();
        self.device.read(sector, block.as_bytes_mut())?;
        self.cache.insert(sector, block.clone());
        Ok(block)
    }

    /// The sector backing logical sector `index`, if it has been allocated.
    pub fn find(&mut self, index: usize) -> Result<Option<BlockSector>> {
        Ok(match SectorPosition::of(index)? {
            SectorPosition::Direct(i) => self.disk.direct[i].get(),
            SectorPosition::Indirect(i) => match self.disk.indirect.get() {
                Some(sector) => self.load(sector)?.slots[i].get(),
                None => None,
            },
            SectorPosition::DoublyIndirect { outer, inner } => {
                let Some(sector) = self.disk.doubly_indirect.get() else {
                    return Ok(None);
                };
                match self.load(sector)?.slots[outer].get() {
                    Some(child) => self.load(child)?.slots[inner].get(),
                    None => None,
                }
            }
        })
    }

    /// The sector backing logical sector `index`, allocating it and any missing index
    /// blocks on the way.
    ///
    /// When the link has to go into the inode record it is written to `record`; with
    /// `None` only the in-memory record changes and the caller stores it later.
    pub fn find_or_allocate(
        &mut self,
        index: usize,
        free_map: &mut FreeMap,
        record: Option<BlockSector>,
    ) -> Result<Located> {
        // `path` lists, top-down, the slots to fill in index blocks that do not exist yet
        let (link, path) = match SectorPosition::of(index)? {
            SectorPosition::Direct(i) => match self.disk.direct[i].get() {
                Some(sector) => return Ok(Located { sector, fresh: false }),
                None => (LinkPoint::Direct(i), [None, None]),
            },
            SectorPosition::Indirect(i) => match self.disk.indirect.get() {
                None => (LinkPoint::Indirect, [Some(i), None]),
                Some(sector) => {
                    let block = self.load(sector)?;
                    if let Some(found) = block.slots[i].get() {
                        return Ok(Located {
                            sector: found,
                            fresh: false,
                        });
                    }
                    (LinkPoint::Index { sector, block, slot: i }, [None, None])
                }
            },
            SectorPosition::DoublyIndirect { outer, inner } => {
                match self.disk.doubly_indirect.get() {
                    None => (LinkPoint::DoublyIndirect, [Some(outer), Some(inner)]),
                    Some(sector) => {
                        let block = self.load(sector)?;
                        match block.slots[outer].get() {
                            None => (
                                LinkPoint::Index {
                                    sector,
                                    block,
                                    slot: outer,
                                },
                                [Some(inner), None],
                            ),
                            Some(child) => {
                                let child_block = self.load(child)?;
                                if let Some(found) = child_block.slots[inner].get() {
                                    return Ok(Located {
                                        sector: found,
                                        fresh: false,
                                    });
                                }
                                (
                                    LinkPoint::Index {
                                        sector: child,
                                        block: child_block,
                                        slot: inner,
                                    },
                                    [None, None],
                                )
                            }
                        }
                    }
                }
            }
        };

        let mut reservation = Reservation::new(free_map);

        // data first, then the missing index blocks from the bottom up
        let data = reservation.take()?;
        self.device.write(data, &ZEROS)?;
        let mut top = data;
        let mut built = Vec::with_capacity(2);
        for &slot in path.iter().rev().flatten() {
            let sector = reservation.take()?;
            let mut block = IndexBlock::empty();
            block.slots[slot] = SectorSlot::new(top);
            self.device.write(sector, block.as_bytes())?;
            built.push((sector, block));
            top = sector;
        }

        match link {
            LinkPoint::Index {
                sector,
                mut block,
                slot,
            } => {
                block.slots[slot] = SectorSlot::new(top);
                self.device.write(sector, block.as_bytes())?;
                self.cache.insert(sector, block);
            }
            link => {
                let mut updated = self.disk.clone();
                let slot = match link {
                    LinkPoint::Direct(i) => &mut updated.direct[i],
                    LinkPoint::Indirect => &mut updated.indirect,
                    _ => &mut updated.doubly_indirect,
                };
                *slot = SectorSlot::new(top);
                if let Some(record) = record {
                    self.device.write(record, updated.as_bytes())?;
                }
                *self.disk = updated;
            }
        }

        reservation.commit();
        self.cache.extend(built);
        trace!("extent: logical sector {index} -> {data}");
        Ok(Located {
            sector: data,
            fresh: true,
        })
    }

    /// Releases every sector the index reaches, index blocks included, and empties the
    /// index. Returns the number of sectors released.
    pub fn reclaim(&mut self, free_map: &mut FreeMap) -> Result<usize> {
        let mut released = 0;
        let mut release = |free_map: &mut FreeMap, sector| -> Result<()> {
            free_map.release(sector, 1)?;
            released += 1;
            Ok(())
        };

        for sector in self.disk.direct.iter().filter_map(|slot| slot.get()) {
            release(free_map, sector)?;
        }
        if let Some(indirect) = self.disk.indirect.get() {
            for sector in self.load(indirect)?.sectors() {
                release(free_map, sector)?;
            }
            release(free_map, indirect)?;
        }
        if let Some(doubly) = self.disk.doubly_indirect.get() {
            for child in self.load(doubly)?.sectors() {
                for sector in self.load(child)?.sectors() {
                    release(free_map, sector)?;
                }
                release(free_map, child)?;
            }
            release(free_map, doubly)?;
        }

        self.disk.clear_slots();
        self.cache.clear();
        Ok(released)
    }
}
