//! Bitmap of free sectors on the filesystem device.
//!
//! The bitmap lives in the first sectors of the device it describes, one bit per sector,
//! and every change is written back before the call returns.

use super::{Error, Result};
use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::{sync::Arc, vec, vec::Vec};
use log::{debug, trace};
use zerocopy::AsBytes;

/// Bits stored in one sector of the bitmap.
pub const BITS_PER_SECTOR: usize = BLOCK_SECTOR_SIZE * 8;
const GROUPS_PER_SECTOR: usize = BITS_PER_SECTOR / 64;

pub struct FreeMap {
    device: Arc<Block>,
    groups: Vec<u64>,
    /// Number of sectors tracked.
    sectors: usize,
    free: usize,
    /// No sector below this one is free.
    search_from: usize,
}

impl FreeMap {
    /// Number of sectors the bitmap itself occupies on a device of `device_sectors`.
    pub fn map_sectors(device_sectors: BlockSector) -> BlockSector {
        (device_sectors as usize).div_ceil(BITS_PER_SECTOR) as BlockSector
    }

    fn empty(device: Arc<Block>) -> Self {
        let sectors = device.get_size() as usize;
        let map_sectors = Self::map_sectors(device.get_size()) as usize;
        Self {
            device,
            groups: vec![0; map_sectors * GROUPS_PER_SECTOR],
            sectors,
            free: sectors,
            search_from: 0,
        }
    }

    /// Creates an empty bitmap on `device`, with only the bitmap's own sectors in use.
    pub fn format(device: Arc<Block>) -> Result<Self> {
        let mut map = Self::empty(device);
        let own = Self::map_sectors(map.device.get_size()) as usize;
        if own >= map.sectors {
            return Err(Error::DeviceTooSmall(map.device.get_size()));
        }
        map.mark(0, own, true);
        for sector in 0..own {
            map.store(sector)?;
        }
        Ok(map)
    }

    /// Reads the bitmap back from `device`.
    pub fn load(device: Arc<Block>) -> Result<Self> {
        let mut map = Self::empty(device);
        for (sector, chunk) in map.groups.chunks_mut(GROUPS_PER_SECTOR).enumerate() {
            map.device
                .read(sector as BlockSector, chunk.as_bytes_mut())?;
        }
        // ignore bits past the end of the device
        map.free = (0..map.sectors).filter(|&s| !map.is_set(s)).count();
        map.search_from = (0..map.sectors).find(|&s| !map.is_set(s)).unwrap_or(map.sectors);
        Ok(map)
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn is_allocated(&self, sector: BlockSector) -> bool {
        self.is_set(sector as usize)
    }

    /// Finds the first run of `count` free sectors, marks it used on disk, and returns its
    /// first sector.
    pub fn allocate(&mut self, count: usize) -> Result<BlockSector> {
        if count == 0 || count > self.free {
            return Err(Error::NoSpace);
        }
        let start = self.find_run(count).ok_or(Error::NoSpace)?;

        self.mark(start, count, true);
        if let Err(err) = self.store_range(start, count) {
            self.mark(start, count, false);
            return Err(err);
        }
        if start == self.search_from {
            self.search_from = start + count;
        }
        trace!("free map: allocated {count} sector(s) at {start}");
        Ok(start as BlockSector)
    }

    /// Returns `count` sectors starting at `start` to the free pool.
    ///
    /// Panics if any of them is already free.
    pub fn release(&mut self, start: BlockSector, count: usize) -> Result<()> {
        let start = start as usize;
        assert!(start + count <= self.sectors);
        for sector in start..start + count {
            assert!(self.is_set(sector), "releasing free sector {sector}");
        }

        self.mark(start, count, false);
        self.search_from = self.search_from.min(start);
        trace!("free map: released {count} sector(s) at {start}");
        self.store_range(start, count)
    }

    fn find_run(&self, count: usize) -> Option<usize> {
        let mut run_start = self.search_from;
        let mut sector = self.search_from;
        while sector < self.sectors {
            if sector % 64 == 0 && self.groups[sector / 64] == u64::MAX {
                sector += 64;
                run_start = sector;
                continue;
            }
            if self.is_set(sector) {
                run_start = sector + 1;
            } else if sector + 1 - run_start == count {
                return Some(run_start);
            }
            sector += 1;
        }
        None
    }

    fn is_set(&self, sector: usize) -> bool {
        self.groups[sector / 64] & (1 << (sector % 64)) != 0
    }

    fn mark(&mut self, start: usize, count: usize, used: bool) {
        for sector in start..start + count {
            let bit = 1u64 << (sector % 64);
            if used {
                self.groups[sector / 64] |= bit;
            } else {
                self.groups[sector / 64] &= !bit;
            }
        }
        if used {
            self.free -= count;
        } else {
            self.free += count;
        }
    }

    fn store_range(&self, start: usize, count: usize) -> Result<()> {
        let first = start / BITS_PER_SECTOR;
        let last = (start + count - 1) / BITS_PER_SECTOR;
        for sector in first..=last {
            self.store(sector)?;
        }
        Ok(())
    }

    fn store(&self, map_sector: usize) -> Result<()> {
        let chunk = &self.groups[map_sector * GROUPS_PER_SECTOR..][..GROUPS_PER_SECTOR];
        self.device
            .write(map_sector as BlockSector, chunk.as_bytes())?;
        Ok(())
    }
}

impl Drop for FreeMap {
    fn drop(&mut self) {
        debug!(
            "free map: {} of {} sectors free at unmount",
            self.free, self.sectors
        );
    }
}
