use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// A block device backed by memory.
///
/// Stands in for the IDE disks the filesystem and swap devices live on.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    /// A zero-filled disk of `sectors` sectors.
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
        }
    }

    /// A disk holding a raw image. A trailing partial sector is padded with zeros.
    pub fn from_image(mut image: Vec<u8>) -> Self {
        let rem = image.len() % BLOCK_SECTOR_SIZE;
        if rem != 0 {
            image.resize(image.len() + BLOCK_SECTOR_SIZE - rem, 0);
        }
        Self { data: image }
    }

    pub fn image(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        if start + BLOCK_SECTOR_SIZE > self.data.len() {
            return Err(BlockError::SectorOutOfBounds {
                sector,
                size: self.sectors(),
            });
        }
        Ok(start..start + BLOCK_SECTOR_SIZE)
    }
}

impl BlockOp for RamDisk {
    fn sectors(&self) -> BlockSector {
        (self.data.len() / BLOCK_SECTOR_SIZE) as BlockSector
    }

    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}
