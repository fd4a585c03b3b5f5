use super::block_error::BlockError;
use crate::drivers::ram_disk::RamDisk;
use crate::sync::mutex::Mutex;
use alloc::{string::String, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use log::info;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = vmstore_shared::sizes::SECTOR_SIZE;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Role a block device plays
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by another operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers
pub trait BlockOp {
    /// Number of sectors on the device
    fn sectors(&self) -> BlockSector;
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// Supported block drivers
pub enum BlockDriver {
    Ram(RamDisk),
}

impl BlockDriver {
    /// Unwrap the block driver to get the underlying block operation
    fn unwrap(&mut self) -> &mut dyn BlockOp {
        match self {
            BlockDriver::Ram(driver) => driver,
        }
    }

    fn sectors(&self) -> BlockSector {
        match self {
            BlockDriver::Ram(driver) => driver.sectors(),
        }
    }
}

/// A block device
///
/// The driver sits behind its own lock, so a `Block` can be shared between the
/// filesystem and swap engines and used from any thread. A single sector transfer is
/// atomic with respect to other transfers on the same device.
pub struct Block {
    /// Unique and immutable index of the block
    index: usize,
    /// The name of the block device
    block_name: String,
    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Mutex<BlockDriver>,
    /// The size of the block device in sectors
    block_size: BlockSector,
    read_count: AtomicU32,
    write_count: AtomicU32,
}

impl Block {
    pub fn new(index: usize, block_name: &str, block_type: BlockType, driver: BlockDriver) -> Self {
        Self {
            index,
            block_name: String::from(block_name),
            block_type,
            block_size: driver.sectors(),
            driver: Mutex::new(driver),
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid(buf.len()));
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds {
                sector,
                size: self.block_size,
            });
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// exactly `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.lock().unwrap().read(sector, buf)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain exactly `BLOCK_SECTOR_SIZE`
    /// bytes. Returns after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        if self.block_type == BlockType::Foreign {
            return Err(BlockError::Foreign);
        }

        self.driver.lock().unwrap().write(sector, buf)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copies the raw contents of the device.
    pub fn snapshot(&self) -> Vec<u8> {
        match &*self.driver.lock() {
            BlockDriver::Ram(driver) => driver.image().to_vec(),
        }
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn get_index(&self) -> usize {
        self.index
    }
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "    {:04} | \"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.index,
            self.block_name,
            self.block_type,
            self.block_size,
            self.read_count(),
            self.write_count()
        )
    }
}

/// Maintain a list of blocks
#[derive(Default)]
pub struct BlockManager {
    /// All the block devices
    all_blocks: Vec<Arc<Block>>,
}

impl BlockManager {
    /// Create a new block manager
    pub fn new() -> Self {
        BlockManager::with_capacity(4)
    }

    /// Create a new block manager with a given capacity
    pub fn with_capacity(cap: usize) -> Self {
        BlockManager {
            all_blocks: Vec::with_capacity(cap),
        }
    }

    /// Register a block device with the given `name`. The device's size in sectors comes
    /// from its `driver`.
    ///
    /// Returns the registered device.
    pub fn register_block(
        &mut self,
        block_type: BlockType,
        block_name: &str,
        driver: BlockDriver,
    ) -> Arc<Block> {
        let block = Arc::new(Block::new(
            self.all_blocks.len(),
            block_name,
            block_type,
            driver,
        ));

        info!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block.block_name, block_type, block.block_size,
        );

        self.all_blocks.push(block.clone());
        block
    }

    /// Get the block device with the given `index`.
    pub fn by_id(&self, idx: usize) -> Option<Arc<Block>> {
        self.all_blocks.get(idx).cloned()
    }

    /// Get the block device with the given `name`.
    pub fn by_name(&self, name: &str) -> Option<Arc<Block>> {
        self.all_blocks
            .iter()
            .find(|b| b.block_name == name)
            .cloned()
    }

    /// Get the first block device registered for `role`.
    pub fn by_role(&self, role: BlockType) -> Option<Arc<Block>> {
        self.all_blocks
            .iter()
            .find(|b| b.block_type == role)
            .cloned()
    }
}

impl fmt::Display for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Block Devices:")?;
        for block in self.all_blocks.iter() {
            writeln!(f, "{}", block)?;
        }
        Ok(())
    }
}
