//! The extent-based inode engine and the volume it lives on.

pub mod extent;
pub mod free_map;
pub mod inode;
pub mod layout;

use crate::block::block_core::{Block, BlockSector};
use crate::block::block_error::BlockError;
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use free_map::FreeMap;
use thiserror::Error;

pub use inode::{FileSystem, Inode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no free sectors left on the filesystem device")]
    NoSpace,
    #[error("no data at this offset")]
    OutOfRange,
    #[error("offset beyond the largest addressable file")]
    FileTooLarge,
    #[error("sector {0} does not hold an inode")]
    BadMagic(BlockSector),
    #[error("device of {0} sectors is too small for a filesystem")]
    DeviceTooSmall(BlockSector),
    #[error(transparent)]
    Device(#[from] BlockError),
}

pub type Result<T> = core::result::Result<T, Error>;

/// The filesystem device and its free map.
///
/// The free map's lock doubles as the filesystem lock: every sector allocation or
/// release happens while holding it.
pub struct Volume {
    pub(crate) device: Arc<Block>,
    pub(crate) free_map: Mutex<FreeMap>,
}

impl Volume {
    pub fn device(&self) -> &Arc<Block> {
        &self.device
    }

    /// Number of sectors not yet handed out.
    pub fn free_sectors(&self) -> usize {
        self.free_map.lock().free_count()
    }
}
