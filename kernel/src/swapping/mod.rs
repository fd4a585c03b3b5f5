//! Page-sized slots on the swap device.

pub mod free_set;
pub mod page_replacement;

use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use core::fmt;
use free_set::FreeSet;
use log::{debug, trace};
use thiserror::Error;
use vmstore_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};

/// Index of a page-sized slot on the swap device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub fn index(self) -> u32 {
        self.0
    }

    /// Device sector holding part `k` of this slot.
    fn sector(self, k: usize) -> BlockSector {
        self.0 * SECTORS_PER_PAGE as BlockSector + k as BlockSector
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SwapError {
    #[error("swap device is full")]
    Full,
    #[error(transparent)]
    Device(#[from] BlockError),
}

/// The swap device and its table of free slots.
pub struct SwapStore {
    device: Arc<Block>,
    slots: Mutex<FreeSet>,
    slot_count: u32,
}

impl SwapStore {
    pub fn new(device: Arc<Block>) -> Self {
        let slot_count = device.get_size() / SECTORS_PER_PAGE as BlockSector;
        debug!(
            "swap: {} slots on \"{}\"",
            slot_count,
            device.get_name()
        );
        Self {
            device,
            slots: Mutex::new(FreeSet::new_all_free(slot_count)),
            slot_count,
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn free_slots(&self) -> u32 {
        self.slots.lock().free_count()
    }

    /// Takes a free slot.
    pub fn allocate_slot(&self) -> Result<SwapSlot, SwapError> {
        self.slots
            .lock()
            .allocate()
            .map(SwapSlot)
            .ok_or(SwapError::Full)
    }

    /// Returns an unread slot, e.g. when its page is discarded.
    pub fn free_slot(&self, slot: SwapSlot) {
        self.slots.lock().free(slot.0);
        trace!("swap: freed {slot:?}");
    }

    /// Stores one page in `slot`.
    pub fn write(&self, slot: SwapSlot, page: &[u8]) -> Result<(), SwapError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        debug_assert!(!self.slots.lock().is_free(slot.0));
        for (k, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            self.device.write(slot.sector(k), sector)?;
        }
        Ok(())
    }

    /// Loads the page stored in `slot`, keeping the slot.
    pub fn load(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), SwapError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        debug_assert!(!self.slots.lock().is_free(slot.0));
        for (k, sector) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            self.device.read(slot.sector(k), sector)?;
        }
        Ok(())
    }

    /// Loads the page stored in `slot` and frees the slot. Each slot is read back at
    /// most once.
    pub fn read(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), SwapError> {
        self.load(slot, page)?;
        self.free_slot(slot);
        Ok(())
    }

    /// Writes `page` to a newly allocated slot.
    pub fn swap_out(&self, page: &[u8]) -> Result<SwapSlot, SwapError> {
        let slot = self.allocate_slot()?;
        if let Err(err) = self.write(slot, page) {
            self.free_slot(slot);
            return Err(err);
        }
        trace!("swap: wrote {slot:?}");
        Ok(slot)
    }
}
