//! Page descriptors: where the contents of one virtual page live.

use super::frame_allocator::{FrameNumber, PagePool};
use super::VmError;
use crate::fs::Inode;
use crate::paging::PageTable;
use crate::swapping::{SwapSlot, SwapStore};
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use log::{debug, trace};
use vmstore_shared::mem::PAGE_FRAME_SIZE;

/// Part of a file that supplies a page: `read_bytes` bytes from `offset`, then
/// `zero_bytes` zeros.
#[derive(Clone)]
pub struct FileRegion {
    pub inode: Arc<Inode>,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

/// Where a page's contents come from the next time it is loaded.
#[derive(Clone)]
enum Backing {
    File(FileRegion),
    Zero,
    Swap(SwapSlot),
    /// The frame holds the only copy.
    Memory,
}

/// Where a page is right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    Resident(FrameNumber),
    Swap(SwapSlot),
    File,
    Zero,
}

struct PageState {
    frame: Option<FrameNumber>,
    backing: Backing,
    /// Discarded by teardown; never loaded again.
    retired: bool,
}

pub struct Page {
    vaddr: usize,
    writable: bool,
    table: Arc<Mutex<PageTable>>,
    state: Mutex<PageState>,
}

impl Page {
    fn new(vaddr: usize, writable: bool, table: Arc<Mutex<PageTable>>, backing: Backing) -> Self {
        Self {
            vaddr,
            writable,
            table,
            state: Mutex::new(PageState {
                frame: None,
                backing,
                retired: false,
            }),
        }
    }

    pub fn new_file_backed(
        vaddr: usize,
        writable: bool,
        table: Arc<Mutex<PageTable>>,
        region: FileRegion,
    ) -> Self {
        assert_eq!(region.read_bytes + region.zero_bytes, PAGE_FRAME_SIZE);
        Self::new(vaddr, writable, table, Backing::File(region))
    }

    pub fn new_zero(vaddr: usize, writable: bool, table: Arc<Mutex<PageTable>>) -> Self {
        Self::new(vaddr, writable, table, Backing::Zero)
    }

    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn frame(&self) -> Option<FrameNumber> {
        self.state.lock().frame
    }

    pub fn is_loaded(&self) -> bool {
        self.frame().is_some()
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    pub fn location(&self) -> PageLocation {
        let state = self.state.lock();
        if let Some(frame) = state.frame {
            return PageLocation::Resident(frame);
        }
        match state.backing {
            Backing::File(_) => PageLocation::File,
            Backing::Zero => PageLocation::Zero,
            Backing::Swap(slot) => PageLocation::Swap(slot),
            Backing::Memory => unreachable!("page {:#x} lost its only copy", self.vaddr),
        }
    }

    /// Clears the accessed bit of the mapping, returning its previous value.
    pub fn take_accessed(&self) -> bool {
        self.table.lock().take_accessed(self.vaddr)
    }

    /// Copies the page's contents into `frame`. A swapped-out page keeps its slot until
    /// [`Page::install`] maps it.
    pub(super) fn fill(
        &self,
        frame: FrameNumber,
        pool: &PagePool,
        swap: &SwapStore,
    ) -> Result<(), VmError> {
        let mut state = self.state.lock();
        debug_assert!(state.frame.is_none());
        let mut contents = pool.frame(frame);

        match state.backing.clone() {
            Backing::File(region) => {
                let read = region
                    .inode
                    .read_at(&mut contents[..region.read_bytes], region.offset);
                if read != region.read_bytes {
                    return Err(VmError::ShortRead {
                        expected: region.read_bytes,
                        read,
                    });
                }
                contents[region.read_bytes..].fill(0);
            }
            Backing::Zero => contents.fill(0),
            Backing::Swap(slot) => {
                swap.load(slot, &mut contents)?;
                trace!("page {:#x} read back from {slot:?}", self.vaddr);
            }
            Backing::Memory => unreachable!("page {:#x} lost its only copy", self.vaddr),
        }
        Ok(())
    }

    /// Maps the page to `frame`, replacing any stale mapping. Once mapped, a page filled
    /// from swap gives up its slot and the frame holds its only copy.
    pub(super) fn install(&self, frame: FrameNumber, swap: &SwapStore) -> Result<(), VmError> {
        let mut state = self.state.lock();
        {
            let mut table = self.table.lock();
            table.clear_mapping(self.vaddr);
            if !table.set_mapping(self.vaddr, frame, self.writable) {
                return Err(VmError::MapFailed(self.vaddr));
            }
        }
        if let Backing::Swap(slot) = state.backing {
            swap.free_slot(slot);
            state.backing = Backing::Memory;
        }
        state.frame = Some(frame);
        Ok(())
    }

    /// Moves the page out of `frame`: the mapping goes first, then the contents are
    /// written to swap when they exist nowhere else.
    pub(super) fn evict(
        &self,
        frame: FrameNumber,
        pool: &PagePool,
        swap: &SwapStore,
    ) -> Result<(), VmError> {
        let mut state = self.state.lock();
        debug_assert_eq!(state.frame, Some(frame));

        let (dirty, accessed) = {
            let mut table = self.table.lock();
            let dirty = table.is_dirty(self.vaddr);
            let accessed = table.is_accessed(self.vaddr);
            table.clear_mapping(self.vaddr);
            (dirty, accessed)
        };

        if dirty || matches!(state.backing, Backing::Memory) {
            let written = swap.swap_out(&pool.frame(frame));
            match written {
                Ok(slot) => {
                    debug!("page {:#x} written to {slot:?}", self.vaddr);
                    state.backing = Backing::Swap(slot);
                }
                Err(err) => {
                    let mut table = self.table.lock();
                    table.set_mapping(self.vaddr, frame, self.writable);
                    table.set_dirty(self.vaddr, dirty);
                    table.set_accessed(self.vaddr, accessed);
                    return Err(err.into());
                }
            }
        }
        state.frame = None;
        Ok(())
    }

    /// Drops the page's frame and swap slot without saving anything. Returns the frame
    /// the page occupied.
    pub(super) fn discard(&self, swap: &SwapStore) -> Option<FrameNumber> {
        let mut state = self.state.lock();
        let frame = state.frame.take();
        if frame.is_some() {
            self.table.lock().clear_mapping(self.vaddr);
        }
        if let Backing::Swap(slot) = state.backing {
            swap.free_slot(slot);
        }
        state.backing = Backing::Zero;
        state.retired = true;
        frame
    }
}
