//! Virtual memory: the user page pool, the frame table, page descriptors and address
//! spaces.

pub mod address_space;
pub mod frame_allocator;
pub mod frame_table;
pub mod page;

use crate::fs;
use crate::swapping::page_replacement::PageReplacementPolicy;
use crate::swapping::{SwapError, SwapStore};
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{boxed::Box, sync::Arc};
use frame_allocator::{FrameNumber, PagePool, PallocFlags};
use frame_table::FramePool;
use log::trace;
use page::Page;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("every frame is pinned or free, nothing to evict")]
    NoEvictableFrame,
    #[error("no frame became free after repeated evictions")]
    OutOfFrames,
    #[error("page load read {read} of {expected} bytes")]
    ShortRead { expected: usize, read: usize },
    #[error("address {0:#x} is not mapped")]
    NotMapped(usize),
    #[error("page at {0:#x} is already mapped")]
    AlreadyMapped(usize),
    #[error("page at {0:#x} is read-only")]
    ReadOnly(usize),
    #[error("address {0:#x} is not page aligned")]
    Misaligned(usize),
    #[error("address {0:#x} is not a user address")]
    BadAddress(usize),
    #[error("segment of {0} bytes does not end on a page boundary")]
    BadSegment(usize),
    #[error("could not map page at {0:#x}")]
    MapFailed(usize),
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Fs(#[from] fs::Error),
}

/// The pieces every address space shares.
pub struct VirtualMemory {
    pages: Arc<PagePool>,
    frames: FramePool,
    swap: Arc<SwapStore>,
    /// Serializes page loads, eviction and teardown.
    load_lock: Mutex<()>,
}

impl VirtualMemory {
    pub fn new(
        pages: Arc<PagePool>,
        swap: Arc<SwapStore>,
        policy: Box<dyn PageReplacementPolicy + Send>,
    ) -> Self {
        Self {
            frames: FramePool::new(pages.clone(), swap.clone(), policy),
            pages,
            swap,
            load_lock: Mutex::new(()),
        }
    }

    pub fn page_pool(&self) -> &PagePool {
        &self.pages
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub(crate) fn load_lock(&self) -> MutexGuard<()> {
        self.load_lock.lock()
    }

    /// Makes `page` resident and mapped, loading it from its file, from swap, or with
    /// zeros. Returns the frame holding it.
    ///
    /// With `keep_locked` the frame stays pinned until [`FramePool::unlock`].
    pub fn resolve_fault(&self, page: &Arc<Page>, keep_locked: bool) -> Result<FrameNumber, VmError> {
        let _load = self.load_lock.lock();

        if page.is_retired() {
            return Err(VmError::NotMapped(page.vaddr()));
        }
        if let Some(frame) = page.frame() {
            if keep_locked {
                self.frames.lock(frame);
            }
            return Ok(frame);
        }

        let frame = self.frames.acquire(PallocFlags::USER)?;
        if let Err(err) = page
            .fill(frame, &self.pages, &self.swap)
            .and_then(|()| page.install(frame, &self.swap))
        {
            self.frames.release(frame);
            return Err(err);
        }
        self.frames.assign(frame, page.clone());
        if !keep_locked {
            self.frames.unlock(frame);
        }
        trace!("page {:#x} loaded into frame {frame}", page.vaddr());
        Ok(frame)
    }

    /// Frees whatever `page` holds. The caller holds the load lock.
    pub(crate) fn discard(&self, page: &Page) {
        if let Some(frame) = page.discard(&self.swap) {
            self.frames.release(frame);
        }
    }
}

#[cfg(test)]
pub mod test {
    use super::frame_allocator::placement_algorithms::NextFit;
    use super::*;
    use crate::block::block_core::{test::ram_block, BlockSector, BlockType};
    use crate::swapping::page_replacement::{ClockEviction, RandomEviction};
    use vmstore_shared::mem::SECTORS_PER_PAGE;

    /// A VM with `frames` user frames and `slots` swap slots.
    pub fn vm(frames: usize, slots: u32) -> Arc<VirtualMemory> {
        let _ = env_logger::builder().is_test(true).try_init();
        let swap = SwapStore::new(ram_block(
            BlockType::Swap,
            slots * SECTORS_PER_PAGE as BlockSector,
        ));
        Arc::new(VirtualMemory::new(
            Arc::new(PagePool::new(frames, Box::new(NextFit::default()))),
            Arc::new(swap),
            Box::new(RandomEviction::new(0x5eed)),
        ))
    }

    fn zero_page(vaddr: usize) -> Arc<Page> {
        let table = Arc::new(Mutex::new(crate::paging::PageTable::new()));
        Arc::new(Page::new_zero(vaddr, true, table))
    }

    #[test]
    fn full_pool_evicts_clean_pages_without_swap() {
        let vm = vm(2, 4);
        let pages: Vec<_> = (1..=3).map(|n| zero_page(n * 0x1000)).collect();
        for page in &pages {
            vm.resolve_fault(page, false).unwrap();
        }
        assert_eq!(vm.frames().resident_frames(), 2);
        let evicted: Vec<_> = pages.iter().filter(|page| !page.is_loaded()).collect();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].location(), page::PageLocation::Zero);
        assert_eq!(vm.swap().free_slots(), 4);
    }

    #[test]
    fn resolving_a_resident_page_reuses_its_frame() {
        let vm = vm(2, 1);
        let page = zero_page(0x1000);
        let frame = vm.resolve_fault(&page, false).unwrap();
        assert_eq!(vm.resolve_fault(&page, true), Ok(frame));
        assert!(vm.frames().is_pinned(frame));
        vm.frames().unlock(frame);
        assert!(!vm.frames().is_pinned(frame));
    }

    #[test]
    fn pinned_frames_are_never_evicted() {
        let vm = vm(2, 4);
        let a = zero_page(0x1000);
        let b = zero_page(0x2000);
        let c = zero_page(0x3000);
        let frame_a = vm.resolve_fault(&a, true).unwrap();
        vm.resolve_fault(&b, false).unwrap();

        vm.resolve_fault(&c, false).unwrap();
        assert_eq!(a.frame(), Some(frame_a));
        assert!(!b.is_loaded());

        // with every frame pinned there is nothing to evict
        let frame_c = vm.resolve_fault(&c, true).unwrap();
        assert_eq!(vm.resolve_fault(&b, false), Err(VmError::NoEvictableFrame));
        assert!(!b.is_loaded());
        vm.frames().unlock(frame_c);
        assert!(vm.resolve_fault(&b, false).is_ok());
        assert!(!c.is_loaded());
    }

    #[test]
    fn swap_slot_is_kept_until_the_page_is_mapped() {
        let vm = vm(1, 4);
        let table = Arc::new(Mutex::new(crate::paging::PageTable::new()));
        let a = Arc::new(Page::new_zero(0x1000, true, table.clone()));
        let b = Arc::new(Page::new_zero(0x2000, true, table.clone()));
        vm.resolve_fault(&a, false).unwrap();
        table.lock().set_dirty(0x1000, true);
        vm.resolve_fault(&b, false).unwrap();
        let page::PageLocation::Swap(slot) = a.location() else {
            panic!("dirty page was not swapped out");
        };

        // filled but never mapped, as when installing the mapping fails
        let frame = vm.frames().acquire(PallocFlags::USER).unwrap();
        a.fill(frame, vm.page_pool(), vm.swap()).unwrap();
        vm.frames().release(frame);
        assert_eq!(a.location(), page::PageLocation::Swap(slot));
        assert_eq!(vm.swap().free_slots(), 3);

        let frame = vm.resolve_fault(&a, false).unwrap();
        assert_eq!(a.location(), page::PageLocation::Resident(frame));
        assert_eq!(vm.swap().free_slots(), 4);
    }

    #[test]
    fn retired_pages_are_not_loaded_again() {
        let vm = vm(2, 4);
        let page = zero_page(0x1000);
        vm.resolve_fault(&page, false).unwrap();
        {
            let _load = vm.load_lock();
            vm.discard(&page);
        }
        assert!(page.is_retired());
        assert_eq!(vm.resolve_fault(&page, false), Err(VmError::NotMapped(0x1000)));
        assert_eq!(vm.page_pool().free_frames(), 2);
    }

    #[test]
    fn clock_policy_keeps_the_pool_live() {
        let swap = SwapStore::new(ram_block(BlockType::Swap, 8 * SECTORS_PER_PAGE as BlockSector));
        let vm = VirtualMemory::new(
            Arc::new(PagePool::new(3, Box::new(NextFit::default()))),
            Arc::new(swap),
            Box::new(ClockEviction::default()),
        );
        let pages: Vec<_> = (1..=10).map(|n| zero_page(n * 0x1000)).collect();
        for _ in 0..3 {
            for page in &pages {
                vm.resolve_fault(page, false).unwrap();
                assert!(page.is_loaded());
            }
        }
        assert_eq!(vm.frames().resident_frames(), 3);
    }
}
