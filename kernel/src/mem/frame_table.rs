//! Ownership of user frames: which page occupies each frame and whether it may be
//! evicted.

use super::frame_allocator::{FrameNumber, PagePool, PallocFlags};
use super::page::Page;
use super::VmError;
use crate::swapping::page_replacement::PageReplacementPolicy;
use crate::swapping::SwapStore;
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use arbitrary_int::{u7, Number};
use bitbybit::bitfield;
use log::debug;

/// Attempts at finding a free frame before giving up.
const MAX_ACQUIRE_ATTEMPTS: usize = 8;

#[bitfield(u8, default = 0)]
pub struct FrameFlags {
    /// Handed out by the page pool.
    #[bit(0, rw)]
    assigned: bool,
    /// Number of holders keeping the frame from being evicted.
    #[bits(1..=7, rw)]
    pins: u7,
}

#[derive(Default)]
pub struct FrameEntry {
    occupant: Option<Arc<Page>>,
    flags: FrameFlags,
}

impl FrameEntry {
    pub fn occupant(&self) -> Option<&Arc<Page>> {
        self.occupant.as_ref()
    }

    pub fn is_pinned(&self) -> bool {
        self.flags.pins().value() > 0
    }

    /// The frame holds a page and nobody has it pinned.
    pub fn is_evictable(&self) -> bool {
        self.flags.assigned() && self.occupant.is_some() && !self.is_pinned()
    }

    fn pin(&mut self) {
        let pins = self.flags.pins().value();
        assert!(pins < u7::MAX.value(), "frame pinned too many times");
        self.flags = self.flags.with_pins(u7::new(pins + 1));
    }

    fn unpin(&mut self) {
        let pins = self.flags.pins().value();
        assert!(pins > 0, "unpinning a frame that is not pinned");
        self.flags = self.flags.with_pins(u7::new(pins - 1));
    }
}

/// The frame table plus the policy that picks eviction victims.
pub struct FramePool {
    pages: Arc<PagePool>,
    swap: Arc<SwapStore>,
    table: Mutex<Box<[FrameEntry]>>,
    /// Serializes victim selection and write-back.
    eviction: Mutex<Box<dyn PageReplacementPolicy + Send>>,
}

impl FramePool {
    pub fn new(
        pages: Arc<PagePool>,
        swap: Arc<SwapStore>,
        policy: Box<dyn PageReplacementPolicy + Send>,
    ) -> Self {
        let table: Vec<FrameEntry> = (0..pages.frame_count())
            .map(|_| FrameEntry::default())
            .collect();
        Self {
            pages,
            swap,
            table: Mutex::new(table.into_boxed_slice()),
            eviction: Mutex::new(policy),
        }
    }

    /// Takes a frame from the page pool, evicting a page if the pool is empty.
    ///
    /// The frame comes back pinned and without an occupant.
    pub fn acquire(&self, flags: PallocFlags) -> Result<FrameNumber, VmError> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            if let Some(frame) = self.pages.get_page(flags | PallocFlags::USER) {
                let mut table = self.table.lock();
                let entry = &mut table[frame];
                debug_assert!(entry.occupant.is_none() && !entry.flags.assigned());
                entry.flags = FrameFlags::DEFAULT
                    .with_assigned(true)
                    .with_pins(u7::new(1));
                return Ok(frame);
            }
            self.evict_one()?;
        }
        Err(VmError::OutOfFrames)
    }

    /// Evicts one unpinned page and returns its frame to the page pool.
    ///
    /// Called with the page-fault lock held, so no page is being loaded meanwhile.
    pub fn evict_one(&self) -> Result<(), VmError> {
        let mut policy = self.eviction.lock();

        let (frame, page) = {
            let mut table = self.table.lock();
            let frame = policy
                .select_victim(&table)
                .ok_or(VmError::NoEvictableFrame)?;
            let entry = &mut table[frame];
            let Some(page) = entry.occupant.clone() else {
                return Err(VmError::NoEvictableFrame);
            };
            entry.pin();
            (frame, page)
        };

        // write-back runs without the frame-table lock
        if let Err(err) = page.evict(frame, &self.pages, &self.swap) {
            self.unlock(frame);
            return Err(err);
        }

        self.table.lock()[frame] = FrameEntry::default();
        self.pages.free_page(frame);
        drop(policy);

        debug!("evicted page {:#x} from frame {frame}", page.vaddr());
        Ok(())
    }

    /// Records `page` as the occupant of `frame`.
    pub fn assign(&self, frame: FrameNumber, page: Arc<Page>) {
        let mut table = self.table.lock();
        debug_assert!(table[frame].flags.assigned());
        table[frame].occupant = Some(page);
    }

    /// Gives `frame` back to the page pool without saving its contents.
    pub fn release(&self, frame: FrameNumber) {
        self.table.lock()[frame] = FrameEntry::default();
        self.pages.free_page(frame);
    }

    /// Keeps `frame` from being evicted until a matching [`FramePool::unlock`].
    pub fn lock(&self, frame: FrameNumber) {
        self.table.lock()[frame].pin();
    }

    pub fn unlock(&self, frame: FrameNumber) {
        self.table.lock()[frame].unpin();
    }

    pub fn is_pinned(&self, frame: FrameNumber) -> bool {
        self.table.lock()[frame].is_pinned()
    }

    pub fn occupant(&self, frame: FrameNumber) -> Option<Arc<Page>> {
        self.table.lock()[frame].occupant.clone()
    }

    /// Number of frames holding a page.
    pub fn resident_frames(&self) -> usize {
        self.table
            .lock()
            .iter()
            .filter(|entry| entry.occupant.is_some())
            .count()
    }
}
