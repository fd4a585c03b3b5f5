//! The user page pool: a fixed set of page frames handed out one run at a time.

pub mod placement_algorithms;

use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{boxed::Box, vec, vec::Vec};
use bitbybit::bitfield;
use bitflags::bitflags;
use log::trace;
use placement_algorithms::PlacementAlgorithm;
use vmstore_shared::mem::PAGE_FRAME_SIZE;

/// Index of a frame in the page pool.
pub type FrameNumber = usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PallocFlags: u8 {
        /// Zero the page contents.
        const ZERO = 1 << 0;
        /// Take the page from the user pool.
        const USER = 1 << 1;
    }
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    /// The allocation continues into the following frame.
    #[bit(1, rw)]
    next: bool,
    #[bit(2, rw)]
    user: bool,
}

struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    placement: Box<dyn PlacementAlgorithm + Send>,
    frames_allocated: usize,
}

pub struct PagePool {
    frames: Box<[Mutex<Box<[u8]>>]>,
    core_map: Mutex<CoreMap>,
}

impl PagePool {
    pub fn new(frame_count: usize, placement: Box<dyn PlacementAlgorithm + Send>) -> Self {
        let frames: Vec<_> = (0..frame_count)
            .map(|_| Mutex::new(vec![0u8; PAGE_FRAME_SIZE].into_boxed_slice()))
            .collect();
        Self {
            frames: frames.into_boxed_slice(),
            core_map: Mutex::new(CoreMap {
                entries: vec![CoreMapEntry::default(); frame_count].into_boxed_slice(),
                placement,
                frames_allocated: 0,
            }),
        }
    }

    /// Allocates one frame.
    pub fn get_page(&self, flags: PallocFlags) -> Option<FrameNumber> {
        self.get_pages(1, flags)
    }

    /// Allocates `count` contiguous frames and returns the first.
    pub fn get_pages(&self, count: usize, flags: PallocFlags) -> Option<FrameNumber> {
        let mut core_map = self.core_map.lock();
        if core_map.frames_allocated + count > core_map.entries.len() {
            return None;
        }
        let CoreMap {
            entries, placement, ..
        } = &mut *core_map;
        let range = placement.place(entries, count)?;

        for i in range.clone() {
            assert!(!entries[i].allocated());
            entries[i] = CoreMapEntry::DEFAULT
                .with_allocated(true)
                .with_next(i + 1 < range.end)
                .with_user(flags.contains(PallocFlags::USER));
        }
        core_map.frames_allocated += count;
        drop(core_map);

        if flags.contains(PallocFlags::ZERO) {
            for frame in range.clone() {
                self.frame(frame).fill(0);
            }
        }
        trace!("palloc: frames {range:?}");
        Some(range.start)
    }

    /// Frees the allocation starting at `frame`. Returns the number of frames freed.
    pub fn free_page(&self, frame: FrameNumber) -> usize {
        let mut core_map = self.core_map.lock();
        let mut freed = 0;
        let mut i = frame;
        loop {
            let entry = core_map.entries[i];
            assert!(entry.allocated(), "freeing unallocated frame {i}");
            core_map.entries[i] = CoreMapEntry::DEFAULT;
            freed += 1;
            if !entry.next() {
                break;
            }
            i += 1;
        }
        core_map.frames_allocated -= freed;
        freed
    }

    /// Contents of `frame`.
    pub fn frame(&self, frame: FrameNumber) -> MutexGuard<Box<[u8]>> {
        self.frames[frame].lock()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn free_frames(&self) -> usize {
        let core_map = self.core_map.lock();
        core_map.entries.len() - core_map.frames_allocated
    }

    pub fn is_user_frame(&self, frame: FrameNumber) -> bool {
        self.core_map.lock().entries[frame].user()
    }
}
