//! Per-address-space page tables.
//!
//! Entries use the hardware layout from `vmstore_shared::paging`; frame numbers index the
//! user page pool.

use crate::mem::frame_allocator::FrameNumber;
use alloc::collections::BTreeMap;
use core::fmt;
use vmstore_shared::mem::{page_offset, PAGE_FRAME_SIZE};
use vmstore_shared::paging::{PageTableEntry, VirtualAddress};

#[derive(Default)]
pub struct PageTable {
    /// Present entries keyed by virtual page number.
    entries: BTreeMap<u32, PageTableEntry>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn page_number(vaddr: usize) -> Option<u32> {
        VirtualAddress::from_user(vaddr).map(|va| va.page_number().value())
    }

    fn entry_mut(&mut self, vaddr: usize) -> Option<&mut PageTableEntry> {
        self.entries.get_mut(&Self::page_number(vaddr)?)
    }

    pub fn entry(&self, vaddr: usize) -> Option<PageTableEntry> {
        self.entries.get(&Self::page_number(vaddr)?).copied()
    }

    /// Maps the page containing `vaddr` to `frame`.
    ///
    /// Fails if `vaddr` is not a user address, the page is already mapped, or `frame`
    /// does not fit in an entry.
    pub fn set_mapping(&mut self, vaddr: usize, frame: FrameNumber, writable: bool) -> bool {
        let Some(page) = Self::page_number(vaddr) else {
            return false;
        };
        let Some(entry) = PageTableEntry::user_mapping(frame, writable) else {
            return false;
        };
        if self.entries.contains_key(&page) {
            return false;
        }
        self.entries.insert(page, entry);
        true
    }

    /// Removes the mapping of the page containing `vaddr`, if any.
    pub fn clear_mapping(&mut self, vaddr: usize) {
        if let Some(page) = Self::page_number(vaddr) {
            self.entries.remove(&page);
        }
    }

    /// Physical address `vaddr` maps to, counting from the start of the user pool.
    pub fn translate(&self, vaddr: usize) -> Option<usize> {
        self.entry(vaddr)
            .map(|entry| entry.frame() * PAGE_FRAME_SIZE + page_offset(vaddr))
    }

    pub fn is_writable(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|entry| entry.read_write())
    }

    pub fn is_dirty(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|entry| entry.dirty())
    }

    pub fn set_dirty(&mut self, vaddr: usize, dirty: bool) {
        if let Some(entry) = self.entry_mut(vaddr) {
            *entry = entry.with_dirty(dirty);
        }
    }

    pub fn is_accessed(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|entry| entry.accessed())
    }

    pub fn set_accessed(&mut self, vaddr: usize, accessed: bool) {
        if let Some(entry) = self.entry_mut(vaddr) {
            *entry = entry.with_accessed(accessed);
        }
    }

    /// Clears the accessed bit, returning its previous value.
    pub fn take_accessed(&mut self, vaddr: usize) -> bool {
        match self.entry_mut(vaddr) {
            Some(entry) => {
                let accessed = entry.accessed();
                *entry = entry.with_accessed(false);
                accessed
            }
            None => false,
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(page, entry)| (page, entry.raw_value())))
            .finish()
    }
}
