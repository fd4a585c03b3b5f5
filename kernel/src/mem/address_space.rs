//! Address spaces: a page table plus the descriptors of every page mapped into it.
//!
//! Pages are created unloaded and brought in by [`AddressSpace::handle_page_fault`] or
//! by the user-copy helpers. The descriptor map stands in for the not-present entries a
//! fault handler would look the page up by.

use super::frame_allocator::FrameNumber;
use super::page::{FileRegion, Page};
use super::{VirtualMemory, VmError};
use crate::fs::Inode;
use crate::paging::PageTable;
use crate::sync::mutex::Mutex;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use log::debug;
use vmstore_shared::mem::{
    is_user_address, page_offset, page_round_down, MAX_USER_STACK_SIZE, PAGE_FRAME_SIZE,
    STACK_FAULT_SLACK, USER_STACK_TOP,
};

pub struct AddressSpace {
    vm: Arc<VirtualMemory>,
    table: Arc<Mutex<PageTable>>,
    /// Page descriptors keyed by page address.
    pages: Mutex<BTreeMap<usize, Arc<Page>>>,
}

impl AddressSpace {
    pub fn new(vm: Arc<VirtualMemory>) -> Self {
        Self {
            vm,
            table: Arc::new(Mutex::new(PageTable::new())),
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn page_table(&self) -> &Arc<Mutex<PageTable>> {
        &self.table
    }

    /// The descriptor of the page containing `vaddr`.
    pub fn page(&self, vaddr: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&page_round_down(vaddr)).cloned()
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    fn check_page_address(vaddr: usize) -> Result<(), VmError> {
        if !is_user_address(vaddr) {
            return Err(VmError::BadAddress(vaddr));
        }
        if page_offset(vaddr) != 0 {
            return Err(VmError::Misaligned(vaddr));
        }
        Ok(())
    }

    fn insert(&self, page: Page) -> Result<Arc<Page>, VmError> {
        let vaddr = page.vaddr();
        let mut pages = self.pages.lock();
        if pages.contains_key(&vaddr) {
            return Err(VmError::AlreadyMapped(vaddr));
        }
        let page = Arc::new(page);
        pages.insert(vaddr, page.clone());
        Ok(page)
    }

    /// Maps a page at `vaddr` holding `read_bytes` bytes of `inode` from `offset`
    /// followed by `zero_bytes` zeros. Nothing is read until the page is first touched.
    pub fn create_file_backed(
        &self,
        inode: Arc<Inode>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        vaddr: usize,
    ) -> Result<Arc<Page>, VmError> {
        Self::check_page_address(vaddr)?;
        if read_bytes + zero_bytes != PAGE_FRAME_SIZE {
            return Err(VmError::BadSegment(read_bytes + zero_bytes));
        }
        let region = FileRegion {
            inode,
            offset,
            read_bytes,
            zero_bytes,
        };
        self.insert(Page::new_file_backed(
            vaddr,
            writable,
            self.table.clone(),
            region,
        ))
    }

    /// Maps a zero-filled page at `vaddr`.
    pub fn create_zero(&self, vaddr: usize, writable: bool) -> Result<Arc<Page>, VmError> {
        Self::check_page_address(vaddr)?;
        self.insert(Page::new_zero(vaddr, writable, self.table.clone()))
    }

    /// Maps a segment of `inode` at `vaddr`: `read_bytes` bytes from `offset`, then
    /// `zero_bytes` zeros, split into pages the way a program loader lays them out.
    ///
    /// If any page cannot be mapped, none of the segment stays mapped.
    pub fn load_segment(
        &self,
        inode: &Arc<Inode>,
        offset: usize,
        vaddr: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        Self::check_page_address(vaddr)?;
        if (read_bytes + zero_bytes) % PAGE_FRAME_SIZE != 0 {
            return Err(VmError::BadSegment(read_bytes + zero_bytes));
        }

        let mut created = Vec::new();
        let (mut read_left, mut zero_left) = (read_bytes, zero_bytes);
        let (mut offset, mut upage) = (offset, vaddr);
        while read_left > 0 || zero_left > 0 {
            let page_read = read_left.min(PAGE_FRAME_SIZE);
            let page_zero = PAGE_FRAME_SIZE - page_read;

            let result = if page_read == 0 {
                self.create_zero(upage, writable)
            } else {
                self.create_file_backed(inode.clone(), offset, page_read, page_zero, writable, upage)
            };
            if let Err(err) = result {
                let mut pages = self.pages.lock();
                for vaddr in created {
                    pages.remove(&vaddr);
                }
                return Err(err);
            }
            created.push(upage);

            read_left -= page_read;
            zero_left -= page_zero;
            offset += page_read;
            upage += PAGE_FRAME_SIZE;
        }
        Ok(())
    }

    /// Whether a fault at `vaddr` with the stack pointer at `stack_pointer` should grow
    /// the stack.
    fn is_stack_access(vaddr: usize, stack_pointer: usize) -> bool {
        vaddr < USER_STACK_TOP
            && vaddr >= USER_STACK_TOP - MAX_USER_STACK_SIZE
            && vaddr >= stack_pointer.saturating_sub(STACK_FAULT_SLACK)
    }

    /// The stack page containing `vaddr`, created if no other thread got there first.
    fn grow_stack(&self, vaddr: usize) -> Arc<Page> {
        let upage = page_round_down(vaddr);
        self.pages
            .lock()
            .entry(upage)
            .or_insert_with(|| {
                debug!("growing stack to {upage:#x}");
                Arc::new(Page::new_zero(upage, true, self.table.clone()))
            })
            .clone()
    }

    /// Resolves a fault at `vaddr`. A fault just below the stack pointer inside the stack
    /// region maps a fresh zero page.
    pub fn handle_page_fault(
        &self,
        vaddr: usize,
        stack_pointer: usize,
        write: bool,
    ) -> Result<FrameNumber, VmError> {
        if !is_user_address(vaddr) {
            return Err(VmError::BadAddress(vaddr));
        }
        let page = match self.page(vaddr) {
            Some(page) => page,
            None if Self::is_stack_access(vaddr, stack_pointer) => self.grow_stack(vaddr),
            None => return Err(VmError::NotMapped(vaddr)),
        };
        if write && !page.writable() {
            return Err(VmError::ReadOnly(vaddr));
        }
        self.vm.resolve_fault(&page, false)
    }

    /// Runs `copy` on each page-sized piece of `[vaddr, vaddr + len)` with its frame
    /// pinned. `copy` gets the frame number, the offset in the page, and the range of the
    /// piece within the request.
    fn for_each_piece(
        &self,
        vaddr: usize,
        len: usize,
        write: bool,
        mut copy: impl FnMut(FrameNumber, usize, core::ops::Range<usize>),
    ) -> Result<(), VmError> {
        let mut done = 0;
        while done < len {
            let addr = vaddr.checked_add(done).ok_or(VmError::BadAddress(vaddr))?;
            if !is_user_address(addr) {
                return Err(VmError::BadAddress(addr));
            }
            let ofs = page_offset(addr);
            let chunk = (len - done).min(PAGE_FRAME_SIZE - ofs);
            let page = self.page(addr).ok_or(VmError::NotMapped(addr))?;
            if write && !page.writable() {
                return Err(VmError::ReadOnly(addr));
            }

            let frame = self.vm.resolve_fault(&page, true)?;
            copy(frame, ofs, done..done + chunk);
            {
                let mut table = self.table.lock();
                table.set_accessed(addr, true);
                if write {
                    table.set_dirty(addr, true);
                }
            }
            self.vm.frames().unlock(frame);
            done += chunk;
        }
        Ok(())
    }

    /// Copies user memory at `vaddr` into `buf`, loading pages as needed.
    pub fn read_user(&self, vaddr: usize, buf: &mut [u8]) -> Result<(), VmError> {
        let pool = self.vm.page_pool();
        self.for_each_piece(vaddr, buf.len(), false, |frame, ofs, range| {
            let len = range.len();
            buf[range].copy_from_slice(&pool.frame(frame)[ofs..ofs + len]);
        })
    }

    /// Copies `data` into user memory at `vaddr`, loading pages as needed.
    pub fn write_user(&self, vaddr: usize, data: &[u8]) -> Result<(), VmError> {
        let pool = self.vm.page_pool();
        self.for_each_piece(vaddr, data.len(), true, |frame, ofs, range| {
            let len = range.len();
            pool.frame(frame)[ofs..ofs + len].copy_from_slice(&data[range]);
        })
    }

    /// Unmaps every page, freeing its frame and swap slot. Safe to call more than once.
    ///
    /// A frame pinned by a copy still in progress is freed once the copy unpins it. Copies
    /// that start after teardown find nothing mapped.
    pub fn teardown(&self) {
        let _load = self.vm.load_lock();
        let pages = core::mem::take(&mut *self.pages.lock());
        if pages.is_empty() {
            return;
        }
        for page in pages.values() {
            // eviction needs the load lock, so the frame cannot change under us
            while let Some(frame) = page.frame() {
                if !self.vm.frames().is_pinned(frame) {
                    break;
                }
                core::hint::spin_loop();
            }
            self.vm.discard(page);
        }
        debug!("tore down {} page(s)", pages.len());
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::{test::ram_block, BlockType};
    use crate::fs::FileSystem;
    use crate::mem::page::PageLocation;
    use crate::mem::test::vm;
    use crate::swapping::SwapError;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    const PAGE: usize = PAGE_FRAME_SIZE;
    const CODE: usize = 0x0804_8000;

    fn file_with(fs: &FileSystem, data: &[u8]) -> Arc<Inode> {
        let sector = fs.create_inode(0, false, fs.root()).unwrap();
        let inode = fs.open(sector).unwrap();
        assert_eq!(inode.write_at(data, 0), data.len());
        inode
    }

    fn filesystem() -> FileSystem {
        FileSystem::format(ram_block(BlockType::FileSystem, 2048)).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn segments_load_lazily_from_the_file() {
        let fs = filesystem();
        let data = pattern(2 * PAGE + 100);
        let inode = file_with(&fs, &data);
        let space = AddressSpace::new(vm(4, 8));

        space
            .load_segment(&inode, 0, CODE, data.len(), 4 * PAGE - data.len(), false)
            .unwrap();
        assert_eq!(space.page_count(), 4);
        assert_eq!(space.page(CODE + 5).unwrap().location(), PageLocation::File);
        assert_eq!(space.page(CODE + 3 * PAGE).unwrap().location(), PageLocation::Zero);
        assert_eq!(space.page_table().lock().mapped_pages(), 0);

        let mut buf = vec![0xffu8; 4 * PAGE];
        space.read_user(CODE, &mut buf).unwrap();
        assert_eq!(&buf[..data.len()], &data[..]);
        assert!(buf[data.len()..].iter().all(|&b| b == 0));
        assert_eq!(space.page_table().lock().mapped_pages(), 4);
    }

    #[test]
    fn segment_offsets_follow_the_file() {
        let fs = filesystem();
        let data = pattern(3 * PAGE);
        let inode = file_with(&fs, &data);
        let space = AddressSpace::new(vm(4, 8));

        space.load_segment(&inode, PAGE, CODE, PAGE + 10, PAGE - 10, true).unwrap();
        let mut buf = vec![0u8; 20];
        space.read_user(CODE + PAGE, &mut buf).unwrap();
        assert_eq!(&buf[..10], &data[2 * PAGE..2 * PAGE + 10]);
        assert_eq!(&buf[10..], &[0; 10]);
    }

    #[test]
    fn bad_segments_map_nothing() {
        let fs = filesystem();
        let inode = file_with(&fs, &pattern(PAGE));
        let space = AddressSpace::new(vm(2, 2));

        assert_eq!(
            space.load_segment(&inode, 0, CODE + 1, PAGE, 0, false),
            Err(VmError::Misaligned(CODE + 1))
        );
        assert_eq!(
            space.load_segment(&inode, 0, CODE, 100, 0, false),
            Err(VmError::BadSegment(100))
        );
        // the third page collides with an existing mapping
        space.create_zero(CODE + 2 * PAGE, true).unwrap();
        assert_eq!(
            space.load_segment(&inode, 0, CODE, PAGE, 3 * PAGE, false),
            Err(VmError::AlreadyMapped(CODE + 2 * PAGE))
        );
        assert_eq!(space.page_count(), 1);
    }

    #[test]
    fn dirty_pages_survive_eviction_through_swap() {
        let vm = vm(2, 16);
        let space = AddressSpace::new(vm.clone());
        for n in 0..6 {
            space.create_zero(CODE + n * PAGE, true).unwrap();
        }
        for n in 0..6u8 {
            space
                .write_user(CODE + n as usize * PAGE + 100, &[n + 1; 64])
                .unwrap();
        }
        assert!(vm.swap().free_slots() < 16);

        for n in 0..6u8 {
            let mut buf = [0u8; 64];
            space.read_user(CODE + n as usize * PAGE + 100, &mut buf).unwrap();
            assert_eq!(buf, [n + 1; 64]);
        }
        assert_eq!(vm.frames().resident_frames(), 2);
    }

    #[test]
    fn clean_pages_return_to_their_backing() {
        let fs = filesystem();
        let inode = file_with(&fs, &pattern(PAGE));
        let vm = vm(1, 4);
        let space = AddressSpace::new(vm.clone());
        let code = space
            .create_file_backed(inode, 0, PAGE, 0, false, CODE)
            .unwrap();
        let zero = space.create_zero(CODE + PAGE, true).unwrap();

        space.handle_page_fault(CODE, 0, false).unwrap();
        space.handle_page_fault(CODE + PAGE, 0, false).unwrap();
        assert_eq!(code.location(), PageLocation::File);
        space.handle_page_fault(CODE, 0, false).unwrap();
        assert_eq!(zero.location(), PageLocation::Zero);
        assert_eq!(vm.swap().free_slots(), 4);
    }

    #[test]
    fn dirty_file_pages_go_to_swap() {
        let fs = filesystem();
        let inode = file_with(&fs, &pattern(PAGE));
        let vm = vm(1, 4);
        let space = AddressSpace::new(vm.clone());
        let data = space
            .create_file_backed(inode.clone(), 0, PAGE, 0, true, CODE)
            .unwrap();
        space.create_zero(CODE + PAGE, true).unwrap();

        space.write_user(CODE + 10, b"changed").unwrap();
        space.handle_page_fault(CODE + PAGE, 0, false).unwrap();
        assert!(matches!(data.location(), PageLocation::Swap(_)));
        assert_eq!(vm.swap().free_slots(), 3);

        let mut buf = [0u8; 7];
        space.read_user(CODE + 10, &mut buf).unwrap();
        assert_eq!(&buf, b"changed");
        // the file keeps its old contents
        let mut file = [0u8; 7];
        assert_eq!(inode.read_at(&mut file, 10), 7);
        assert_eq!(&file[..], &pattern(PAGE)[10..17]);
    }

    #[test]
    fn pages_read_back_from_swap_go_back_to_swap() {
        let vm = vm(1, 4);
        let space = AddressSpace::new(vm.clone());
        let a = space.create_zero(CODE, true).unwrap();
        space.create_zero(CODE + PAGE, true).unwrap();

        space.write_user(CODE, b"only copy").unwrap();
        space.handle_page_fault(CODE + PAGE, 0, false).unwrap();
        assert!(matches!(a.location(), PageLocation::Swap(_)));

        let mut buf = [0u8; 9];
        space.read_user(CODE, &mut buf).unwrap();
        assert_eq!(vm.swap().free_slots(), 4);
        assert!(!space.page_table().lock().is_dirty(CODE));

        // clean in the page table, but swap held the only other copy
        space.handle_page_fault(CODE + PAGE, 0, false).unwrap();
        assert!(matches!(a.location(), PageLocation::Swap(_)));
        space.read_user(CODE, &mut buf).unwrap();
        assert_eq!(&buf, b"only copy");
    }

    #[test]
    fn full_swap_keeps_the_victim_resident() {
        let vm = vm(1, 0);
        let space = AddressSpace::new(vm.clone());
        let a = space.create_zero(CODE, true).unwrap();
        space.create_zero(CODE + PAGE, true).unwrap();
        space.write_user(CODE, &[7; 16]).unwrap();

        assert_eq!(
            space.handle_page_fault(CODE + PAGE, 0, false),
            Err(VmError::Swap(SwapError::Full))
        );
        assert!(a.is_loaded());
        assert!(space.page_table().lock().is_dirty(CODE));
        let mut buf = [0u8; 16];
        space.read_user(CODE, &mut buf).unwrap();
        assert_eq!(buf, [7; 16]);
    }

    #[test]
    fn stack_grows_near_the_stack_pointer() {
        let space = AddressSpace::new(vm(4, 4));
        let sp = USER_STACK_TOP - 2 * PAGE;

        space.handle_page_fault(sp - 4, sp, true).unwrap();
        assert!(space.page(sp - 4).unwrap().is_loaded());
        space.handle_page_fault(sp - 32, sp, true).unwrap();

        assert_eq!(
            space.handle_page_fault(sp - PAGE - 64, sp, true),
            Err(VmError::NotMapped(sp - PAGE - 64))
        );
        let deep = USER_STACK_TOP - MAX_USER_STACK_SIZE - 8;
        assert_eq!(
            space.handle_page_fault(deep, deep, true),
            Err(VmError::NotMapped(deep))
        );
        assert_eq!(
            space.handle_page_fault(USER_STACK_TOP, 0, false),
            Err(VmError::BadAddress(USER_STACK_TOP))
        );
    }

    #[test]
    fn racing_stack_faults_share_one_page() {
        let space = Arc::new(AddressSpace::new(vm(4, 4)));
        let sp = USER_STACK_TOP - 2 * PAGE;
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let space = space.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    space.handle_page_fault(sp - 4, sp, true)
                })
            })
            .collect();
        let frames: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();
        assert_eq!(frames[0], frames[1]);
        assert_eq!(space.page_count(), 1);
    }

    #[test]
    fn read_only_pages_refuse_writes() {
        let space = AddressSpace::new(vm(2, 2));
        space.create_zero(CODE, false).unwrap();
        assert_eq!(space.write_user(CODE + 8, b"x"), Err(VmError::ReadOnly(CODE + 8)));
        assert_eq!(
            space.handle_page_fault(CODE, 0, true),
            Err(VmError::ReadOnly(CODE))
        );
        assert!(space.handle_page_fault(CODE, 0, false).is_ok());
        assert!(!space.page_table().lock().is_writable(CODE));
    }

    #[test]
    fn unmapped_and_misplaced_pages() {
        let space = AddressSpace::new(vm(2, 2));
        let mut buf = [0u8; 4];
        assert_eq!(space.read_user(CODE, &mut buf), Err(VmError::NotMapped(CODE)));
        assert_eq!(space.create_zero(CODE + 1, true).err(), Some(VmError::Misaligned(CODE + 1)));
        assert_eq!(
            space.create_zero(USER_STACK_TOP, true).err(),
            Some(VmError::BadAddress(USER_STACK_TOP))
        );
        space.create_zero(CODE, true).unwrap();
        assert_eq!(space.create_zero(CODE, true).err(), Some(VmError::AlreadyMapped(CODE)));
    }

    #[test]
    fn copies_span_page_boundaries() {
        let space = AddressSpace::new(vm(2, 4));
        space.create_zero(CODE, true).unwrap();
        space.create_zero(CODE + PAGE, true).unwrap();
        let data = pattern(300);
        space.write_user(CODE + PAGE - 150, &data).unwrap();
        let mut buf = vec![0u8; 300];
        space.read_user(CODE + PAGE - 150, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn short_file_fails_the_fault() {
        let fs = filesystem();
        let inode = file_with(&fs, &pattern(100));
        let vm = vm(2, 2);
        let space = AddressSpace::new(vm.clone());
        space.create_file_backed(inode, 0, 200, PAGE - 200, false, CODE).unwrap();

        assert_eq!(
            space.handle_page_fault(CODE, 0, false),
            Err(VmError::ShortRead {
                expected: 200,
                read: 100
            })
        );
        assert_eq!(vm.page_pool().free_frames(), 2);
        assert_eq!(vm.frames().resident_frames(), 0);
    }

    #[test]
    fn teardown_returns_frames_and_slots() {
        let vm = vm(2, 8);
        let space = AddressSpace::new(vm.clone());
        for n in 0..5 {
            space.create_zero(CODE + n * PAGE, true).unwrap();
            space.write_user(CODE + n * PAGE, &[1; 8]).unwrap();
        }
        assert_eq!(vm.swap().free_slots(), 5);

        space.teardown();
        assert_eq!(space.page_count(), 0);
        assert_eq!(vm.page_pool().free_frames(), 2);
        assert_eq!(vm.swap().free_slots(), 8);
        assert_eq!(space.page_table().lock().mapped_pages(), 0);
        space.teardown();

        let other = AddressSpace::new(vm.clone());
        other.create_zero(CODE, true).unwrap();
        other.write_user(CODE, &[2; 8]).unwrap();
        drop(other);
        assert_eq!(vm.page_pool().free_frames(), 2);
    }

    #[test]
    fn teardown_waits_for_pinned_copies() {
        let vm = vm(2, 4);
        let space = Arc::new(AddressSpace::new(vm.clone()));
        let page = space.create_zero(CODE, true).unwrap();
        let frame = vm.resolve_fault(&page, true).unwrap();

        let teardown = thread::spawn({
            let space = space.clone();
            move || space.teardown()
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!teardown.is_finished());
        assert!(page.is_loaded());

        vm.frames().unlock(frame);
        teardown.join().unwrap();
        assert!(page.is_retired());
        assert_eq!(vm.page_pool().free_frames(), 2);
        assert_eq!(space.write_user(CODE, b"late"), Err(VmError::NotMapped(CODE)));
        assert_eq!(vm.resolve_fault(&page, false), Err(VmError::NotMapped(CODE)));
    }

    #[test]
    fn concurrent_faults_share_the_frame_pool() {
        let vm = vm(6, 64);
        let handles: Vec<_> = (0..4u8)
            .map(|n| {
                let vm = vm.clone();
                thread::spawn(move || {
                    let space = AddressSpace::new(vm);
                    for page in 0..8 {
                        space.create_zero(CODE + page * PAGE, true).unwrap();
                    }
                    for round in 0..3u8 {
                        for page in 0..8 {
                            let value = n.wrapping_mul(64).wrapping_add(round * 8 + page as u8);
                            space.write_user(CODE + page * PAGE + 7, &[value; 32]).unwrap();
                        }
                        for page in 0..8 {
                            let value = n.wrapping_mul(64).wrapping_add(round * 8 + page as u8);
                            let mut buf = [0u8; 32];
                            space.read_user(CODE + page * PAGE + 7, &mut buf).unwrap();
                            assert_eq!(buf, [value; 32]);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(vm.page_pool().free_frames(), 6);
        assert_eq!(vm.swap().free_slots(), 64);
    }
}
