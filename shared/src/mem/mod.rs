use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// A page is moved to and from a block device one sector at a time.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0xC000_0000;

// User stacks grow down from just below the kernel.
pub const USER_STACK_TOP: usize = OFFSET;
pub const MAX_USER_STACK_SIZE: usize = 8 * MB;

// A push may fault up to this many bytes below the stack pointer (`pusha`).
pub const STACK_FAULT_SLACK: usize = 32;

const _: () = assert!(PAGE_FRAME_SIZE % SECTOR_SIZE == 0);

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_address(addr: usize) -> bool {
    addr < OFFSET
}
