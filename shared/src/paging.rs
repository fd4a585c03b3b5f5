// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation for user addresses, which always sit below the kernel offset.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::OFFSET;
use arbitrary_int::{u12, u20, Number};
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_number: u20,
}

impl PageTableEntry {
    /// A present user mapping of `frame`, or `None` if `frame` does not fit the
    /// 20-bit frame number field.
    pub fn user_mapping(frame: usize, writable: bool) -> Option<Self> {
        if frame > u20::MAX.value() as usize {
            return None;
        }
        Some(
            Self::DEFAULT
                .with_present(true)
                .with_user_supervisor(true)
                .with_read_write(writable)
                .with_page_frame_number(u20::new(frame as u32)),
        )
    }

    pub fn frame(&self) -> usize {
        self.page_frame_number().value() as usize
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(12..=31, r)]
    page_number: u20,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    /// Splits a user address. Kernel addresses are not representable.
    pub fn from_user(addr: usize) -> Option<Self> {
        (addr < OFFSET).then(|| Self::new_with_raw_value(addr as u32))
    }
}
