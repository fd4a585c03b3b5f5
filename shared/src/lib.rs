#![cfg_attr(not(test), no_std)]

pub mod mem;
pub mod paging;
pub mod sizes;
