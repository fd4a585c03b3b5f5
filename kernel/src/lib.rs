#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
