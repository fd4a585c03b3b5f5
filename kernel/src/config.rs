//! Boot-time configuration.

use crate::block::block_core::{BlockSector, BLOCK_SECTOR_SIZE};
use crate::mem::frame_allocator::placement_algorithms::{
    BestFit, FirstFit, NextFit, PlacementAlgorithm,
};
use crate::swapping::page_replacement::{ClockEviction, PageReplacementPolicy, RandomEviction};
use alloc::boxed::Box;
use vmstore_shared::sizes::{MB, SWAP_SECTORS};

/// How the page pool picks frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    #[default]
    NextFit,
    FirstFit,
    BestFit,
}

impl PlacementPolicy {
    pub fn algorithm(self) -> Box<dyn PlacementAlgorithm + Send> {
        match self {
            PlacementPolicy::NextFit => Box::new(NextFit::default()),
            PlacementPolicy::FirstFit => Box::new(FirstFit),
            PlacementPolicy::BestFit => Box::new(BestFit),
        }
    }
}

/// How the frame pool picks eviction victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    #[default]
    Random,
    Clock,
}

impl EvictionPolicy {
    pub fn policy(self, seed: u64) -> Box<dyn PageReplacementPolicy + Send> {
        match self {
            EvictionPolicy::Random => Box::new(RandomEviction::new(seed)),
            EvictionPolicy::Clock => Box::new(ClockEviction::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// Size of the filesystem device in sectors.
    pub fs_sectors: BlockSector,
    /// Size of the swap device in sectors.
    pub swap_sectors: BlockSector,
    /// Number of frames in the user pool.
    pub user_frames: usize,
    pub placement: PlacementPolicy,
    pub eviction: EvictionPolicy,
    /// Seed for random eviction.
    pub eviction_seed: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            fs_sectors: (4 * MB / BLOCK_SECTOR_SIZE) as BlockSector,
            swap_sectors: SWAP_SECTORS,
            user_frames: 256,
            placement: PlacementPolicy::default(),
            eviction: EvictionPolicy::default(),
            eviction_seed: 0x5eed_c0de,
        }
    }
}
