//! Victim selection for the frame pool.

use crate::mem::frame_table::FrameEntry;
use rand::{rngs::SmallRng, Rng, SeedableRng};

pub trait PageReplacementPolicy {
    /// Picks a frame to evict among `frames`, or `None` when no frame is both occupied
    /// and unpinned.
    ///
    /// The returned frame must satisfy [`FrameEntry::is_evictable`].
    fn select_victim(&mut self, frames: &[FrameEntry]) -> Option<usize>;
}

/// Uniformly random choice, drawing again whenever the pick cannot be evicted.
pub struct RandomEviction {
    rng: SmallRng,
}

impl RandomEviction {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl PageReplacementPolicy for RandomEviction {
    fn select_victim(&mut self, frames: &[FrameEntry]) -> Option<usize> {
        if !frames.iter().any(FrameEntry::is_evictable) {
            return None;
        }
        loop {
            let frame = self.rng.gen_range(0..frames.len());
            if frames[frame].is_evictable() {
                return Some(frame);
            }
        }
    }
}

/// Second chance: a frame whose page was accessed since the hand last passed is
/// skipped once, with its accessed bit cleared.
#[derive(Default)]
pub struct ClockEviction {
    hand: usize,
}

impl PageReplacementPolicy for ClockEviction {
    fn select_victim(&mut self, frames: &[FrameEntry]) -> Option<usize> {
        // two sweeps clear every accessed bit, so an evictable frame turns up by then
        for _ in 0..2 * frames.len() {
            let frame = self.hand;
            self.hand = (self.hand + 1) % frames.len();

            let entry = &frames[frame];
            if !entry.is_evictable() {
                continue;
            }
            match entry.occupant() {
                Some(page) if page.take_accessed() => continue,
                _ => return Some(frame),
            }
        }
        None
    }
}
