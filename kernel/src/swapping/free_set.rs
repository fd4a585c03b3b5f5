use alloc::{vec, vec::Vec};

/// Keeps track of a set of slots, some of which can be free and some of which can be allocated.
///
/// Fast operations are:
///   - Find a free slot, and mark it as allocated
///   - Mark a (previously-allocated) slot as free.
///
/// Uses roughly 1.1 bits per available slot.
#[derive(Debug, Clone)]
pub struct FreeSet {
    /// One bit per slot, set while the slot is free.
    bitmap: Vec<u64>,
    /// Groups with at least one free slot.
    queue: Vec<u32>,
    free: u32,
}

impl FreeSet {
    /// Create a new FreeSet of `count` slots, all of them free.
    pub fn new_all_free(count: u32) -> Self {
        let group_count = count.div_ceil(64);
        let mut bitmap = vec![u64::MAX; group_count as usize];
        if count % 64 != 0 {
            if let Some(last) = bitmap.last_mut() {
                *last = (1 << (count % 64)) - 1;
            }
        }
        Self {
            bitmap,
            // lowest groups are handed out first
            queue: (0..group_count).rev().collect(),
            free: count,
        }
    }

    /// Allocate a slot.
    ///
    /// Returns `None` if no slots are available.
    ///
    /// This takes *O(1)* time.
    pub fn allocate(&mut self) -> Option<u32> {
        let group_index = self.queue.pop()?;
        let group = &mut self.bitmap[group_index as usize];
        debug_assert_ne!(*group, 0, "FreeSet consistency error");
        let index_in_group = group.trailing_zeros();
        // clear bit
        *group &= !(1 << index_in_group);
        if *group != 0 {
            // add back to queue
            self.queue.push(group_index);
        }
        self.free -= 1;
        Some(group_index * 64 + index_in_group)
    }

    /// Free a slot.
    ///
    /// Panics if the slot was already free.
    ///
    /// This takes *O(1)* time.
    pub fn free(&mut self, index: u32) {
        let group_index = index / 64;
        let index_in_group = index % 64;
        let group = &mut self.bitmap[group_index as usize];
        let add = *group == 0;
        assert!(
            (*group & (1 << index_in_group)) == 0,
            "FreeSet::free called on already free slot {index}"
        );
        // set bit
        *group |= 1 << index_in_group;
        if add {
            self.queue.push(group_index);
        }
        self.free += 1;
    }

    pub fn is_free(&self, index: u32) -> bool {
        self.bitmap
            .get((index / 64) as usize)
            .is_some_and(|group| group & (1 << (index % 64)) != 0)
    }

    pub fn free_count(&self) -> u32 {
        self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_every_slot_once() {
        let mut set = FreeSet::new_all_free(70);
        let mut seen = std::collections::BTreeSet::new();
        while let Some(slot) = set.allocate() {
            assert!(slot < 70);
            assert!(seen.insert(slot));
        }
        assert_eq!(seen.len(), 70);
        assert_eq!(set.free_count(), 0);
    }

    #[test]
    fn freed_slots_come_back() {
        let mut set = FreeSet::new_all_free(128);
        let a = set.allocate().unwrap();
        let b = set.allocate().unwrap();
        assert_ne!(a, b);
        assert!(!set.is_free(a));
        set.free(a);
        assert!(set.is_free(a));
        assert_eq!(set.allocate(), Some(a));
        assert_eq!(set.free_count(), 126);
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_panics() {
        let mut set = FreeSet::new_all_free(8);
        set.free(3);
    }

    #[test]
    fn slots_past_the_end_are_never_free() {
        let set = FreeSet::new_all_free(3);
        assert!(set.is_free(2));
        assert!(!set.is_free(3));
        assert!(!set.is_free(1000));
    }
}
