//! Smallest-first allocator for request correlation ids.

use std::collections::BTreeSet;

/// Hands out small non-negative integers, preferring released ones.
///
/// `allocate` returns the smallest id not currently outstanding. `free` is
/// idempotent: releasing an id twice, or one that was never allocated,
/// leaves the dispenser unchanged.
///
/// ```
/// use sockwire::IdDispenser;
///
/// let mut ids = IdDispenser::new();
/// assert_eq!(ids.allocate(), 0);
/// assert_eq!(ids.allocate(), 1);
/// ids.free(0);
/// assert_eq!(ids.allocate(), 0);
/// assert_eq!(ids.allocate(), 2);
/// ```
#[derive(Debug, Default)]
pub struct IdDispenser {
    /// Next never-used id.
    next: u32,
    /// Released ids below `next`.
    free: BTreeSet<u32>,
}

impl IdDispenser {
    /// Create an empty dispenser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the smallest id not currently outstanding.
    pub fn allocate(&mut self) -> u32 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Release an id for reuse.
    pub fn free(&mut self, id: u32) {
        if id >= self.next {
            return;
        }
        if id + 1 == self.next {
            // Shrink the high-water mark instead of growing the free set.
            self.next = id;
            while let Some(&top) = self.free.last() {
                if top + 1 != self.next {
                    break;
                }
                self.free.pop_last();
                self.next = top;
            }
            return;
        }
        self.free.insert(id);
    }

    /// Whether `id` is currently allocated.
    pub fn is_outstanding(&self, id: u32) -> bool {
        id < self.next && !self.free.contains(&id)
    }

    /// Number of outstanding ids.
    pub fn outstanding(&self) -> usize {
        self.next as usize - self.free.len()
    }
}
