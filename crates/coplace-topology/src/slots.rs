//! Lock-free slot accounting for one topology node.

use std::sync::atomic::{AtomicU32, Ordering};

/// Fixed slot capacity plus an atomic used-slot count.
///
/// `used` never exceeds `capacity` and never underflows.
#[derive(Debug)]
pub struct SlotCounter {
    capacity: u32,
    used: AtomicU32,
}

impl SlotCounter {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            used: AtomicU32::new(0),
        }
    }

    pub fn try_acquire(&self, slots: u32) -> bool {
        loop {
            let cur = self.used.load(Ordering::Relaxed);
            let next = cur.saturating_add(slots);
            if next > self.capacity {
                return false;
            }
            if self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Return slots, clamping at zero. Returns how many were actually released.
    pub fn release(&self, slots: u32) -> u32 {
        loop {
            let cur = self.used.load(Ordering::Relaxed);
            let next = cur.saturating_sub(slots);
            if self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return cur - next;
            }
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current usage (advisory under concurrency).
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.used())
    }
}
