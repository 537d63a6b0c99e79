//! Bounds how many pulses execute at once. This is the advisory throttle,
//! not the correctness guarantee — at-most-once execution is enforced by
//! `Queue::mark_processing`'s compare-and-swap, not by this counter.

use std::sync::atomic::{AtomicU32, Ordering};

pub struct ConcurrencyGuard {
    count: AtomicU32,
    max: u32,
}

impl ConcurrencyGuard {
    pub fn new(max: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            max,
        }
    }

    /// Reserve one slot. `false` if the cap is already reached.
    pub fn try_acquire(&self) -> bool {
        loop {
            let current = self.count.load(Ordering::SeqCst);
            if current >= self.max {
                return false;
            }
            if self
                .count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}
