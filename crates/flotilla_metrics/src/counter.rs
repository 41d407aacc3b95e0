//! Process-wide tick counter
//!
//! Workers add one per completed tick; the cycle monitor reads and resets it
//! once per sample.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TickCounter {
    ticks: AtomicU64,
}

impl TickCounter {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Atomically read the count and reset it to zero.
    pub fn take(&self) -> u64 {
        self.ticks.swap(0, Ordering::AcqRel)
    }
}
