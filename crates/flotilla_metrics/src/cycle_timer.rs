//! Cycle timing for barrier-synchronized runs

use super::ring_buffer::RingBuffer;
use std::time::{Duration, Instant};

pub struct CycleTimer {
    cycle_start: Instant,
    cycle_times: RingBuffer<Duration>,
}

impl CycleTimer {
    pub fn new(capacity: usize) -> Self {
        Self {
            cycle_start: Instant::now(),
            cycle_times: RingBuffer::new(capacity),
        }
    }

    pub fn begin_at(&mut self, at: Instant) {
        self.cycle_start = at;
    }

    pub fn end_at(&mut self, at: Instant) -> Duration {
        let elapsed = at.saturating_duration_since(self.cycle_start);
        self.cycle_times.push(elapsed);
        elapsed
    }

    /// Cycles per second over the window.
    pub fn rate(&self) -> f64 {
        let avg = self.cycle_times.average().as_secs_f64();
        if avg > 0.0 {
            1.0 / avg
        } else {
            0.0
        }
    }

    pub fn cycle_ms(&self) -> f64 {
        self.cycle_times.average().as_secs_f64() * 1000.0
    }

    pub fn cycle_range_ms(&self) -> (f64, f64) {
        let (min, max) = self.cycle_times.min_max();
        (min.as_secs_f64() * 1000.0, max.as_secs_f64() * 1000.0)
    }
}
