//! Wall-clock time for record timestamps
//!
//! Timestamps are milliseconds since the clock's origin, so they stay small
//! enough to pack into 32 bits for compressed records.

use std::time::{Duration, Instant};

/// Milliseconds since the simulation clock origin
pub type Millis = u64;

/// Monotonic simulation clock shared by all workers.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    origin: Instant,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Millis {
        self.millis_at(Instant::now())
    }

    pub fn millis_at(&self, instant: Instant) -> Millis {
        instant.saturating_duration_since(self.origin).as_millis() as Millis
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds between two timestamps (zero if `to` precedes `from`).
pub fn seconds_between(from: Millis, to: Millis) -> f64 {
    Duration::from_millis(to.saturating_sub(from)).as_secs_f64()
}
