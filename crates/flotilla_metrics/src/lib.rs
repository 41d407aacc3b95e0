//! Flotilla Metrics - cycle-rate instrumentation
//!
//! The tick counter and the time-series writer are always available: the
//! cycle monitor depends on them. Rolling statistics (`RingBuffer`,
//! `CycleTimer`) vanish unless the `metrics` feature is enabled.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable rolling statistics (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use flotilla_metrics::{CycleTimer, TickCounter};
//!
//! let ticks = TickCounter::new();
//! ticks.tick();
//! let mut timer = CycleTimer::new(10); // Track last 10 cycles
//! let start = std::time::Instant::now();
//! timer.begin_at(start);
//! // ... wait for the cycle ...
//! timer.end_at(std::time::Instant::now());
//! println!("cycle: {:.1} ms at {:.1}/s", timer.cycle_ms(), timer.rate());
//! ```

mod counter;
mod series;

#[cfg(feature = "metrics")]
mod cycle_timer;
#[cfg(feature = "metrics")]
mod ring_buffer;

pub use counter::TickCounter;
pub use series::{CycleSample, MetricsDir, SampleSink, SeriesError, TimeSeries};

#[cfg(feature = "metrics")]
pub use cycle_timer::CycleTimer;
#[cfg(feature = "metrics")]
pub use ring_buffer::RingBuffer;

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
pub struct CycleTimer;

#[cfg(not(feature = "metrics"))]
impl CycleTimer {
    pub fn new(_capacity: usize) -> Self { Self }
    pub fn begin_at(&mut self, _at: std::time::Instant) {}
    pub fn end_at(&mut self, _at: std::time::Instant) -> std::time::Duration { std::time::Duration::ZERO }
    pub fn rate(&self) -> f64 { 0.0 }
    pub fn cycle_ms(&self) -> f64 { 0.0 }
    pub fn cycle_range_ms(&self) -> (f64, f64) { (0.0, 0.0) }
}

#[cfg(not(feature = "metrics"))]
pub struct RingBuffer<T>(std::marker::PhantomData<T>);

#[cfg(not(feature = "metrics"))]
impl<T> RingBuffer<T> {
    pub fn new(_capacity: usize) -> Self { Self(std::marker::PhantomData) }
    pub fn push(&mut self, _value: T) {}
    pub fn average(&self) -> T where T: Default { T::default() }
}
