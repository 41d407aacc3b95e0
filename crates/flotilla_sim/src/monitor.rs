//! Cycle-rate monitor
//!
//! Free-running mode samples the shared tick counter once per interval and
//! reports frames per second per ship. Barrier mode joins the cycle phaser
//! as one more party and holds every cycle open for at least a minimum
//! length, reporting how long each cycle took.

use crate::config::SimConfig;
use crate::world::World;
use flotilla_metrics::{CycleSample, CycleTimer, RingBuffer, SampleSink, SeriesError, TickCounter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
pub const MIN_CYCLE: Duration = Duration::from_millis(10);
/// Samples in the rolling average.
pub const ROLLING_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    FreeRunning { interval: Duration },
    Barrier { min_cycle: Duration },
}

impl CycleMode {
    pub fn from_config(config: &SimConfig) -> Self {
        if config.phaser {
            CycleMode::Barrier {
                min_cycle: MIN_CYCLE,
            }
        } else {
            CycleMode::FreeRunning {
                interval: SAMPLE_INTERVAL,
            }
        }
    }
}

/// Turns tick counts into per-ship frame rates.
pub struct RateSampler {
    population: usize,
    last: Instant,
    cycle: u64,
    rolling: RingBuffer<f64>,
}

impl RateSampler {
    pub fn new(population: usize, start: Instant) -> Self {
        Self {
            population,
            last: start,
            cycle: 0,
            rolling: RingBuffer::new(ROLLING_WINDOW),
        }
    }

    /// Consume the ticks counted since the previous sample.
    pub fn sample(&mut self, ticks: &TickCounter, now: Instant) -> CycleSample {
        let taken = ticks.take();
        let seconds = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.cycle += 1;

        let rate = if seconds > 0.0 && self.population > 0 {
            (taken as f64 / self.population as f64) / seconds
        } else {
            0.0
        };
        self.rolling.push(rate);
        CycleSample {
            cycle: self.cycle,
            value: rate,
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    pub fn rolling_average(&self) -> f64 {
        self.rolling.average()
    }
}

pub struct CycleMonitor {
    world: Arc<World>,
    mode: CycleMode,
    warmup: Duration,
    sink: Option<Box<dyn SampleSink>>,
    shutdown: watch::Receiver<bool>,
    limit: Option<u64>,
}

impl CycleMonitor {
    pub fn new(world: Arc<World>, shutdown: watch::Receiver<bool>) -> Self {
        let config = world.config();
        Self {
            mode: CycleMode::from_config(config),
            warmup: config.warmup(),
            world,
            sink: None,
            shutdown,
            limit: None,
        }
    }

    pub fn with_mode(mut self, mode: CycleMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn SampleSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Stop on its own after `cycles` samples.
    pub fn with_limit(mut self, cycles: u64) -> Self {
        self.limit = Some(cycles);
        self
    }

    /// Sample until shutdown (or the limit). Returns the number of samples taken.
    pub async fn run(mut self) -> Result<u64, SeriesError> {
        if !self.pause(self.warmup).await {
            return Ok(0);
        }
        match self.mode {
            CycleMode::FreeRunning { interval } => self.free_running(interval).await,
            CycleMode::Barrier { min_cycle } => self.barrier(min_cycle).await,
        }
    }

    /// Sleep unless shutdown arrives first; false on shutdown.
    async fn pause(&mut self, duration: Duration) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.changed() => false,
        }
    }

    fn record(&mut self, sample: &CycleSample) -> Result<bool, SeriesError> {
        if let Some(sink) = self.sink.as_mut() {
            sink.record(sample)?;
        }
        Ok(self.limit.is_some_and(|limit| sample.cycle >= limit))
    }

    async fn free_running(&mut self, interval: Duration) -> Result<u64, SeriesError> {
        let world = Arc::clone(&self.world);
        world.ticks().take();
        let mut sampler = RateSampler::new(world.config().n, Instant::now());
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = self.shutdown.changed() => return Ok(sampler.cycles()),
            }
            let sample = sampler.sample(world.ticks(), Instant::now());
            info!(
                cycle = sample.cycle,
                average = sampler.rolling_average(),
                skipped = world.skipped().take(),
                "RATE: {:.3} fps",
                sample.value
            );
            if self.record(&sample)? {
                return Ok(sampler.cycles());
            }
        }
    }

    async fn barrier(&mut self, min_cycle: Duration) -> Result<u64, SeriesError> {
        let world = Arc::clone(&self.world);
        let Some(phaser) = world.phaser() else {
            warn!("barrier monitoring requested without a cycle phaser");
            return Ok(0);
        };
        let mut party = phaser.register();
        let mut timer = CycleTimer::new(ROLLING_WINDOW);
        let mut started = Instant::now();
        timer.begin_at(started);
        let mut cycle = 0;

        loop {
            let elapsed = started.elapsed();
            if elapsed < min_cycle && !self.pause(min_cycle - elapsed).await {
                return Ok(cycle);
            }
            tokio::select! {
                _ = party.arrive_and_await() => {}
                _ = self.shutdown.changed() => return Ok(cycle),
            }

            let now = Instant::now();
            let millis = now.saturating_duration_since(started).as_secs_f64() * 1000.0;
            timer.end_at(now);
            timer.begin_at(now);
            started = now;
            cycle += 1;

            let sample = CycleSample {
                cycle,
                value: millis,
            };
            let (fastest, slowest) = timer.cycle_range_ms();
            info!(
                cycle,
                average = timer.cycle_ms(),
                fastest,
                slowest,
                rate = timer.rate(),
                "CYCLE: {:.1} millis",
                millis
            );
            if self.record(&sample)? {
                return Ok(cycle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Drift;
    use std::sync::Mutex;

    #[test]
    fn steady_ticks_give_unit_rate() {
        let ticks = TickCounter::new();
        let t0 = Instant::now();
        let mut sampler = RateSampler::new(10, t0);

        for second in 1..=5 {
            ticks.add(10);
            let sample = sampler.sample(&ticks, t0 + Duration::from_secs(second));
            assert_eq!(sample.cycle, second);
            assert!((sample.value - 1.0).abs() < 1e-9);
        }
        assert_eq!(ticks.get(), 0);
    }

    #[test]
    fn rate_scales_with_elapsed_time_and_never_goes_negative() {
        let ticks = TickCounter::new();
        let t0 = Instant::now();
        let mut sampler = RateSampler::new(4, t0);

        ticks.add(40);
        assert!((sampler.sample(&ticks, t0 + Duration::from_secs(2)).value - 5.0).abs() < 1e-9);
        // no time elapsed
        ticks.add(8);
        assert_eq!(sampler.sample(&ticks, t0 + Duration::from_secs(2)).value, 0.0);

        let mut empty = RateSampler::new(0, t0);
        ticks.add(3);
        assert_eq!(empty.sample(&ticks, t0 + Duration::from_secs(1)).value, 0.0);
    }

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<CycleSample>>>);

    impl SampleSink for Shared {
        fn record(&mut self, sample: &CycleSample) -> Result<(), SeriesError> {
            self.0.lock().unwrap().push(*sample);
            Ok(())
        }
    }

    fn world(phaser: bool) -> Arc<World> {
        World::new(
            SimConfig {
                world_length: 1000.0,
                n: 4,
                phaser,
                ..SimConfig::default()
            },
            Arc::new(Drift),
        )
    }

    #[tokio::test]
    async fn free_running_monitor_stops_at_limit() {
        let world = world(false);
        let (_stop, shutdown) = watch::channel(false);
        let samples = Shared::default();

        let taken = CycleMonitor::new(Arc::clone(&world), shutdown)
            .with_warmup(Duration::ZERO)
            .with_mode(CycleMode::FreeRunning {
                interval: Duration::from_millis(10),
            })
            .with_sink(Box::new(samples.clone()))
            .with_limit(3)
            .run()
            .await
            .unwrap();

        assert_eq!(taken, 3);
        let samples = samples.0.lock().unwrap();
        assert_eq!(samples.iter().map(|s| s.cycle).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(samples.iter().all(|s| s.value >= 0.0));
    }

    #[tokio::test]
    async fn barrier_monitor_holds_cycles_open() {
        let world = world(true);
        let (_stop, shutdown) = watch::channel(false);
        let samples = Shared::default();

        let taken = CycleMonitor::new(Arc::clone(&world), shutdown)
            .with_warmup(Duration::ZERO)
            .with_sink(Box::new(samples.clone()))
            .with_limit(5)
            .run()
            .await
            .unwrap();

        assert_eq!(taken, 5);
        let samples = samples.0.lock().unwrap();
        assert_eq!(samples.len(), 5);
        assert!(samples.iter().all(|s| s.value >= 10.0));
    }

    #[tokio::test]
    async fn shutdown_during_warmup_takes_no_samples() {
        let world = world(false);
        let (stop, shutdown) = watch::channel(false);
        let monitor = tokio::spawn(CycleMonitor::new(world, shutdown).run());

        stop.send_replace(true);
        assert_eq!(monitor.await.unwrap().unwrap(), 0);
    }
}
