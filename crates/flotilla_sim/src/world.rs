//! State shared by every worker of one simulation run

use crate::behavior::Behavior;
use crate::config::SimConfig;
use crate::phaser::CyclePhaser;
use flotilla_core::index::SpatialIndex;
use flotilla_core::math::Aabb;
use flotilla_core::time::SimClock;
use flotilla_metrics::TickCounter;
use std::sync::Arc;

pub struct World {
    config: SimConfig,
    bounds: Aabb,
    index: SpatialIndex,
    clock: SimClock,
    ticks: TickCounter,
    skipped: TickCounter,
    phaser: Option<Arc<CyclePhaser>>,
    behavior: Arc<dyn Behavior>,
}

impl World {
    pub fn new(config: SimConfig, behavior: Arc<dyn Behavior>) -> Arc<Self> {
        let bounds = config.bounds();
        let index = SpatialIndex::new(bounds, config.index_config());
        let phaser = config.phaser.then(CyclePhaser::new);
        Arc::new(Self {
            config,
            bounds,
            index,
            clock: SimClock::new(),
            ticks: TickCounter::new(),
            skipped: TickCounter::new(),
            phaser,
            behavior,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Completed ticks across all workers since the last sample.
    pub fn ticks(&self) -> &TickCounter {
        &self.ticks
    }

    /// Ticks abandoned because the index write kept failing on contention.
    pub fn skipped(&self) -> &TickCounter {
        &self.skipped
    }

    /// Present only in barrier mode.
    pub fn phaser(&self) -> Option<&Arc<CyclePhaser>> {
        self.phaser.as_ref()
    }

    pub fn behavior(&self) -> &dyn Behavior {
        self.behavior.as_ref()
    }
}
