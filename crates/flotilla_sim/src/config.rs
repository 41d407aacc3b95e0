//! Simulation configuration
//!
//! Keys follow the property names the simulation has always used
//! (`world-length`, `N`, `radar-range`, ...). Every key is optional.

use flotilla_core::index::{IndexConfig, LockingMode, MAX_NODE_WIDTH};
use flotilla_core::math::Aabb;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// At most `max_restarts` restarts of one child within `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RestartBudget {
    pub max_restarts: u32,
    pub window_secs: f64,
}

impl RestartBudget {
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_secs.max(0.0))
    }
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window_secs: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SimConfig {
    pub world_length: f64,
    /// Autonomous population
    #[serde(rename = "N")]
    pub n: usize,
    /// Capacity for player-controlled ships
    pub players: usize,
    pub speed_variance: f64,
    pub radar_range: f64,
    pub extrapolate: bool,
    /// Execution threads; defaults to the available parallelism
    pub parallelism: Option<usize>,
    /// Barrier-synchronized cycles instead of free-running sampling
    pub phaser: bool,
    pub optimistic: bool,
    pub optimistic_height: u8,
    pub optimistic_retry_limit: u32,
    pub node_width: usize,
    pub compressed: bool,
    pub single_precision: bool,
    pub queue_capacity: usize,
    /// Metrics output directory (`config.txt`, `times.csv`)
    pub dir: Option<PathBuf>,
    pub restart_budget: RestartBudget,
    /// Delay before the first cycle sample
    pub warmup_secs: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            world_length: 20_000.0,
            n: 10_000,
            players: 500,
            speed_variance: 1.0,
            radar_range: 10.0,
            extrapolate: true,
            parallelism: None,
            phaser: false,
            optimistic: true,
            optimistic_height: 1,
            optimistic_retry_limit: 3,
            node_width: 10,
            compressed: false,
            single_precision: false,
            queue_capacity: 1000,
            dir: None,
            restart_budget: RestartBudget::default(),
            warmup_secs: 5.0,
        }
    }
}

impl SimConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.world_length > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "world-length must be positive, got {}",
                self.world_length
            )));
        }
        if !(self.radar_range > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "radar-range must be positive, got {}",
                self.radar_range
            )));
        }
        if self.speed_variance < 0.0 {
            return Err(ConfigError::Invalid("speed-variance must not be negative".into()));
        }
        if !(1..=MAX_NODE_WIDTH).contains(&self.node_width) {
            return Err(ConfigError::Invalid(format!(
                "node-width must be between 1 and {MAX_NODE_WIDTH}, got {}",
                self.node_width
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue-capacity must be at least 1".into()));
        }
        if self.parallelism == Some(0) {
            return Err(ConfigError::Invalid("parallelism must be at least 1".into()));
        }
        Ok(())
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::world(self.world_length)
    }

    pub fn locking(&self) -> LockingMode {
        if self.optimistic {
            LockingMode::Optimistic {
                height: self.optimistic_height,
                retry_limit: self.optimistic_retry_limit,
            }
        } else {
            LockingMode::Pessimistic
        }
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            locking: self.locking(),
            node_width: self.node_width,
            single_precision: self.single_precision,
            compressed: self.compressed,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Write retries a worker attempts before skipping a tick.
    pub fn write_retries(&self) -> u32 {
        if self.optimistic {
            self.optimistic_retry_limit
        } else {
            0
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs_f64(self.warmup_secs.max(0.0))
    }

    /// Startup banner, one line per entry.
    pub fn banner(&self) -> Vec<String> {
        vec![
            format!("World bounds: {}", self.bounds()),
            format!("N: {}", self.n),
            format!("Players: {}", self.players),
            format!("Parallelism: {}", self.parallelism()),
            format!("Phaser: {}", self.phaser),
            format!("Extrapolate: {}", self.extrapolate),
            String::new(),
            "Spatial index properties".to_string(),
            format!("Optimistic: {}", self.optimistic),
            format!("Optimistic height: {}", self.optimistic_height),
            format!("Optimistic retry limit: {}", self.optimistic_retry_limit),
            format!("Node width: {}", self.node_width),
            format!("Compressed: {}", self.compressed),
            format!("Single precision: {}", self.single_precision),
            format!("Queue capacity: {}", self.queue_capacity),
        ]
    }
}
