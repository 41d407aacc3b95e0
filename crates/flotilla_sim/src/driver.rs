//! Simulation driver
//!
//! Owns one run: the world, the player admission controller, the supervisor
//! and the shutdown signal the monitor listens to.

use crate::admission::{AdmissionController, AdmissionError};
use crate::behavior::{Behavior, Drift};
use crate::command::WorkerHandle;
use crate::config::{ConfigError, SimConfig};
use crate::monitor::{CycleMode, CycleMonitor};
use crate::supervisor::{Supervisor, SupervisorError, SupervisorHandle};
use crate::world::World;
use flotilla_metrics::{MetricsDir, SeriesError};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Series(#[from] SeriesError),

    #[error("monitor task failed: {0}")]
    Monitor(#[from] JoinError),
}

pub struct Simulation {
    world: Arc<World>,
    admission: Arc<AdmissionController>,
    supervisor: SupervisorHandle,
    supervisor_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    metrics: Option<MetricsDir>,
}

impl Simulation {
    /// Start a run of drifting ships. Must be called inside a Tokio runtime.
    pub fn start(config: SimConfig) -> Result<Self, SimError> {
        Self::start_with(config, Arc::new(Drift))
    }

    pub fn start_with(config: SimConfig, behavior: Arc<dyn Behavior>) -> Result<Self, SimError> {
        config.validate()?;

        let banner = config.banner();
        for line in banner.iter().filter(|line| !line.is_empty()) {
            info!("{line}");
        }
        let metrics = match &config.dir {
            Some(dir) => {
                let mut metrics = MetricsDir::create(dir)?;
                for line in &banner {
                    metrics.config_line(line)?;
                }
                Some(metrics)
            }
            None => None,
        };

        let admission = AdmissionController::new(config.players);
        let world = World::new(config, behavior);
        info!(codec = world.index().codec_name(), "spatial index ready");
        let (supervisor, supervisor_task) = Supervisor::start(Arc::clone(&world));

        Ok(Self {
            world,
            admission,
            supervisor,
            supervisor_task,
            shutdown: watch::Sender::new(false),
            metrics,
        })
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    /// Players currently admitted.
    pub fn admitted(&self) -> usize {
        self.admission.admitted()
    }

    /// Admit a player and start its ship. The slot is released when the
    /// ship leaves the simulation, for whatever reason.
    pub async fn spawn_controlled(&self, name: &str) -> Result<WorkerHandle, SimError> {
        let permit = self.admission.try_admit().inspect_err(|err| {
            debug!(player = name, %err, "admission refused");
        })?;
        Ok(self.supervisor.spawn_controlled(name, permit).await?)
    }

    pub fn get_worker(&self, name: &str) -> Option<WorkerHandle> {
        self.supervisor.get_worker(name)
    }

    /// A monitor tied to this run's shutdown signal and metrics directory.
    pub fn monitor(&self) -> Result<CycleMonitor, SimError> {
        let mut monitor = CycleMonitor::new(Arc::clone(&self.world), self.shutdown.subscribe());
        if let Some(metrics) = &self.metrics {
            let header = match CycleMode::from_config(self.world.config()) {
                CycleMode::FreeRunning { .. } => "cycle, fps",
                CycleMode::Barrier { .. } => "cycle, millis",
            };
            monitor = monitor.with_sink(Box::new(metrics.time_series(header)?));
        }
        Ok(monitor)
    }

    /// Monitor the run until `signal` resolves, then shut down.
    /// Returns the number of monitor samples taken.
    pub async fn run_until(self, signal: impl Future<Output = ()>) -> Result<u64, SimError> {
        let mut monitor = tokio::spawn(self.monitor()?.run());
        let finished = tokio::select! {
            _ = signal => None,
            joined = &mut monitor => Some(joined),
        };
        if finished.is_none() {
            info!("shutdown requested");
        }
        self.shutdown().await;

        let joined = match finished {
            Some(joined) => joined,
            None => monitor.await,
        };
        Ok(joined??)
    }

    /// Stop the monitor and every ship; returns once all records have left the index.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        self.supervisor.shutdown().await;
        if let Err(err) = self.supervisor_task.await {
            warn!(%err, "supervisor task ended abnormally");
        }
        self.world.index().close_writes();
        info!(
            remaining = self.world.index().len(),
            skipped = self.world.skipped().get(),
            "simulation stopped"
        );
    }
}
