//! Ship workers
//!
//! One task per ship. Every tick the worker reads its radar, runs the
//! behavior, and publishes the new state to the spatial index. The worker is
//! the only writer of its own record; the record leaves the index whenever
//! the worker ends, whether it returns, fails, panics, or is cancelled.

use crate::admission::AdmissionPermit;
use crate::behavior::{spawn_state, BehaviorError, TickInput};
use crate::command::{Command, WorkerHandle};
use crate::world::World;
use flotilla_core::entity::{EntityId, SpatialToken};
use flotilla_core::index::IndexError;
use flotilla_core::math::Aabb;
use flotilla_core::record::{ShipState, Status};
use flotilla_core::time::{seconds_between, Millis};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipKind {
    /// Spawned at startup, restarted on failure
    Autonomous,
    /// Admitted on demand, driven by commands, never restarted
    Controlled,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Behavior(#[from] BehaviorError),

    #[error("index write failed: {0}")]
    Index(#[from] IndexError),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Why a worker stopped without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    Disconnected,
    Destroyed,
}

/// A ship's full record as its worker holds it.
#[derive(Debug, Clone)]
pub struct ShipRecord {
    pub id: EntityId,
    pub token: SpatialToken,
    pub state: ShipState,
    /// Routes controller commands to this ship; the index never sees it.
    pub owner: WorkerHandle,
}

enum TickOutcome {
    Published,
    Skipped,
    Disconnected,
}

/// Removes the record from the index when dropped.
struct IndexEntry {
    world: Arc<World>,
    token: SpatialToken,
}

impl Drop for IndexEntry {
    fn drop(&mut self) {
        if self.world.index().evict(self.token) {
            trace!(token = ?self.token, "record evicted");
        }
    }
}

pub struct ShipWorker {
    world: Arc<World>,
    handle: WorkerHandle,
    commands: Option<mpsc::Receiver<Command>>,
    shutdown: watch::Receiver<bool>,
    admission: Option<AdmissionPermit>,
}

impl ShipWorker {
    pub(crate) fn new(
        world: Arc<World>,
        handle: WorkerHandle,
        commands: Option<mpsc::Receiver<Command>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            world,
            handle,
            commands,
            shutdown,
            admission: None,
        }
    }

    /// Hold `permit` for as long as this worker lives.
    pub(crate) fn with_admission(mut self, permit: AdmissionPermit) -> Self {
        self.admission = Some(permit);
        self
    }

    fn initial_state(&self, now: Millis) -> ShipState {
        let config = self.world.config();
        let id = self.handle.id();
        match self.handle.kind() {
            ShipKind::Autonomous => spawn_state(id.0, self.world.bounds(), config.speed_variance, now),
            ShipKind::Controlled => {
                let mut state = spawn_state(id.0, self.world.bounds(), 0.0, now);
                state.velocity = Default::default();
                state.ex_velocity = Default::default();
                state
            }
        }
    }

    pub async fn run(mut self) -> Result<WorkerExit, WorkerError> {
        // Dropped last: the slot is released only after the record is gone.
        let _admission = self.admission.take();

        let world = Arc::clone(&self.world);
        let now = world.clock().now();
        let state = self.initial_state(now);
        let Some(token) = self.insert(&state).await? else {
            return Ok(WorkerExit::Shutdown);
        };
        let _entry = IndexEntry {
            world: Arc::clone(&world),
            token,
        };
        let mut party = world.phaser().map(|phaser| phaser.register());

        debug!(
            ship = self.handle.name(),
            id = %self.handle.id(),
            kind = ?self.handle.kind(),
            "worker started"
        );

        let mut record = ShipRecord {
            id: self.handle.id(),
            token,
            state,
            owner: self.handle.clone(),
        };
        let mut inbox = Vec::new();

        loop {
            if *self.shutdown.borrow() {
                return Ok(WorkerExit::Shutdown);
            }

            match self.tick(&mut record, &mut inbox).await? {
                TickOutcome::Published => {
                    world.ticks().tick();
                    if record.state.status == Status::Dead {
                        debug!(ship = record.owner.name(), "destroyed");
                        return Ok(WorkerExit::Destroyed);
                    }
                }
                TickOutcome::Skipped => world.skipped().tick(),
                TickOutcome::Disconnected => {
                    debug!(ship = record.owner.name(), "controller disconnected");
                    return Ok(WorkerExit::Disconnected);
                }
            }

            match party.as_mut() {
                Some(party) => {
                    tokio::select! {
                        _ = party.arrive_and_await() => {}
                        _ = self.shutdown.changed() => return Ok(WorkerExit::Shutdown),
                    }
                }
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// `None` if shutdown was requested while the insert kept contending.
    async fn insert(&self, state: &ShipState) -> Result<Option<SpatialToken>, WorkerError> {
        let index = self.world.index();
        let id = self.handle.id();
        let retries = self.world.config().write_retries();
        let token = with_retries(retries, &self.shutdown, move || index.submit_insert(id, state))
            .await
            .inspect_err(|err| debug!(ship = self.handle.name(), %err, "insert failed"))?;
        Ok(token)
    }

    /// Drain the mailbox without waiting. `false` once the controller is gone.
    fn drain_commands(&mut self, inbox: &mut Vec<Command>) -> bool {
        inbox.clear();
        let Some(commands) = self.commands.as_mut() else {
            return true;
        };
        loop {
            match commands.try_recv() {
                Ok(Command::Disconnect) => return false,
                Ok(command) => inbox.push(command),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    async fn tick(
        &mut self,
        record: &mut ShipRecord,
        inbox: &mut Vec<Command>,
    ) -> Result<TickOutcome, WorkerError> {
        if !self.drain_commands(inbox) {
            return Ok(TickOutcome::Disconnected);
        }

        let world = Arc::clone(&self.world);
        let config = world.config();
        let now = world.clock().now();

        let radar = Aabb::around(record.state.position, config.radar_range);
        let nearby = world.index().query(&radar);
        let input = TickInput {
            id: record.id,
            now,
            elapsed: seconds_between(record.state.ex_velocity_updated, now),
            nearby: &nearby,
            commands: inbox,
            bounds: world.bounds(),
        };
        let mut next = world.behavior().tick(&record.state, &input)?;
        if config.extrapolate {
            next.refresh_extrapolation(&record.state, now);
        } else {
            next.ex_velocity = next.velocity;
        }
        next.ex_velocity_updated = now;

        let index = world.index();
        let token = record.token;
        let staged = &next;
        let written = with_retries(config.write_retries(), &self.shutdown, move || {
            index.submit_update(token, staged)
        })
        .await;
        match written {
            Ok(Some(())) => {
                record.state = next;
                Ok(TickOutcome::Published)
            }
            Ok(None) => Ok(TickOutcome::Skipped),
            Err(err) if err.is_transient() => {
                debug!(ship = record.owner.name(), %err, "tick skipped");
                Ok(TickOutcome::Skipped)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Runs `write` until it succeeds, fails for good, or has been retried
/// `retries` times. `None` if shutdown was requested between attempts.
async fn with_retries<T, F, Fut>(
    retries: u32,
    shutdown: &watch::Receiver<bool>,
    mut write: F,
) -> Result<Option<T>, IndexError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IndexError>>,
{
    let mut attempt = 0;
    loop {
        match write().await {
            Ok(value) => return Ok(Some(value)),
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                if *shutdown.borrow() {
                    return Ok(None);
                }
                trace!(attempt, "write contended");
                tokio::task::yield_now().await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{Behavior, Drift};
    use crate::config::SimConfig;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn small_world(phaser: bool) -> Arc<World> {
        let config = SimConfig {
            world_length: 1000.0,
            n: 4,
            players: 1,
            phaser,
            node_width: 4,
            ..SimConfig::default()
        };
        World::new(config, Arc::new(Drift))
    }

    fn worker(world: &Arc<World>, id: u64, shutdown: watch::Receiver<bool>) -> ShipWorker {
        let handle = WorkerHandle::new(
            format!("ship-{id}").into(),
            EntityId(id),
            ShipKind::Autonomous,
            None,
        );
        ShipWorker::new(Arc::clone(world), handle, None, shutdown)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_publishes_ticks_and_evicts_on_shutdown() {
        let world = small_world(false);
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(worker(&world, 0, shutdown).run());

        wait_for(|| world.index().len() == 1 && world.ticks().get() > 3).await;
        stop.send_replace(true);

        assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Shutdown);
        assert!(world.index().is_empty());
    }

    #[tokio::test]
    async fn persistent_contention_exhausts_the_retry_budget() {
        let (stop, shutdown) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let contended = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(IndexError::ContentionExceeded { attempts: 1 })
        };

        let result = with_retries(3, &shutdown, contended).await;
        assert_eq!(result, Err(IndexError::ContentionExceeded { attempts: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        stop.send_replace(true);
        calls.store(0, Ordering::SeqCst);
        assert_eq!(with_retries(3, &shutdown, contended).await, Ok(None));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_queue_fails_the_insert_instead_of_spinning() {
        let world = small_world(false);
        world.index().close_writes();
        let (_stop, shutdown) = watch::channel(false);

        let result = worker(&world, 3, shutdown).run().await;
        assert!(matches!(
            result,
            Err(WorkerError::Index(IndexError::QueueClosed))
        ));
        assert!(world.index().is_empty());
    }

    #[tokio::test]
    async fn cancelled_worker_leaves_no_record() {
        let world = small_world(false);
        let (_stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(worker(&world, 1, shutdown).run());

        wait_for(|| world.index().len() == 1).await;
        task.abort();
        let _ = task.await;

        assert!(world.index().is_empty());
    }

    struct Faulty {
        panic: bool,
        tripped: AtomicBool,
    }

    impl Behavior for Faulty {
        fn tick(&self, _me: &ShipState, input: &TickInput<'_>) -> Result<ShipState, BehaviorError> {
            self.tripped.store(true, Ordering::SeqCst);
            if self.panic {
                panic!("thruster exploded");
            }
            Err(BehaviorError::Failed {
                id: input.id,
                reason: "navigation lost".into(),
            })
        }
    }

    #[tokio::test]
    async fn failing_behavior_ends_worker_and_evicts() {
        for panic in [false, true] {
            let behavior = Arc::new(Faulty {
                panic,
                tripped: AtomicBool::new(false),
            });
            let world = World::new(
                SimConfig {
                    world_length: 1000.0,
                    ..SimConfig::default()
                },
                behavior.clone(),
            );
            let (_stop, shutdown) = watch::channel(false);

            let joined = tokio::spawn(worker(&world, 2, shutdown).run()).await;

            assert!(behavior.tripped.load(Ordering::SeqCst));
            match joined {
                Ok(result) => assert!(!panic && matches!(result, Err(WorkerError::Behavior(_)))),
                Err(err) => assert!(panic && err.is_panic()),
            }
            assert!(world.index().is_empty());
        }
    }

    #[tokio::test]
    async fn controlled_worker_stops_on_disconnect() {
        let world = small_world(false);
        let (_stop, shutdown) = watch::channel(false);
        let (tx, rx) = mpsc::channel(8);
        let handle = WorkerHandle::new("player".into(), EntityId(100), ShipKind::Controlled, None);
        let ship = ShipWorker::new(Arc::clone(&world), handle, Some(rx), shutdown);
        let task = tokio::spawn(ship.run());

        tx.send(Command::Steer { ax: 1.0, ay: 0.0 }).await.unwrap();
        wait_for(|| world.ticks().get() > 2).await;
        tx.send(Command::Disconnect).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Disconnected);
        assert!(world.index().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn barrier_workers_advance_together() {
        let world = small_world(true);
        let (stop, shutdown) = watch::channel(false);
        let tasks: Vec<_> = (0..3)
            .map(|id| tokio::spawn(worker(&world, id, shutdown.clone()).run()))
            .collect();

        let phaser = world.phaser().unwrap().clone();
        wait_for(|| phaser.generation() >= 5).await;
        let completed = phaser.generation();
        stop.send_replace(true);
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Shutdown);
        }

        // Each worker ticks once per cycle it arrives in, plus at most one more.
        let ticks = world.ticks().get();
        assert!(ticks >= completed * 3);
        assert!(ticks <= (phaser.generation() + 1) * 3);
        assert!(world.index().is_empty());
    }
}
