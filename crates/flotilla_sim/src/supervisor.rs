//! One-for-one supervision of ship workers
//!
//! The supervisor is an actor: it owns every child task and is driven by two
//! event sources, requests from `SupervisorHandle`s and child exits. A failed
//! autonomous ship is restarted on its own, with the same name and id, while
//! its restart budget lasts; once the budget is spent the ship is lost and
//! the loss is reported. Controlled ships are never restarted.

use crate::admission::AdmissionPermit;
use crate::command::{WorkerHandle, COMMAND_BUFFER};
use crate::config::RestartBudget;
use crate::worker::{ShipKind, ShipWorker, WorkerError, WorkerExit};
use crate::world::World;
use dashmap::DashMap;
use flotilla_core::entity::EntityId;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Running,
    Restarting,
    FailedPermanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("the supervisor has stopped")]
    Stopped,

    #[error("a ship named {0} is already running")]
    NameTaken(Arc<str>),
}

/// Failure timestamps of one child inside the sliding budget window.
#[derive(Debug, Default)]
struct RestartHistory {
    failures: VecDeque<Instant>,
}

impl RestartHistory {
    /// Record a failure at `now`; false once the budget is exhausted.
    fn permit_restart(&mut self, now: Instant, budget: &RestartBudget) -> bool {
        let window = budget.window();
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        if self.failures.len() < budget.max_restarts as usize {
            self.failures.push_back(now);
            true
        } else {
            false
        }
    }
}

enum Outcome {
    Exited(WorkerExit),
    Failed(WorkerError),
    Cancelled,
}

struct ChildExit {
    name: Arc<str>,
    incarnation: u64,
    outcome: Outcome,
}

struct Child {
    id: EntityId,
    kind: ShipKind,
    incarnation: u64,
    history: RestartHistory,
}

enum Request {
    SpawnControlled {
        name: Arc<str>,
        permit: AdmissionPermit,
        reply: oneshot::Sender<Result<WorkerHandle, SupervisorError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Default)]
struct Registry {
    workers: DashMap<Arc<str>, WorkerHandle>,
    slots: DashMap<Arc<str>, SlotState>,
    restarts: AtomicU64,
    losses: AtomicU64,
}

/// Cloneable front end of a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    requests: mpsc::UnboundedSender<Request>,
    registry: Arc<Registry>,
}

impl SupervisorHandle {
    /// Look up a running ship by name.
    pub fn get_worker(&self, name: &str) -> Option<WorkerHandle> {
        self.registry
            .workers
            .get(name)
            .map(|entry| entry.value().clone())
    }

    pub fn slot_state(&self, name: &str) -> Option<SlotState> {
        self.registry.slots.get(name).map(|entry| *entry.value())
    }

    /// Ships currently running.
    pub fn running(&self) -> usize {
        self.registry.workers.len()
    }

    /// Restarts performed so far, across all children.
    pub fn restarts(&self) -> u64 {
        self.registry.restarts.load(Ordering::Relaxed)
    }

    /// Ships given up on after exhausting their restart budget.
    pub fn losses(&self) -> u64 {
        self.registry.losses.load(Ordering::Relaxed)
    }

    /// Start a controlled ship that holds `permit` for its whole life.
    pub async fn spawn_controlled(
        &self,
        name: &str,
        permit: AdmissionPermit,
    ) -> Result<WorkerHandle, SupervisorError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::SpawnControlled {
                name: name.into(),
                permit,
                reply,
            })
            .map_err(|_| SupervisorError::Stopped)?;
        response.await.map_err(|_| SupervisorError::Stopped)?
    }

    /// Stop every child and wait until all of them have left the index.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.requests.send(Request::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }
}

pub struct Supervisor {
    world: Arc<World>,
    budget: RestartBudget,
    registry: Arc<Registry>,
    requests: mpsc::UnboundedReceiver<Request>,
    tasks: JoinSet<ChildExit>,
    children: HashMap<Arc<str>, Child>,
    shutdown: watch::Sender<bool>,
    next_controlled: u64,
    incarnations: u64,
}

impl Supervisor {
    /// Launch the autonomous population and the supervisor actor.
    pub fn start(world: Arc<World>) -> (SupervisorHandle, JoinHandle<()>) {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::default());
        let population = world.config().n as u64;

        let mut supervisor = Supervisor {
            budget: world.config().restart_budget,
            world,
            registry: Arc::clone(&registry),
            requests,
            tasks: JoinSet::new(),
            children: HashMap::new(),
            shutdown: watch::Sender::new(false),
            // Controlled ids live above the autonomous range.
            next_controlled: population + 1,
            incarnations: 0,
        };
        for i in 0..population {
            supervisor.spawn_child(format!("ship-{i}").into(), EntityId(i), ShipKind::Autonomous, None);
        }
        info!(ships = population, "autonomous ships launched");

        let task = tokio::spawn(supervisor.run());
        let handle = SupervisorHandle {
            requests: requests_tx,
            registry,
        };
        (handle, task)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::SpawnControlled { name, permit, reply }) => {
                        let _ = reply.send(self.admit(name, permit));
                    }
                    Some(Request::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.stop().await;
                        return;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(exit) => self.on_exit(exit),
                    Err(err) => warn!(%err, "child monitor ended abnormally"),
                },
            }
        }
    }

    fn admit(
        &mut self,
        name: Arc<str>,
        permit: AdmissionPermit,
    ) -> Result<WorkerHandle, SupervisorError> {
        if *self.shutdown.borrow() {
            return Err(SupervisorError::Stopped);
        }
        if self.children.contains_key(&name) {
            return Err(SupervisorError::NameTaken(name));
        }
        let id = EntityId(self.next_controlled);
        self.next_controlled += 1;
        info!(ship = %name, %id, "player admitted");
        Ok(self.spawn_child(name, id, ShipKind::Controlled, Some(permit)))
    }

    fn spawn_child(
        &mut self,
        name: Arc<str>,
        id: EntityId,
        kind: ShipKind,
        permit: Option<AdmissionPermit>,
    ) -> WorkerHandle {
        let (sender, receiver) = match kind {
            ShipKind::Controlled => {
                let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
                (Some(tx), Some(rx))
            }
            ShipKind::Autonomous => (None, None),
        };
        let handle = WorkerHandle::new(Arc::clone(&name), id, kind, sender);

        let mut worker = ShipWorker::new(
            Arc::clone(&self.world),
            handle.clone(),
            receiver,
            self.shutdown.subscribe(),
        );
        if let Some(permit) = permit {
            worker = worker.with_admission(permit);
        }

        self.incarnations += 1;
        let incarnation = self.incarnations;
        let worker_task = tokio::spawn(worker.run());
        let exit_name = Arc::clone(&name);
        self.tasks.spawn(async move {
            let outcome = match worker_task.await {
                Ok(Ok(exit)) => Outcome::Exited(exit),
                Ok(Err(err)) => Outcome::Failed(err),
                Err(err) if err.is_panic() => {
                    Outcome::Failed(WorkerError::Panicked(panic_message(err.into_panic())))
                }
                Err(_) => Outcome::Cancelled,
            };
            ChildExit {
                name: exit_name,
                incarnation,
                outcome,
            }
        });

        self.children
            .entry(Arc::clone(&name))
            .or_insert_with(|| Child {
                id,
                kind,
                incarnation,
                history: RestartHistory::default(),
            })
            .incarnation = incarnation;
        self.registry.workers.insert(Arc::clone(&name), handle.clone());
        self.registry.slots.insert(name, SlotState::Running);
        handle
    }

    fn on_exit(&mut self, exit: ChildExit) {
        let stopping = *self.shutdown.borrow();
        let now = Instant::now();
        let budget = self.budget;
        let Some(child) = self.children.get_mut(&exit.name) else {
            return;
        };
        if child.incarnation != exit.incarnation {
            return;
        }
        let (id, kind) = (child.id, child.kind);
        let name = exit.name;

        let err = match exit.outcome {
            Outcome::Exited(reason) => {
                debug!(ship = %name, ?reason, "ship left");
                return self.forget(&name);
            }
            Outcome::Cancelled => {
                debug!(ship = %name, "ship cancelled");
                return self.forget(&name);
            }
            Outcome::Failed(err) => err,
        };

        if kind == ShipKind::Controlled || stopping {
            warn!(ship = %name, %err, "ship failed");
            return self.forget(&name);
        }

        if child.history.permit_restart(now, &budget) {
            warn!(ship = %name, %err, "ship failed; restarting");
            self.registry.slots.insert(Arc::clone(&name), SlotState::Restarting);
            self.registry.restarts.fetch_add(1, Ordering::Relaxed);
            self.spawn_child(name, id, kind, None);
        } else {
            error!(
                ship = %name,
                %err,
                max_restarts = budget.max_restarts,
                window_secs = budget.window_secs,
                "restart budget exhausted; ship lost"
            );
            self.children.remove(&name);
            self.registry.workers.remove(&name);
            self.registry.slots.insert(name, SlotState::FailedPermanent);
            self.registry.losses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn forget(&mut self, name: &Arc<str>) {
        self.children.remove(name);
        self.registry.workers.remove(name);
        self.registry.slots.remove(name);
    }

    async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        info!(ships = self.children.len(), "stopping ship workers");
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(ChildExit {
                name,
                outcome: Outcome::Failed(err),
                ..
            }) = joined
            {
                warn!(ship = %name, %err, "ship failed during shutdown");
            }
        }
        self.children.clear();
        self.registry.workers.clear();
        self.registry.slots.clear();
        info!(
            restarts = self.registry.restarts.load(Ordering::Relaxed),
            losses = self.registry.losses.load(Ordering::Relaxed),
            "supervisor stopped"
        );
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
