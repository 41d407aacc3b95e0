//! Flotilla Simulation
//!
//! Drives a population of ships, one lightweight task per ship:
//! - Ship workers and their tick loop
//! - One-for-one supervision with bounded restart budgets
//! - Admission control for player-controlled ships
//! - Cycle-rate monitoring (free-running or barrier-synchronized)

pub mod admission;
pub mod behavior;
pub mod command;
pub mod config;
pub mod driver;
pub mod monitor;
pub mod phaser;
pub mod supervisor;
pub mod worker;
pub mod world;

pub use admission::{AdmissionController, AdmissionError, AdmissionPermit};
pub use behavior::{Behavior, BehaviorError, Drift, TickInput};
pub use command::{Command, CommandError, WorkerHandle};
pub use config::{ConfigError, RestartBudget, SimConfig};
pub use driver::{SimError, Simulation};
pub use monitor::{CycleMode, CycleMonitor, RateSampler};
pub use phaser::{CyclePhaser, PhaserParty};
pub use supervisor::{SlotState, SupervisorError, SupervisorHandle};
pub use worker::{ShipKind, ShipRecord, WorkerError, WorkerExit};
pub use world::World;
