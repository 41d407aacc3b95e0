//! Worker handles and the commands they accept
//!
//! Only player-controlled ships have a command mailbox. Delivery is
//! at-most-once: a full mailbox drops the command instead of blocking the
//! sender.

use crate::worker::ShipKind;
use flotilla_core::entity::EntityId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Commands buffered per controlled ship before new ones are dropped.
pub const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Set the ship's acceleration
    Steer { ax: f64, ay: f64 },
    /// Fire at the nearest ship on radar
    Fire,
    /// The controlling client went away; the ship leaves the simulation
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("ship {0} does not accept commands")]
    NotControlled(Arc<str>),

    #[error("ship {0} is no longer running")]
    Gone(Arc<str>),

    #[error("mailbox of ship {0} is full; command dropped")]
    Full(Arc<str>),
}

/// Addressable reference to a running ship worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    id: EntityId,
    kind: ShipKind,
    commands: Option<mpsc::Sender<Command>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: Arc<str>,
        id: EntityId,
        kind: ShipKind,
        commands: Option<mpsc::Sender<Command>>,
    ) -> Self {
        Self {
            name,
            id,
            kind,
            commands,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn kind(&self) -> ShipKind {
        self.kind
    }

    /// Deliver without waiting; a full mailbox drops the command.
    pub fn send(&self, command: Command) -> Result<(), CommandError> {
        let sender = self
            .commands
            .as_ref()
            .ok_or_else(|| CommandError::NotControlled(self.name.clone()))?;
        sender.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => CommandError::Full(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => CommandError::Gone(self.name.clone()),
        })
    }

    pub fn disconnect(&self) -> Result<(), CommandError> {
        self.send(Command::Disconnect)
    }
}
