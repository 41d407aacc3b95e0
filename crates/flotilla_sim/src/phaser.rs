//! Cycle barrier with dynamic membership
//!
//! Parties register, arrive once per cycle and wait for everybody else. A
//! party leaving (normally or by cancellation) never strands the others: its
//! pending arrival is withdrawn and the cycle advances if it was the last
//! one outstanding.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct PhaseState {
    parties: usize,
    arrived: usize,
    generation: u64,
}

#[derive(Debug)]
pub struct CyclePhaser {
    state: Mutex<PhaseState>,
    advanced: watch::Sender<u64>,
}

impl CyclePhaser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PhaseState::default()),
            advanced: watch::Sender::new(0),
        })
    }

    pub fn register(self: &Arc<Self>) -> PhaserParty {
        self.lock().parties += 1;
        PhaserParty {
            phaser: Arc::clone(self),
            pending: None,
        }
    }

    /// Completed cycles so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn parties(&self) -> usize {
        self.lock().parties
    }

    fn lock(&self) -> MutexGuard<'_, PhaseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn advance_if_complete(&self, state: &mut PhaseState) {
        if state.parties > 0 && state.arrived >= state.parties {
            state.arrived = 0;
            state.generation += 1;
            self.advanced.send_replace(state.generation);
        }
    }
}

/// Membership in a `CyclePhaser`; deregisters on drop.
#[derive(Debug)]
pub struct PhaserParty {
    phaser: Arc<CyclePhaser>,
    pending: Option<u64>,
}

impl PhaserParty {
    /// Arrive for the current cycle and wait until every party has arrived.
    /// Returns the generation that just completed.
    pub async fn arrive_and_await(&mut self) -> u64 {
        let mut advanced = self.phaser.advanced.subscribe();
        let generation = {
            let mut state = self.phaser.lock();
            let generation = state.generation;
            state.arrived += 1;
            self.pending = Some(generation);
            self.phaser.advance_if_complete(&mut state);
            generation
        };

        // The sender lives as long as the phaser, which this party keeps alive.
        let _ = advanced.wait_for(|current| *current > generation).await;
        self.pending = None;
        generation + 1
    }
}

impl Drop for PhaserParty {
    fn drop(&mut self) {
        let mut state = self.phaser.lock();
        state.parties = state.parties.saturating_sub(1);
        if self.pending == Some(state.generation) {
            state.arrived = state.arrived.saturating_sub(1);
        }
        self.phaser.advance_if_complete(&mut state);
    }
}
