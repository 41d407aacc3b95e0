//! Admission control for player-controlled ships
//!
//! A lock-free counter bounded by the player capacity. Each successful
//! admission yields a permit that gives its slot back exactly once, when
//! dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("player capacity of {capacity} reached")]
    CapacityExceeded { capacity: usize },
}

#[derive(Debug)]
pub struct AdmissionController {
    capacity: usize,
    admitted: AtomicUsize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            admitted: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently admitted players; never exceeds `capacity`.
    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::Acquire)
    }

    pub fn try_admit(self: &Arc<Self>) -> Result<AdmissionPermit, AdmissionError> {
        let capacity = self.capacity;
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| AdmissionError::CapacityExceeded { capacity })?;
        Ok(AdmissionPermit {
            controller: Arc::clone(self),
        })
    }

    fn release(&self) {
        let previous = self.admitted.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "admission released more often than granted");
    }
}

/// One admitted player slot. Dropping the permit releases the slot.
#[must_use = "dropping the permit releases the slot immediately"]
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
}

impl AdmissionPermit {
    pub fn release(self) {}
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}
