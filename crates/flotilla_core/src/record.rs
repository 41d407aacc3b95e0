//! Ship record schema
//!
//! `ShipState` is the part of a ship's record that lives in the spatial index
//! and is replaced whole on every tick by the ship's own worker.

use crate::math::{DVec2, DVec3};
use crate::time::{seconds_between, Millis};

/// Lifecycle tag of a ship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Status {
    #[default]
    Alive = 0,
    Exploding = 1,
    Dead = 2,
}

impl Status {
    #[inline]
    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Unknown tags decode as `Dead`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Status::Alive,
            1 => Status::Exploding,
            _ => Status::Dead,
        }
    }
}

/// Kinematic and timing state of one ship.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ShipState {
    pub position: DVec3,
    pub velocity: DVec2,
    pub acceleration: DVec2,
    /// Velocity readers use to estimate motion between index refreshes.
    pub ex_velocity: DVec2,
    pub ex_velocity_updated: Millis,
    pub last_moved: Millis,
    pub time_fired: Millis,
    pub blow_time: Millis,
    pub shot_length: f64,
    pub status: Status,
}

impl ShipState {
    pub fn at(position: DVec3, velocity: DVec2, now: Millis) -> Self {
        Self {
            position,
            velocity,
            ex_velocity: velocity,
            ex_velocity_updated: now,
            last_moved: now,
            ..Self::default()
        }
    }

    /// Position estimated from the extrapolated velocity, without touching the writer.
    pub fn extrapolated_position(&self, now: Millis) -> DVec3 {
        let dt = seconds_between(self.ex_velocity_updated, now);
        self.position + (self.ex_velocity * dt).extend(0.0)
    }

    /// Recompute the extrapolated velocity from the displacement since `previous`.
    ///
    /// Falls back to the integrated velocity when no time has elapsed.
    pub fn refresh_extrapolation(&mut self, previous: &ShipState, now: Millis) {
        let dt = seconds_between(previous.ex_velocity_updated, now);
        self.ex_velocity = if dt > 0.0 {
            (self.position - previous.position).truncate() / dt
        } else {
            self.velocity
        };
        self.ex_velocity_updated = now;
    }

    pub fn is_alive(&self) -> bool {
        self.status == Status::Alive
    }
}
