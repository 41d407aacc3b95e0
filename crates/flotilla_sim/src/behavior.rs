//! Per-tick ship behavior
//!
//! A `Behavior` maps a ship's current state plus what its radar sees to the
//! state it should publish next. Behaviors are pure: they never touch the
//! index and never block.

use crate::command::Command;
use flotilla_core::entity::EntityId;
use flotilla_core::index::IndexedShip;
use flotilla_core::math::{Aabb, DVec2, DeterministicRng};
use flotilla_core::record::{ShipState, Status};
use flotilla_core::time::Millis;
use std::f64::consts::TAU;
use thiserror::Error;

/// Cruising speed of an autonomous ship before variance, in world units per second.
pub const BASE_SPEED: f64 = 20.0;

/// How long a ship spends `Exploding` before it is `Dead`.
pub const BLOW_DURATION: Millis = 1_000;

#[derive(Debug, Error)]
pub enum BehaviorError {
    #[error("behavior failed for ship {id}: {reason}")]
    Failed { id: EntityId, reason: String },
}

/// Everything a behavior may look at during one tick.
pub struct TickInput<'a> {
    pub id: EntityId,
    pub now: Millis,
    /// Seconds since the ship's last published tick
    pub elapsed: f64,
    /// Radar sightings, possibly including the ship itself
    pub nearby: &'a [IndexedShip],
    pub commands: &'a [Command],
    pub bounds: &'a Aabb,
}

pub trait Behavior: Send + Sync + 'static {
    fn tick(&self, me: &ShipState, input: &TickInput<'_>) -> Result<ShipState, BehaviorError>;
}

/// Inertial drift with wall reflection.
///
/// Integrates acceleration into velocity and velocity into position, reflects
/// off the world bounds, and applies steering and firing commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct Drift;

impl Behavior for Drift {
    fn tick(&self, me: &ShipState, input: &TickInput<'_>) -> Result<ShipState, BehaviorError> {
        let mut next = *me;
        let dt = input.elapsed.max(0.0);

        for command in input.commands {
            match *command {
                Command::Steer { ax, ay } => next.acceleration = DVec2::new(ax, ay),
                Command::Fire => {
                    next.time_fired = input.now;
                    next.shot_length = nearest_sighting(me, input).unwrap_or(0.0);
                }
                Command::Disconnect => {}
            }
        }

        if next.status == Status::Exploding
            && input.now.saturating_sub(next.blow_time) >= BLOW_DURATION
        {
            next.status = Status::Dead;
        }
        if !next.is_alive() {
            return Ok(next);
        }

        next.velocity += next.acceleration * dt;
        let mut position = next.position + (next.velocity * dt).extend(0.0);
        reflect(&mut position.x, &mut next.velocity.x, input.bounds.min.x, input.bounds.max.x);
        reflect(&mut position.y, &mut next.velocity.y, input.bounds.min.y, input.bounds.max.y);
        position.z = position.z.clamp(input.bounds.min.z, input.bounds.max.z);

        if position != next.position {
            next.position = position;
            next.last_moved = input.now;
        }
        Ok(next)
    }
}

/// Distance to the closest other ship on radar, projected to `input.now`
/// along each sighting's extrapolated velocity.
fn nearest_sighting(me: &ShipState, input: &TickInput<'_>) -> Option<f64> {
    input
        .nearby
        .iter()
        .filter(|ship| ship.id != input.id)
        .map(|ship| ship.state.extrapolated_position(input.now).distance(me.position))
        .min_by(f64::total_cmp)
}

fn reflect(position: &mut f64, velocity: &mut f64, min: f64, max: f64) {
    if *position < min {
        *position = (2.0 * min - *position).min(max);
        *velocity = velocity.abs();
    } else if *position > max {
        *position = (2.0 * max - *position).max(min);
        *velocity = -velocity.abs();
    }
}

/// Initial state of autonomous ship `index`; the same index always spawns identically.
pub fn spawn_state(index: u64, bounds: &Aabb, speed_variance: f64, now: Millis) -> ShipState {
    let mut rng = DeterministicRng::new(index);
    let mut position = rng.point_in(bounds);
    position.z = 0.0_f64.clamp(bounds.min.z, bounds.max.z);

    let speed = (BASE_SPEED * (1.0 + speed_variance * rng.range(-0.5, 0.5))).max(0.0);
    let heading = rng.range(0.0, TAU);
    ShipState::at(position, DVec2::from_angle(heading) * speed, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::index::{IndexConfig, SpatialIndex};
    use flotilla_core::math::DVec3;

    fn input<'a>(
        nearby: &'a [IndexedShip],
        commands: &'a [Command],
        bounds: &'a Aabb,
        elapsed: f64,
    ) -> TickInput<'a> {
        TickInput {
            id: EntityId(0),
            now: 1_000,
            elapsed,
            nearby,
            commands,
            bounds,
        }
    }

    #[test]
    fn drift_integrates_velocity() {
        let bounds = Aabb::world(1000.0);
        let me = ShipState::at(DVec3::ZERO, DVec2::new(10.0, -4.0), 0);

        let next = Drift.tick(&me, &input(&[], &[], &bounds, 0.5)).unwrap();

        assert_eq!(next.position, DVec3::new(5.0, -2.0, 0.0));
        assert_eq!(next.last_moved, 1_000);
    }

    #[test]
    fn drift_reflects_off_walls() {
        let bounds = Aabb::world(100.0);
        let me = ShipState::at(DVec3::new(48.0, 0.0, 0.0), DVec2::new(10.0, 0.0), 0);

        let next = Drift.tick(&me, &input(&[], &[], &bounds, 0.5)).unwrap();

        assert_eq!(next.position.x, 47.0);
        assert_eq!(next.velocity.x, -10.0);
        assert!(bounds.contains(next.position));
    }

    #[test]
    fn steering_sets_acceleration_before_integration() {
        let bounds = Aabb::world(1000.0);
        let me = ShipState::at(DVec3::ZERO, DVec2::ZERO, 0);
        let commands = [Command::Steer { ax: 2.0, ay: 0.0 }];

        let next = Drift.tick(&me, &input(&[], &commands, &bounds, 1.0)).unwrap();

        assert_eq!(next.acceleration, DVec2::new(2.0, 0.0));
        assert_eq!(next.velocity, DVec2::new(2.0, 0.0));
    }

    #[test]
    fn firing_measures_nearest_other_ship() {
        let bounds = Aabb::world(1000.0);
        let index = SpatialIndex::new(bounds, IndexConfig::default());
        let me = ShipState::at(DVec3::ZERO, DVec2::ZERO, 0);
        for (id, x) in [(0, 0.0), (1, 7.0), (2, 3.0)] {
            let state = ShipState::at(DVec3::new(x, 0.0, 0.0), DVec2::ZERO, 0);
            index.insert(EntityId(id), &state).unwrap();
        }
        let nearby = index.query(&bounds);
        let commands = [Command::Fire];

        let next = Drift.tick(&me, &input(&nearby, &commands, &bounds, 0.0)).unwrap();

        assert_eq!(next.time_fired, 1_000);
        assert_eq!(next.shot_length, 3.0);
    }

    #[test]
    fn firing_leads_moving_targets() {
        let bounds = Aabb::world(1000.0);
        let index = SpatialIndex::new(bounds, IndexConfig::default());
        let me = ShipState::at(DVec3::ZERO, DVec2::ZERO, 0);
        // closing at 6 units/s, published one second before the shot
        let closing = ShipState::at(DVec3::new(7.0, 0.0, 0.0), DVec2::new(-6.0, 0.0), 0);
        let parked = ShipState::at(DVec3::new(3.0, 0.0, 0.0), DVec2::ZERO, 0);
        index.insert(EntityId(1), &closing).unwrap();
        index.insert(EntityId(2), &parked).unwrap();
        let nearby = index.query(&bounds);
        let commands = [Command::Fire];

        let next = Drift.tick(&me, &input(&nearby, &commands, &bounds, 0.0)).unwrap();

        assert!((next.shot_length - 1.0).abs() < 1e-9);
    }

    #[test]
    fn exploding_ship_dies_after_blow_duration() {
        let bounds = Aabb::world(1000.0);
        let mut me = ShipState::at(DVec3::ZERO, DVec2::new(1.0, 0.0), 0);
        me.status = Status::Exploding;
        me.blow_time = 0;

        let next = Drift.tick(&me, &input(&[], &[], &bounds, 1.0)).unwrap();

        assert_eq!(next.status, Status::Dead);
        assert_eq!(next.position, DVec3::ZERO);
    }

    #[test]
    fn spawn_is_deterministic_and_in_bounds() {
        let bounds = Aabb::world(2000.0);
        let a = spawn_state(42, &bounds, 1.0, 0);
        let b = spawn_state(42, &bounds, 1.0, 0);
        let c = spawn_state(43, &bounds, 1.0, 0);

        assert_eq!(a, b);
        assert_ne!(a.position, c.position);
        assert!(bounds.contains(a.position));
        assert!(a.velocity.length() <= BASE_SPEED * 1.5 + 1e-9);
    }
}
