//! Record codecs: how a `ShipState` is stored inside index leaves.
//!
//! `single-precision` narrows coordinates to `f32`; `compressed` packs the
//! record into an unaligned byte array (32-bit relative timestamps, no
//! padding) and pays a (de)serialization step on every access.

use crate::math::{DVec2, DVec3, Vec2, Vec3};
use crate::record::{ShipState, Status};
use crate::time::Millis;
use bytemuck::{Pod, Zeroable};

/// Storage representation for index entries.
pub trait RecordCodec: Send + Sync + 'static {
    type Stored: Clone + PartialEq + Send + Sync + 'static;

    const NAME: &'static str;

    fn encode(state: &ShipState) -> Self::Stored;

    fn decode(stored: &Self::Stored) -> ShipState;

    /// Position only; used to filter range queries without a full decode.
    fn position(stored: &Self::Stored) -> DVec3;
}

/// Full `f64` records, stored as-is.
pub struct WideCodec;

impl RecordCodec for WideCodec {
    type Stored = ShipState;

    const NAME: &'static str = "wide";

    #[inline]
    fn encode(state: &ShipState) -> ShipState {
        *state
    }

    #[inline]
    fn decode(stored: &ShipState) -> ShipState {
        *stored
    }

    #[inline]
    fn position(stored: &ShipState) -> DVec3 {
        stored.position
    }
}

/// `f32` coordinates, native layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NarrowShip {
    position: Vec3,
    velocity: Vec2,
    acceleration: Vec2,
    ex_velocity: Vec2,
    shot_length: f32,
    ex_velocity_updated: Millis,
    last_moved: Millis,
    time_fired: Millis,
    blow_time: Millis,
    status: Status,
}

pub struct NarrowCodec;

impl RecordCodec for NarrowCodec {
    type Stored = NarrowShip;

    const NAME: &'static str = "single-precision";

    fn encode(state: &ShipState) -> NarrowShip {
        NarrowShip {
            position: state.position.as_vec3(),
            velocity: state.velocity.as_vec2(),
            acceleration: state.acceleration.as_vec2(),
            ex_velocity: state.ex_velocity.as_vec2(),
            shot_length: state.shot_length as f32,
            ex_velocity_updated: state.ex_velocity_updated,
            last_moved: state.last_moved,
            time_fired: state.time_fired,
            blow_time: state.blow_time,
            status: state.status,
        }
    }

    fn decode(stored: &NarrowShip) -> ShipState {
        ShipState {
            position: stored.position.as_dvec3(),
            velocity: stored.velocity.as_dvec2(),
            acceleration: stored.acceleration.as_dvec2(),
            ex_velocity: stored.ex_velocity.as_dvec2(),
            ex_velocity_updated: stored.ex_velocity_updated,
            last_moved: stored.last_moved,
            time_fired: stored.time_fired,
            blow_time: stored.blow_time,
            shot_length: stored.shot_length as f64,
            status: stored.status,
        }
    }

    #[inline]
    fn position(stored: &NarrowShip) -> DVec3 {
        stored.position.as_dvec3()
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PackedWide {
    position: [f64; 3],
    velocity: [f64; 2],
    acceleration: [f64; 2],
    ex_velocity: [f64; 2],
    shot_length: f64,
    ex_velocity_updated: u32,
    last_moved: u32,
    time_fired: u32,
    blow_time: u32,
    status: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PackedNarrow {
    position: [f32; 3],
    velocity: [f32; 2],
    acceleration: [f32; 2],
    ex_velocity: [f32; 2],
    shot_length: f32,
    ex_velocity_updated: u32,
    last_moved: u32,
    time_fired: u32,
    blow_time: u32,
    status: u8,
}

const PACKED_WIDE_LEN: usize = std::mem::size_of::<PackedWide>();
const PACKED_NARROW_LEN: usize = std::mem::size_of::<PackedNarrow>();

#[inline]
fn pack_millis(millis: Millis) -> u32 {
    millis.min(u32::MAX as Millis) as u32
}

fn to_bytes<const N: usize, T: Pod>(value: &T) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytemuck::bytes_of(value));
    out
}

/// Packed `f64` records.
pub struct PackedCodec;

impl RecordCodec for PackedCodec {
    type Stored = [u8; PACKED_WIDE_LEN];

    const NAME: &'static str = "compressed";

    fn encode(state: &ShipState) -> Self::Stored {
        to_bytes(&PackedWide {
            position: state.position.to_array(),
            velocity: state.velocity.to_array(),
            acceleration: state.acceleration.to_array(),
            ex_velocity: state.ex_velocity.to_array(),
            shot_length: state.shot_length,
            ex_velocity_updated: pack_millis(state.ex_velocity_updated),
            last_moved: pack_millis(state.last_moved),
            time_fired: pack_millis(state.time_fired),
            blow_time: pack_millis(state.blow_time),
            status: state.status.raw(),
        })
    }

    fn decode(stored: &Self::Stored) -> ShipState {
        let packed: PackedWide = bytemuck::pod_read_unaligned(stored);
        ShipState {
            position: DVec3::from_array(packed.position),
            velocity: DVec2::from_array(packed.velocity),
            acceleration: DVec2::from_array(packed.acceleration),
            ex_velocity: DVec2::from_array(packed.ex_velocity),
            ex_velocity_updated: packed.ex_velocity_updated as Millis,
            last_moved: packed.last_moved as Millis,
            time_fired: packed.time_fired as Millis,
            blow_time: packed.blow_time as Millis,
            shot_length: packed.shot_length,
            status: Status::from_raw(packed.status),
        }
    }

    fn position(stored: &Self::Stored) -> DVec3 {
        // position is the leading field
        let xyz: [f64; 3] = bytemuck::pod_read_unaligned(&stored[..24]);
        DVec3::from_array(xyz)
    }
}

/// Packed `f32` records: the smallest representation.
pub struct PackedNarrowCodec;

impl RecordCodec for PackedNarrowCodec {
    type Stored = [u8; PACKED_NARROW_LEN];

    const NAME: &'static str = "compressed+single-precision";

    fn encode(state: &ShipState) -> Self::Stored {
        to_bytes(&PackedNarrow {
            position: state.position.as_vec3().to_array(),
            velocity: state.velocity.as_vec2().to_array(),
            acceleration: state.acceleration.as_vec2().to_array(),
            ex_velocity: state.ex_velocity.as_vec2().to_array(),
            shot_length: state.shot_length as f32,
            ex_velocity_updated: pack_millis(state.ex_velocity_updated),
            last_moved: pack_millis(state.last_moved),
            time_fired: pack_millis(state.time_fired),
            blow_time: pack_millis(state.blow_time),
            status: state.status.raw(),
        })
    }

    fn decode(stored: &Self::Stored) -> ShipState {
        let packed: PackedNarrow = bytemuck::pod_read_unaligned(stored);
        ShipState {
            position: Vec3::from_array(packed.position).as_dvec3(),
            velocity: Vec2::from_array(packed.velocity).as_dvec2(),
            acceleration: Vec2::from_array(packed.acceleration).as_dvec2(),
            ex_velocity: Vec2::from_array(packed.ex_velocity).as_dvec2(),
            ex_velocity_updated: packed.ex_velocity_updated as Millis,
            last_moved: packed.last_moved as Millis,
            time_fired: packed.time_fired as Millis,
            blow_time: packed.blow_time as Millis,
            shot_length: packed.shot_length as f64,
            status: Status::from_raw(packed.status),
        }
    }

    fn position(stored: &Self::Stored) -> DVec3 {
        let xyz: [f32; 3] = bytemuck::pod_read_unaligned(&stored[..12]);
        Vec3::from_array(xyz).as_dvec3()
    }
}
