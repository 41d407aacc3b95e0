//! Flotilla Core
//!
//! Contains the shared simulation building blocks:
//! - World math and bounds
//! - Entity identity and the ship record schema
//! - Wall clock for record timestamps
//! - Concurrent spatial index

pub mod entity;
pub mod index;
pub mod math;
pub mod record;
pub mod time;

pub use glam;

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
