//! World math utilities
//!
//! Re-exports glam with the bounding-box and RNG helpers the simulation needs

pub use glam::*;

/// Axis-aligned box in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// World box for a given side length: the y extent is 70% of x and z.
    pub fn world(length: f64) -> Self {
        let half = length / 2.0;
        Self::new(
            DVec3::new(-half, -half * 0.7, -half),
            DVec3::new(half, half * 0.7, half),
        )
    }

    /// Cube of half-extent `range` centered on `center`.
    pub fn around(center: DVec3, range: f64) -> Self {
        let extent = DVec3::splat(range.abs());
        Self {
            min: center - extent,
            max: center + extent,
        }
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn contains(&self, point: DVec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }
}

impl std::fmt::Display for Aabb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:.1}..{:.1}, {:.1}..{:.1}, {:.1}..{:.1}]",
            self.min.x, self.max.x, self.min.y, self.max.y, self.min.z, self.max.z
        )
    }
}

/// Deterministic random number generator
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        // Scramble so that neighbouring seeds (ship indices) diverge immediately.
        let mut rng = Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        };
        rng.next_u64();
        rng
    }

    /// SplitMix64 step
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in [0, 1)
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// Uniform point inside `bounds`.
    pub fn point_in(&mut self, bounds: &Aabb) -> DVec3 {
        DVec3::new(
            self.range(bounds.min.x, bounds.max.x),
            self.range(bounds.min.y, bounds.max.y),
            self.range(bounds.min.z, bounds.max.z),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_bounds_are_flattened_on_y() {
        let world = Aabb::world(200.0);
        assert_eq!(world.min, DVec3::new(-100.0, -70.0, -100.0));
        assert_eq!(world.max, DVec3::new(100.0, 70.0, 100.0));
    }

    #[test]
    fn containment_includes_the_faces() {
        let unit = Aabb::new(DVec3::ONE, DVec3::ZERO);
        assert_eq!(unit.min, DVec3::ZERO);
        assert!(unit.contains(DVec3::ONE));
        assert!(unit.contains(DVec3::splat(0.5)));
        assert!(!unit.contains(DVec3::new(1.5, 0.5, 0.5)));
    }

    #[test]
    fn rng_is_deterministic_and_in_bounds() {
        let world = Aabb::world(1000.0);
        let mut a = DeterministicRng::new(7);
        let mut b = DeterministicRng::new(7);
        for _ in 0..100 {
            let p = a.point_in(&world);
            assert_eq!(p, b.point_in(&world));
            assert!(world.contains(p));
        }
        assert_ne!(
            DeterministicRng::new(1).next_u64(),
            DeterministicRng::new(2).next_u64()
        );
    }
}
