//! Initial placement of agents.

use glam::Vec3;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::{try_alloc, FlockError};

/// Random source for initial agent state.
///
/// ```ignore
/// let mut ctx = SpawnContext::new(Some(7), 100.0);
/// let positions = ctx.uniform_positions(10_000)?;
/// ```
pub struct SpawnContext {
    /// Half-size of the spawn cube.
    pub bounds: f32,
    rng: SmallRng,
}

impl SpawnContext {
    /// Seeded context; `None` seeds from system entropy.
    pub fn new(seed: Option<u64>, bounds: f32) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self { bounds, rng }
    }

    /// Random point inside a cube of given half-size, centered at origin.
    pub fn random_in_cube(&mut self, half_size: f32) -> Vec3 {
        Vec3::new(
            self.rng.gen_range(-half_size..=half_size),
            self.rng.gen_range(-half_size..=half_size),
            self.rng.gen_range(-half_size..=half_size),
        )
    }

    /// Random direction scaled to a speed in `[0, max_speed)`.
    pub fn random_velocity(&mut self, max_speed: f32) -> Vec3 {
        let dir = loop {
            let v = self.random_in_cube(1.0);
            let len_sq = v.length_squared();
            if len_sq > 1e-6 && len_sq <= 1.0 {
                break v / len_sq.sqrt();
            }
        };
        dir * self.rng.gen_range(0.0..max_speed)
    }

    /// `count` positions uniform in `[-bounds, bounds]³`.
    pub fn uniform_positions(&mut self, count: usize) -> Result<Vec<Vec3>, FlockError> {
        let mut positions = try_alloc("initial positions", count, Vec3::ZERO)?;
        let bounds = self.bounds;
        for pos in positions.iter_mut() {
            *pos = self.random_in_cube(bounds);
        }
        Ok(positions)
    }

    /// `count` velocities with random directions and speeds below `max_speed`.
    pub fn random_velocities(&mut self, count: usize, max_speed: f32) -> Result<Vec<Vec3>, FlockError> {
        let mut velocities = try_alloc("initial velocities", count, Vec3::ZERO)?;
        for vel in velocities.iter_mut() {
            *vel = self.random_velocity(max_speed);
        }
        Ok(velocities)
    }
}
