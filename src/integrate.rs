//! Explicit Euler position update with periodic wrap.

use glam::Vec3;
use rayon::prelude::*;

/// Wrap one coordinate of the `[-scale, scale]` domain.
///
/// Leaving through one face re-enters on the opposite face. A coordinate
/// that overshoots by more than a domain width is not wrapped again.
#[inline]
pub fn wrap_axis(x: f32, scale: f32) -> f32 {
    if x < -scale {
        scale
    } else if x > scale {
        -scale
    } else {
        x
    }
}

#[inline]
pub fn wrap(pos: Vec3, scale: f32) -> Vec3 {
    Vec3::new(wrap_axis(pos.x, scale), wrap_axis(pos.y, scale), wrap_axis(pos.z, scale))
}

/// `pos += vel * dt` for every agent, then wrap.
pub fn integrate(positions: &mut [Vec3], velocities: &[Vec3], dt: f32, scene_scale: f32) {
    debug_assert_eq!(positions.len(), velocities.len());

    positions
        .par_iter_mut()
        .zip(velocities.par_iter())
        .for_each(|(pos, &vel)| {
            *pos = wrap(*pos + vel * dt, scene_scale);
        });
}
