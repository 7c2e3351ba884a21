//! The three flocking rules: cohesion, separation and alignment.
//!
//! Evaluation is split in two halves so every traversal strategy shares the
//! same maths:
//!
//! 1. [`NeighborSums::accumulate`] runs once per candidate neighbour, inside
//!    whatever loop the strategy uses.
//! 2. [`NeighborSums::resolve`] runs once per agent after the loop and turns
//!    the sums into the clamped new velocity.
//!
//! [`RULES_WGSL`] is the same pair of functions for the compute kernels.

use glam::Vec3;

use crate::config::FlockConfig;

/// Added to the speed before dividing in [`clamp_speed`].
pub const SPEED_EPSILON: f32 = 1e-6;

/// Rule radii and weights in the shape the inner loop wants them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RuleSet {
    pub cohesion_distance: f32,
    pub separation_distance: f32,
    pub alignment_distance: f32,
    pub cohesion_scale: f32,
    pub separation_scale: f32,
    pub alignment_scale: f32,
    pub max_speed: f32,
}

impl RuleSet {
    pub fn from_config(config: &FlockConfig) -> Self {
        Self {
            cohesion_distance: config.cohesion.distance,
            separation_distance: config.separation.distance,
            alignment_distance: config.alignment.distance,
            cohesion_scale: config.cohesion.scale,
            separation_scale: config.separation.scale,
            alignment_scale: config.alignment.scale,
            max_speed: config.max_speed,
        }
    }
}

/// Running sums over the neighbours of one agent.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NeighborSums {
    pub cohesion_sum: Vec3,
    pub cohesion_count: u32,
    pub separation_sum: Vec3,
    pub alignment_sum: Vec3,
    pub alignment_count: u32,
}

impl NeighborSums {
    /// Fold one neighbour at `other_pos` moving at `other_vel` into the sums
    /// of an agent at `pos`. The caller is responsible for skipping the agent
    /// itself.
    #[inline]
    pub fn accumulate(&mut self, rules: &RuleSet, pos: Vec3, other_pos: Vec3, other_vel: Vec3) {
        let dist = pos.distance(other_pos);
        if dist < rules.cohesion_distance {
            self.cohesion_sum += other_pos;
            self.cohesion_count += 1;
        }
        if dist < rules.separation_distance {
            self.separation_sum += pos - other_pos;
        }
        if dist < rules.alignment_distance {
            self.alignment_sum += other_vel;
            self.alignment_count += 1;
        }
    }

    /// New velocity for an agent at `pos` moving at `vel`.
    ///
    /// Averaging rules contribute nothing when they saw no neighbour.
    #[inline]
    pub fn resolve(&self, rules: &RuleSet, pos: Vec3, vel: Vec3) -> Vec3 {
        let mut new_vel = vel;
        if self.cohesion_count > 0 {
            let center = self.cohesion_sum / self.cohesion_count as f32;
            new_vel += (center - pos) * rules.cohesion_scale;
        }
        new_vel += self.separation_sum * rules.separation_scale;
        if self.alignment_count > 0 {
            let avg_vel = self.alignment_sum / self.alignment_count as f32;
            new_vel += (avg_vel - vel) * rules.alignment_scale;
        }
        clamp_speed(new_vel, rules.max_speed)
    }
}

/// Rescale `vel` to `max_speed` when it is faster; otherwise return it as is.
#[inline]
pub fn clamp_speed(vel: Vec3, max_speed: f32) -> Vec3 {
    let speed = vel.length();
    if speed <= max_speed {
        return vel;
    }
    if speed.is_finite() {
        vel * (max_speed / (speed + SPEED_EPSILON))
    } else {
        // |vel|² overflowed; shrink first so the direction survives
        let shrunk = vel / vel.abs().max_element();
        shrunk * (max_speed / (shrunk.length() + SPEED_EPSILON))
    }
}

/// WGSL version of [`NeighborSums`]. Rule radii and weights travel as
/// `vec3`s in (cohesion, separation, alignment) order.
pub const RULES_WGSL: &str = r#"
const SPEED_EPSILON: f32 = 1e-6;

struct NeighborSums {
    cohesion_sum: vec3<f32>,
    cohesion_count: u32,
    separation_sum: vec3<f32>,
    alignment_sum: vec3<f32>,
    alignment_count: u32,
}

fn empty_sums() -> NeighborSums {
    return NeighborSums(vec3<f32>(0.0), 0u, vec3<f32>(0.0), vec3<f32>(0.0), 0u);
}

fn accumulate_neighbor(
    sums: NeighborSums,
    pos: vec3<f32>,
    other_pos: vec3<f32>,
    other_vel: vec3<f32>,
    distances: vec3<f32>,
) -> NeighborSums {
    var s = sums;
    let dist = distance(pos, other_pos);
    if dist < distances.x {
        s.cohesion_sum += other_pos;
        s.cohesion_count += 1u;
    }
    if dist < distances.y {
        s.separation_sum += pos - other_pos;
    }
    if dist < distances.z {
        s.alignment_sum += other_vel;
        s.alignment_count += 1u;
    }
    return s;
}

fn clamp_speed(vel: vec3<f32>, max_speed: f32) -> vec3<f32> {
    let speed = length(vel);
    if speed <= max_speed {
        return vel;
    }
    if speed > 1.0e38 {
        let shrunk = vel / max(max(abs(vel.x), abs(vel.y)), abs(vel.z));
        return shrunk * (max_speed / (length(shrunk) + SPEED_EPSILON));
    }
    return vel * (max_speed / (speed + SPEED_EPSILON));
}

fn resolve_velocity(
    s: NeighborSums,
    pos: vec3<f32>,
    vel: vec3<f32>,
    scales: vec3<f32>,
    max_speed: f32,
) -> vec3<f32> {
    var new_vel = vel;
    if s.cohesion_count > 0u {
        let center = s.cohesion_sum / f32(s.cohesion_count);
        new_vel += (center - pos) * scales.x;
    }
    new_vel += s.separation_sum * scales.y;
    if s.alignment_count > 0u {
        let avg_vel = s.alignment_sum / f32(s.alignment_count);
        new_vel += (avg_vel - vel) * scales.z;
    }
    return clamp_speed(new_vel, max_speed);
}
"#;
