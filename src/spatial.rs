//! Uniform grid layout and the per-agent cell indexer.
//!
//! The grid is a cube of `side_count³` cells centred on the origin. Each cell
//! is exactly twice as wide as the largest interaction radius, so every
//! neighbour of an agent lies inside the 2×2×2 block of cells on the side of
//! its own cell where the agent sits. That is what lets the evaluator visit 8
//! cells instead of 27.

use glam::{IVec3, Vec3};
use rayon::prelude::*;

use crate::config::FlockConfig;
use crate::error::FlockError;

/// Cell id given to agents whose position falls outside the grid. Sorts after
/// every valid id and is ignored by range derivation.
pub const INVALID_CELL: u32 = u32::MAX;

/// Largest side count accepted; keeps `side³` addressable by 32-bit signed
/// arithmetic on the GPU.
const MAX_SIDE_COUNT: i32 = 1290;

/// Derived grid layout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridParams {
    /// Width of one cell: twice the largest rule distance.
    pub cell_width: f32,
    /// `1.0 / cell_width`.
    pub inv_cell_width: f32,
    /// Cells per axis.
    pub side_count: i32,
    /// `side_count³`.
    pub cell_count: u32,
    /// Lower corner of the grid (the same value on every axis).
    pub minimum: Vec3,
}

impl GridParams {
    /// Derive the grid for a validated configuration.
    pub fn from_config(config: &FlockConfig) -> Result<Self, FlockError> {
        config.validate()?;

        let cell_width = 2.0 * config.max_rule_distance();
        let half_side = (config.scene_scale / cell_width).trunc() as f64 + 1.0;
        let side = 2.0 * half_side;
        if side > MAX_SIDE_COUNT as f64 {
            return Err(FlockError::invalid(format!(
                "grid would need {side} cells per axis (max {MAX_SIDE_COUNT}); \
                 raise the rule distances or shrink scene_scale"
            )));
        }
        let side_count = side as i32;
        let half_width = cell_width * half_side as f32;

        Ok(Self {
            cell_width,
            inv_cell_width: 1.0 / cell_width,
            side_count,
            cell_count: (side_count as u32).pow(3),
            minimum: Vec3::splat(-half_width),
        })
    }

    /// Continuous grid coordinate: integer part is the cell, fractional part
    /// the offset inside it.
    #[inline]
    pub fn grid_space(&self, pos: Vec3) -> Vec3 {
        (pos - self.minimum) * self.inv_cell_width
    }

    /// 3D cell coordinate containing `pos`. Not bounds-checked.
    #[inline]
    pub fn cell_coord(&self, pos: Vec3) -> IVec3 {
        self.grid_space(pos).floor().as_ivec3()
    }

    #[inline]
    pub fn contains_cell(&self, c: IVec3) -> bool {
        c.cmpge(IVec3::ZERO).all() && c.cmplt(IVec3::splat(self.side_count)).all()
    }

    /// Flattened id `x + y*S + z*S²`, or [`INVALID_CELL`] outside the grid.
    #[inline]
    pub fn flatten(&self, c: IVec3) -> u32 {
        if !self.contains_cell(c) {
            return INVALID_CELL;
        }
        let s = self.side_count as u32;
        c.x as u32 + c.y as u32 * s + c.z as u32 * s * s
    }

    /// Cell id of a position.
    #[inline]
    pub fn cell_id(&self, pos: Vec3) -> u32 {
        if !pos.is_finite() {
            return INVALID_CELL;
        }
        self.flatten(self.cell_coord(pos))
    }

    /// The 8 cells that can hold neighbours of an agent at `pos`: its own cell
    /// and, per axis, the adjacent cell on the half where the agent sits.
    /// Cells outside the grid come back as [`INVALID_CELL`].
    pub fn neighborhood(&self, pos: Vec3) -> [u32; 8] {
        // Far outside the grid every candidate is invalid; the clamp keeps
        // the integer corner arithmetic in range.
        let g = self
            .grid_space(pos)
            .clamp(Vec3::splat(-2.0), Vec3::splat(self.side_count as f32 + 1.0));
        let base = g.floor();
        let frac = g - base;
        let base = base.as_ivec3();
        let dir = IVec3::new(
            if frac.x >= 0.5 { 1 } else { -1 },
            if frac.y >= 0.5 { 1 } else { -1 },
            if frac.z >= 0.5 { 1 } else { -1 },
        );

        let mut cells = [INVALID_CELL; 8];
        for (k, cell) in cells.iter_mut().enumerate() {
            let corner = IVec3::new((k & 1) as i32, ((k >> 1) & 1) as i32, ((k >> 2) & 1) as i32);
            *cell = self.flatten(base + corner * dir);
        }
        cells
    }
}

/// Indexer stage: record `(agent, cell)` for every agent.
///
/// Fully parallel; no ordering is implied across agents.
pub fn compute_indices(
    grid: &GridParams,
    positions: &[Vec3],
    agent_ids: &mut [u32],
    cell_ids: &mut [u32],
) {
    debug_assert_eq!(positions.len(), agent_ids.len());
    debug_assert_eq!(positions.len(), cell_ids.len());

    agent_ids
        .par_iter_mut()
        .zip(cell_ids.par_iter_mut())
        .zip(positions.par_iter())
        .enumerate()
        .for_each(|(i, ((agent, cell), &pos))| {
            *agent = i as u32;
            *cell = grid.cell_id(pos);
        });
}

/// WGSL grid helpers shared by every kernel that touches cells.
pub const GRID_WGSL: &str = r#"
const INVALID_CELL: u32 = 0xFFFFFFFFu;

// Continuous grid coordinate of a world position
fn grid_space(pos: vec3<f32>, grid_min: vec3<f32>, inv_cell_width: f32) -> vec3<f32> {
    return (pos - grid_min) * inv_cell_width;
}

fn in_grid(c: vec3<i32>, side: i32) -> bool {
    return all(c >= vec3<i32>(0)) && all(c < vec3<i32>(side));
}

// Flatten x + y*S + z*S^2, INVALID_CELL outside the grid
fn flatten_cell(c: vec3<i32>, side: i32) -> u32 {
    if !in_grid(c, side) {
        return INVALID_CELL;
    }
    return u32(c.x + c.y * side + c.z * side * side);
}

fn cell_of(pos: vec3<f32>, grid_min: vec3<f32>, inv_cell_width: f32, side: i32) -> u32 {
    let c = vec3<i32>(floor(grid_space(pos, grid_min, inv_cell_width)));
    return flatten_cell(c, side);
}

// k-th cell (0..8) of the 2x2x2 block on the agent's side of its cell
fn neighborhood_cell(pos: vec3<f32>, k: u32, grid_min: vec3<f32>, inv_cell_width: f32, side: i32) -> u32 {
    let g = clamp(grid_space(pos, grid_min, inv_cell_width), vec3<f32>(-2.0), vec3<f32>(f32(side) + 1.0));
    let base = floor(g);
    let frac = g - base;
    let dir = select(vec3<i32>(-1), vec3<i32>(1), frac >= vec3<f32>(0.5));
    let corner = vec3<i32>(i32(k & 1u), i32((k >> 1u) & 1u), i32((k >> 2u) & 1u));
    return flatten_cell(vec3<i32>(base) + corner * dir, side);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_grid_layout() {
        let grid = GridParams::from_config(&FlockConfig::default()).unwrap();
        assert_eq!(grid.cell_width, 10.0);
        assert_eq!(grid.side_count, 22);
        assert_eq!(grid.cell_count, 22 * 22 * 22);
        assert_eq!(grid.minimum, Vec3::splat(-110.0));
    }

    #[test]
    fn test_scene_corners_are_inside_grid() {
        let grid = GridParams::from_config(&FlockConfig::default()).unwrap();
        for corner in [Vec3::splat(-100.0), Vec3::splat(100.0), Vec3::new(100.0, -100.0, 0.0)] {
            assert_ne!(grid.cell_id(corner), INVALID_CELL, "corner {corner:?}");
        }
    }

    #[test]
    fn test_flatten_order() {
        let grid = GridParams::from_config(&FlockConfig::default()).unwrap();
        let s = grid.side_count as u32;
        assert_eq!(grid.flatten(IVec3::new(1, 0, 0)), 1);
        assert_eq!(grid.flatten(IVec3::new(0, 1, 0)), s);
        assert_eq!(grid.flatten(IVec3::new(0, 0, 1)), s * s);
        assert_eq!(grid.flatten(IVec3::new(-1, 0, 0)), INVALID_CELL);
        assert_eq!(grid.flatten(IVec3::new(0, s as i32, 0)), INVALID_CELL);
    }

    #[test]
    fn test_out_of_domain_position_is_invalid() {
        let grid = GridParams::from_config(&FlockConfig::default()).unwrap();
        assert_eq!(grid.cell_id(Vec3::new(-500.0, 0.0, 0.0)), INVALID_CELL);
        assert_eq!(grid.cell_id(Vec3::new(0.0, f32::NAN, 0.0)), INVALID_CELL);
    }

    #[test]
    fn test_neighborhood_picks_the_near_half() {
        let grid = GridParams::from_config(&FlockConfig::default()).unwrap();
        // Cell (11,11,11) spans [0,10) on every axis.
        let low = grid.neighborhood(Vec3::new(1.0, 1.0, 1.0));
        let high = grid.neighborhood(Vec3::new(9.0, 9.0, 9.0));
        let own = grid.flatten(IVec3::splat(11));
        assert_eq!(low[0], own);
        assert_eq!(high[0], own);
        assert_eq!(low[7], grid.flatten(IVec3::splat(10)));
        assert_eq!(high[7], grid.flatten(IVec3::splat(12)));
        assert_eq!(high[1], grid.flatten(IVec3::new(12, 11, 11)));
    }

    #[test]
    fn test_neighborhood_covers_interaction_radius() {
        let config = FlockConfig::default();
        let grid = GridParams::from_config(&config).unwrap();
        let r = config.max_rule_distance() * 0.999;
        let p = Vec3::new(3.3, -7.1, 42.6);
        let cells = grid.neighborhood(p);
        for d in [Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z, Vec3::ONE.normalize()] {
            let q = p + d * r;
            assert!(cells.contains(&grid.cell_id(q)), "{q:?} escaped the neighbourhood");
        }
    }

    #[test]
    fn test_neighborhood_far_outside_is_invalid() {
        let grid = GridParams::from_config(&FlockConfig::default()).unwrap();
        for pos in [
            Vec3::new(-1e11, 0.0, 0.0),
            Vec3::new(1e11, 0.0, 0.0),
            Vec3::new(0.0, -3e38, 3e38),
            Vec3::splat(-1e30),
        ] {
            assert_eq!(grid.neighborhood(pos), [INVALID_CELL; 8], "{pos:?}");
        }
    }

    #[test]
    fn test_neighborhood_just_outside_keeps_edge_cells() {
        let grid = GridParams::from_config(&FlockConfig::default()).unwrap();
        // Just past the upper face the block still reaches back into the grid
        let cells = grid.neighborhood(Vec3::new(grid.minimum.x.abs() + 2.0, 0.0, 0.0));
        assert!(cells.iter().any(|&c| c != INVALID_CELL));
    }

    #[test]
    fn test_compute_indices() {
        let grid = GridParams::from_config(&FlockConfig::default()).unwrap();
        let positions = vec![Vec3::ZERO, Vec3::splat(-99.0), Vec3::new(55.0, 0.0, -3.0)];
        let mut agents = vec![0; 3];
        let mut cells = vec![0; 3];
        compute_indices(&grid, &positions, &mut agents, &mut cells);
        assert_eq!(agents, vec![0, 1, 2]);
        for (i, p) in positions.iter().enumerate() {
            assert_eq!(cells[i], grid.cell_id(*p));
        }
    }

    #[test]
    fn test_oversized_grid_rejected() {
        let config = FlockConfig::default()
            .with_cohesion(crate::config::RuleParams::new(0.001, 0.01))
            .with_separation(crate::config::RuleParams::new(0.001, 0.1))
            .with_alignment(crate::config::RuleParams::new(0.001, 0.1));
        assert!(GridParams::from_config(&config).is_err());
    }
}
