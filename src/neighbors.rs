//! Neighbour traversal for the three step strategies.
//!
//! Every evaluator reads positions and the current velocities, and writes
//! exactly one new velocity per agent into `next`. They differ only in which
//! candidate neighbours they visit:
//!
//! - brute force visits all N agents,
//! - scattered visits the 8-cell neighbourhood through the sorted agent ids,
//! - coherent visits the same cells but reads state that was already
//!   reordered by cell, so a range is a contiguous slice.

use glam::Vec3;
use rayon::prelude::*;

use crate::partition::CellRanges;
use crate::rules::{NeighborSums, RuleSet};
use crate::spatial::{GridParams, INVALID_CELL};

/// O(N²) evaluation over every other agent.
pub fn evaluate_brute_force(rules: &RuleSet, positions: &[Vec3], current: &[Vec3], next: &mut [Vec3]) {
    next.par_iter_mut().enumerate().for_each(|(i, out)| {
        let pos = positions[i];
        let mut sums = NeighborSums::default();
        for (j, (&other_pos, &other_vel)) in positions.iter().zip(current).enumerate() {
            if j != i {
                sums.accumulate(rules, pos, other_pos, other_vel);
            }
        }
        *out = sums.resolve(rules, pos, current[i]);
    });
}

/// Grid evaluation through the indirection array `sorted_agents`.
///
/// State stays in slot order; `next[i]` is agent `i`'s new velocity.
pub fn evaluate_scattered(
    rules: &RuleSet,
    grid: &GridParams,
    ranges: &CellRanges,
    sorted_agents: &[u32],
    positions: &[Vec3],
    current: &[Vec3],
    next: &mut [Vec3],
) {
    next.par_iter_mut().enumerate().for_each(|(i, out)| {
        let pos = positions[i];
        let mut sums = NeighborSums::default();
        for cell in grid.neighborhood(pos) {
            if cell == INVALID_CELL {
                continue;
            }
            let Some(range) = ranges.range(cell) else {
                continue;
            };
            for &other in &sorted_agents[range] {
                let other = other as usize;
                if other != i {
                    sums.accumulate(rules, pos, positions[other], current[other]);
                }
            }
        }
        *out = sums.resolve(rules, pos, current[i]);
    });
}

/// Grid evaluation over state already reordered by cell.
///
/// `positions` and `current` are in sorted order, and so is the output.
pub fn evaluate_coherent(
    rules: &RuleSet,
    grid: &GridParams,
    ranges: &CellRanges,
    positions: &[Vec3],
    current: &[Vec3],
    next: &mut [Vec3],
) {
    next.par_iter_mut().enumerate().for_each(|(i, out)| {
        let pos = positions[i];
        let mut sums = NeighborSums::default();
        for cell in grid.neighborhood(pos) {
            if cell == INVALID_CELL {
                continue;
            }
            let Some(range) = ranges.range(cell) else {
                continue;
            };
            let start = *range.start();
            for (offset, (&other_pos, &other_vel)) in
                positions[range.clone()].iter().zip(&current[range]).enumerate()
            {
                if start + offset != i {
                    sums.accumulate(rules, pos, other_pos, other_vel);
                }
            }
        }
        *out = sums.resolve(rules, pos, current[i]);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlockConfig;
    use crate::partition::sort_by_cell;
    use crate::spatial::compute_indices;

    struct Fixture {
        rules: RuleSet,
        grid: GridParams,
        positions: Vec<Vec3>,
        velocities: Vec<Vec3>,
    }

    fn cluster() -> Fixture {
        let config = FlockConfig::default();
        // A tight clump straddling a cell corner at the origin plus a loner.
        let positions = vec![
            Vec3::new(0.5, 0.5, 0.5),
            Vec3::new(-0.5, 0.4, 0.2),
            Vec3::new(0.2, -0.9, -0.3),
            Vec3::new(-1.5, -1.0, 1.2),
            Vec3::new(2.0, 1.5, -2.5),
            Vec3::new(60.0, -40.0, 20.0),
        ];
        let velocities = vec![
            Vec3::new(0.1, 0.0, 0.0),
            Vec3::new(0.0, 0.2, 0.0),
            Vec3::new(0.0, 0.0, -0.3),
            Vec3::new(-0.2, 0.1, 0.0),
            Vec3::new(0.05, 0.05, 0.05),
            Vec3::new(0.4, 0.0, 0.0),
        ];
        Fixture {
            rules: RuleSet::from_config(&config),
            grid: GridParams::from_config(&config).unwrap(),
            positions,
            velocities,
        }
    }

    fn partition(f: &Fixture) -> (Vec<u32>, CellRanges) {
        let n = f.positions.len();
        let mut agents = vec![0; n];
        let mut cells = vec![0; n];
        compute_indices(&f.grid, &f.positions, &mut agents, &mut cells);
        sort_by_cell(&mut cells, &mut agents, &mut Vec::new());
        let ranges = CellRanges::new(f.grid.cell_count as usize).unwrap();
        ranges.derive(&cells);
        (agents, ranges)
    }

    #[test]
    fn test_scattered_matches_brute_force() {
        let f = cluster();
        let n = f.positions.len();
        let mut brute = vec![Vec3::ZERO; n];
        evaluate_brute_force(&f.rules, &f.positions, &f.velocities, &mut brute);

        let (agents, ranges) = partition(&f);
        let mut grid = vec![Vec3::ZERO; n];
        evaluate_scattered(&f.rules, &f.grid, &ranges, &agents, &f.positions, &f.velocities, &mut grid);

        for i in 0..n {
            assert!((brute[i] - grid[i]).length() < 1e-5, "agent {i}: {:?} vs {:?}", brute[i], grid[i]);
        }
    }

    #[test]
    fn test_coherent_matches_brute_force() {
        let f = cluster();
        let n = f.positions.len();
        let mut brute = vec![Vec3::ZERO; n];
        evaluate_brute_force(&f.rules, &f.positions, &f.velocities, &mut brute);

        let (agents, ranges) = partition(&f);
        let sorted_pos: Vec<Vec3> = agents.iter().map(|&a| f.positions[a as usize]).collect();
        let sorted_vel: Vec<Vec3> = agents.iter().map(|&a| f.velocities[a as usize]).collect();
        let mut out = vec![Vec3::ZERO; n];
        evaluate_coherent(&f.rules, &f.grid, &ranges, &sorted_pos, &sorted_vel, &mut out);

        for (slot, &agent) in agents.iter().enumerate() {
            let expected = brute[agent as usize];
            assert!((expected - out[slot]).length() < 1e-5, "agent {agent}");
        }
    }

    #[test]
    fn test_isolated_agent_keeps_velocity() {
        let f = cluster();
        let n = f.positions.len();
        let (agents, ranges) = partition(&f);
        let mut out = vec![Vec3::ZERO; n];
        evaluate_scattered(&f.rules, &f.grid, &ranges, &agents, &f.positions, &f.velocities, &mut out);
        assert_eq!(out[5], f.velocities[5]);
    }
}
