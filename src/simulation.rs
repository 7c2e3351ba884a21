//! CPU flock: owns every buffer and sequences the step stages.

use std::fmt;

use glam::{Vec3, Vec4};
use tracing::{debug, info, warn};

use crate::config::{validate_dt, FlockConfig};
use crate::error::{try_alloc, FlockError};
use crate::integrate::integrate;
use crate::neighbors::{evaluate_brute_force, evaluate_coherent, evaluate_scattered};
use crate::partition::{sort_by_cell, CellRanges};
use crate::reshuffle::Reshuffler;
use crate::rules::RuleSet;
use crate::snapshot;
use crate::spatial::{compute_indices, GridParams, INVALID_CELL};
use crate::spawn::SpawnContext;
use crate::store::AgentStore;
use crate::time::StepTimer;

/// How a step finds each agent's neighbours. All three produce the same
/// velocities up to floating-point rounding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Every agent against every other agent. O(N²); the reference result.
    BruteForce,
    /// Uniform grid, reading state through the sorted index array.
    Scattered,
    /// Uniform grid over state reordered by cell each step.
    #[default]
    Coherent,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::BruteForce, Strategy::Scattered, Strategy::Coherent];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::BruteForce => "brute-force",
            Strategy::Scattered => "scattered",
            Strategy::Coherent => "coherent",
        })
    }
}

/// Operations shared by the CPU and GPU flocks.
///
/// Snapshots and identities come back in slot order. After a coherent step
/// the agent in a slot may differ from the previous step; `identities()[i]`
/// is the stable id of whoever occupies slot `i` now.
pub trait FlockBackend {
    fn agent_count(&self) -> usize;

    fn step(&mut self, dt: f32, strategy: Strategy) -> Result<(), FlockError>;

    /// Positions times `scale`, `w = 1`.
    fn positions_snapshot(&self, scale: f32) -> Result<Vec<Vec4>, FlockError>;

    /// Current velocities times `scale`, `w = 1`.
    fn velocities_snapshot(&self, scale: f32) -> Result<Vec<Vec4>, FlockError>;

    fn identities(&self) -> Result<Vec<u32>, FlockError>;
}

/// The grid partition of the current positions.
pub struct PartitionView<'a> {
    /// Agent slots in cell order.
    pub sorted_agents: &'a [u32],
    /// Cell id of each entry of `sorted_agents`.
    pub sorted_cells: &'a [u32],
    pub ranges: &'a CellRanges,
}

/// A flock simulated on the CPU with `rayon`.
///
/// ```ignore
/// let mut flock = Flock::new(50_000, FlockConfig::default().with_seed(1))?;
/// for _ in 0..100 {
///     flock.step(0.1, Strategy::Coherent)?;
/// }
/// let points = flock.snapshot(0.01);
/// flock.shutdown();
/// ```
pub struct Flock {
    config: FlockConfig,
    grid: GridParams,
    rules: RuleSet,
    store: AgentStore,
    agent_ids: Vec<u32>,
    cell_ids: Vec<u32>,
    sort_scratch: Vec<(u32, u32)>,
    ranges: CellRanges,
    reshuffler: Reshuffler,
    timer: StepTimer,
}

impl Flock {
    /// `agent_count` agents uniformly placed in the scene cube, at rest.
    pub fn new(agent_count: usize, config: FlockConfig) -> Result<Self, FlockError> {
        if agent_count == 0 {
            return Err(FlockError::invalid("agent count must be at least 1"));
        }
        let grid = GridParams::from_config(&config)?;
        let positions = SpawnContext::new(config.seed, config.scene_scale).uniform_positions(agent_count)?;
        let velocities = try_alloc("initial velocities", agent_count, Vec3::ZERO)?;
        Self::build(config, grid, &positions, &velocities)
    }

    /// A flock with explicit initial state.
    pub fn from_agents(config: FlockConfig, positions: &[Vec3], velocities: &[Vec3]) -> Result<Self, FlockError> {
        let grid = GridParams::from_config(&config)?;
        if positions.iter().chain(velocities).any(|v| !v.is_finite()) {
            return Err(FlockError::invalid("initial state contains non-finite values"));
        }
        Self::build(config, grid, positions, velocities)
    }

    fn build(config: FlockConfig, grid: GridParams, positions: &[Vec3], velocities: &[Vec3]) -> Result<Self, FlockError> {
        let store = AgentStore::from_state(positions, velocities)?;
        let n = store.len();

        let mut sort_scratch = Vec::new();
        sort_scratch
            .try_reserve_exact(n)
            .map_err(|_| FlockError::Allocation { buffer: "sort scratch", len: n })?;

        let flock = Self {
            rules: RuleSet::from_config(&config),
            agent_ids: try_alloc("sorted agent ids", n, 0u32)?,
            cell_ids: try_alloc("sorted cell ids", n, INVALID_CELL)?,
            sort_scratch,
            ranges: CellRanges::new(grid.cell_count as usize)?,
            reshuffler: Reshuffler::new(n)?,
            timer: StepTimer::new(config.timing_window),
            store,
            grid,
            config,
        };

        info!(
            agents = n,
            cell_width = grid.cell_width,
            side_count = grid.side_count,
            cell_count = grid.cell_count,
            grid_min = grid.minimum.x,
            backend = "cpu",
            "flock created"
        );
        Ok(flock)
    }

    pub fn agent_count(&self) -> usize {
        self.store.len()
    }

    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    pub fn grid(&self) -> &GridParams {
        &self.grid
    }

    pub fn positions(&self) -> &[Vec3] {
        self.store.positions()
    }

    pub fn velocities(&self) -> &[Vec3] {
        self.store.velocities()
    }

    /// Stable id of the agent in each slot.
    pub fn identities(&self) -> &[u32] {
        self.store.ids()
    }

    pub fn timer(&self) -> &StepTimer {
        &self.timer
    }

    /// Advance the flock by `dt` seconds.
    pub fn step(&mut self, dt: f32, strategy: Strategy) -> Result<(), FlockError> {
        validate_dt(dt)?;
        let started = self.timer.begin();
        debug!(step = self.timer.total_steps(), %strategy, dt, "step");

        match strategy {
            Strategy::BruteForce => {
                let b = self.store.step_buffers();
                evaluate_brute_force(&self.rules, b.positions, b.current, b.next);
            }
            Strategy::Scattered => {
                self.repartition();
                let b = self.store.step_buffers();
                evaluate_scattered(
                    &self.rules,
                    &self.grid,
                    &self.ranges,
                    &self.agent_ids,
                    b.positions,
                    b.current,
                    b.next,
                );
            }
            Strategy::Coherent => {
                self.repartition();
                let b = self.store.step_buffers();
                self.reshuffler.gather(&self.agent_ids, b.positions, b.current, b.ids);
                evaluate_coherent(
                    &self.rules,
                    &self.grid,
                    &self.ranges,
                    &self.reshuffler.positions,
                    &self.reshuffler.velocities,
                    b.next,
                );
                self.reshuffler.commit(&mut self.store);
            }
        }

        let b = self.store.step_buffers();
        integrate(b.positions, b.next, dt, self.config.scene_scale);
        self.store.swap_velocities();

        self.timer.end(started);
        Ok(())
    }

    /// Index, sort and range-derive the current positions.
    pub fn partition(&mut self) -> PartitionView<'_> {
        self.repartition();
        PartitionView {
            sorted_agents: &self.agent_ids,
            sorted_cells: &self.cell_ids,
            ranges: &self.ranges,
        }
    }

    fn repartition(&mut self) {
        compute_indices(&self.grid, self.store.positions(), &mut self.agent_ids, &mut self.cell_ids);
        sort_by_cell(&mut self.cell_ids, &mut self.agent_ids, &mut self.sort_scratch);
        self.ranges.derive(&self.cell_ids);

        // Invalid ids sort last.
        let outside = self.cell_ids.iter().rev().take_while(|&&c| c == INVALID_CELL).count();
        if outside > 0 {
            warn!(outside, "agents outside the grid are ignored as neighbours");
        }
    }

    /// Positions times `scale`, one `vec4` per slot.
    pub fn snapshot(&self, scale: f32) -> Vec<Vec4> {
        snapshot::records(self.store.positions(), scale)
    }

    /// Like [`Flock::snapshot`], into a caller buffer of exactly one record
    /// per agent.
    pub fn write_snapshot(&self, scale: f32, out: &mut [Vec4]) -> Result<(), FlockError> {
        snapshot::write_records(self.store.positions(), scale, out)
    }

    pub fn velocity_snapshot(&self, scale: f32) -> Vec<Vec4> {
        snapshot::records(self.store.velocities(), scale)
    }

    pub fn write_velocity_snapshot(&self, scale: f32, out: &mut [Vec4]) -> Result<(), FlockError> {
        snapshot::write_records(self.store.velocities(), scale, out)
    }

    /// Release every buffer.
    pub fn shutdown(self) {
        info!(agents = self.agent_count(), steps = self.timer.total_steps(), "flock shut down");
    }
}

impl FlockBackend for Flock {
    fn agent_count(&self) -> usize {
        Flock::agent_count(self)
    }

    fn step(&mut self, dt: f32, strategy: Strategy) -> Result<(), FlockError> {
        Flock::step(self, dt, strategy)
    }

    fn positions_snapshot(&self, scale: f32) -> Result<Vec<Vec4>, FlockError> {
        Ok(self.snapshot(scale))
    }

    fn velocities_snapshot(&self, scale: f32) -> Result<Vec<Vec4>, FlockError> {
        Ok(self.velocity_snapshot(scale))
    }

    fn identities(&self) -> Result<Vec<u32>, FlockError> {
        Ok(Flock::identities(self).to_vec())
    }
}
