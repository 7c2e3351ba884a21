//! # flockgrid - uniform-grid flocking engine
//!
//! Simulates N boids under the three classic local rules (cohesion,
//! separation, alignment) on the CPU with `rayon` or on the GPU with `wgpu`
//! compute shaders.
//!
//! ## Quick Start
//!
//! ```ignore
//! use flockgrid::prelude::*;
//!
//! fn main() -> Result<(), FlockError> {
//!     let config = FlockConfig::default().with_seed(7);
//!     let mut flock = Flock::new(20_000, config)?;
//!
//!     for _ in 0..1000 {
//!         flock.step(0.1, Strategy::Coherent)?;
//!     }
//!
//!     let points = flock.snapshot(1.0 / config.scene_scale);
//!     flock.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## The step pipeline
//!
//! Every step runs these stages, each a full barrier:
//!
//! 1. **Index** - each agent gets the id of the grid cell it sits in.
//! 2. **Sort** - `(cell, agent)` pairs are sorted by cell.
//! 3. **Ranges** - each occupied cell gets the `[start, end]` slice of the
//!    sorted array holding its agents.
//! 4. **Evaluate** - each agent visits at most 8 cells and computes its new
//!    velocity into the "next" buffer.
//! 5. **Integrate** - positions move by the new velocity and wrap around the
//!    scene cube.
//!
//! The velocity buffers then swap roles. The grid cell is twice as wide as
//! the largest interaction radius, so the 2×2×2 block of cells on the side
//! of the agent's own cell always contains every neighbour.
//!
//! ## Strategies
//!
//! | Strategy | Neighbour search |
//! |----------|------------------|
//! | [`Strategy::BruteForce`] | all N agents; skips stages 1-3 |
//! | [`Strategy::Scattered`] | 8 cells, through the sorted index array |
//! | [`Strategy::Coherent`] | 8 cells, over state physically reordered by cell |
//!
//! All three produce the same velocities up to floating-point rounding. The
//! coherent strategy moves agents between slots every step; use
//! [`Flock::identities`] to follow an agent across steps.
//!
//! ## GPU
//!
//! ```ignore
//! let ctx = GpuContext::new()?;
//! let mut flock = GpuFlock::new(&ctx, 1_000_000, FlockConfig::default())?;
//! flock.step(0.1, Strategy::Coherent)?;
//! flock.write_positions_into(0.01, &vertex_buffer)?;
//! ```

pub mod config;
pub mod error;
mod gpu;
pub mod integrate;
pub mod neighbors;
pub mod partition;
mod reshuffle;
pub mod rules;
mod simulation;
pub mod snapshot;
pub mod spatial;
mod spawn;
mod store;
pub mod time;

pub use bytemuck;
pub use config::{FlockConfig, RuleParams};
pub use error::{FlockError, GpuError, Stage};
pub use glam::{Vec3, Vec4};
pub use gpu::{GpuContext, GpuFlock};
pub use simulation::{Flock, FlockBackend, PartitionView, Strategy};
pub use spatial::GridParams;
pub use spawn::SpawnContext;
pub use time::StepTimer;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::config::{FlockConfig, RuleParams};
    pub use crate::error::{FlockError, Stage};
    pub use crate::gpu::{GpuContext, GpuFlock};
    pub use crate::simulation::{Flock, FlockBackend, Strategy};
    pub use crate::time::StepTimer;
    pub use crate::{Vec3, Vec4};
}
