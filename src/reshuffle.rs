//! Coherent-layout reordering.
//!
//! Gathers agent state into cell-sorted order so a cell's agents sit next to
//! each other in memory. After the coherent evaluator has run, the reordered
//! positions and identity tags are swapped into the store; the reordered
//! velocities are only an input to that one evaluation.

use glam::Vec3;
use rayon::prelude::*;

use crate::error::{try_alloc, FlockError};
use crate::store::AgentStore;

/// Scratch arrays receiving the reordered state.
pub struct Reshuffler {
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    pub ids: Vec<u32>,
}

impl Reshuffler {
    pub fn new(count: usize) -> Result<Self, FlockError> {
        Ok(Self {
            positions: try_alloc("reshuffled positions", count, Vec3::ZERO)?,
            velocities: try_alloc("reshuffled velocities", count, Vec3::ZERO)?,
            ids: try_alloc("reshuffled identities", count, 0u32)?,
        })
    }

    /// Slot `i` of every scratch array receives the state of `order[i]`.
    pub fn gather(&mut self, order: &[u32], positions: &[Vec3], velocities: &[Vec3], ids: &[u32]) {
        self.positions
            .par_iter_mut()
            .zip(self.velocities.par_iter_mut())
            .zip(self.ids.par_iter_mut())
            .zip(order.par_iter())
            .for_each(|(((pos, vel), id), &src)| {
                let src = src as usize;
                *pos = positions[src];
                *vel = velocities[src];
                *id = ids[src];
            });
    }

    /// Make the reordered positions and ids the store's own.
    ///
    /// The store's old arrays become the scratch for the next gather.
    pub fn commit(&mut self, store: &mut AgentStore) {
        store.exchange_layout(&mut self.positions, &mut self.ids);
    }
}
