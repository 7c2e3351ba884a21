//! Agent state arena: positions, double-buffered velocities and identity tags.
//!
//! The store owns every per-agent array for the lifetime of a flock. Stages
//! only ever see borrowed slices for the duration of one step.

use glam::Vec3;

use crate::error::{try_alloc, FlockError};

/// Which of the two velocity buffers a role currently points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VelocityBuffer {
    A,
    B,
}

/// Per-agent state for N agents.
pub struct AgentStore {
    positions: Vec<Vec3>,
    velocities_a: Vec<Vec3>,
    velocities_b: Vec<Vec3>,
    /// Buffer holding the "current" (read-only during a step) velocities.
    current: VelocityBuffer,
    /// Persistent identity of the agent occupying each slot.
    ids: Vec<u32>,
}

/// Mutable view of the store for one step.
///
/// `current` is read-only, `next` is write-only; the evaluator needs both at
/// once, which is why they come out of one borrow.
pub struct StepBuffers<'a> {
    pub positions: &'a mut [Vec3],
    pub current: &'a mut [Vec3],
    pub next: &'a mut [Vec3],
    pub ids: &'a mut [u32],
}

impl AgentStore {
    /// Allocate storage for `count` agents at the origin with zero velocity.
    pub fn new(count: usize) -> Result<Self, FlockError> {
        if count == 0 {
            return Err(FlockError::invalid("agent count must be at least 1"));
        }
        // Cell ranges index the sorted array with i32
        if count > i32::MAX as usize {
            return Err(FlockError::invalid(format!(
                "agent count {count} exceeds the cell range index limit ({})",
                i32::MAX
            )));
        }
        let mut ids = try_alloc("identity tags", count, 0u32)?;
        for (slot, id) in ids.iter_mut().enumerate() {
            *id = slot as u32;
        }
        Ok(Self {
            positions: try_alloc("positions", count, Vec3::ZERO)?,
            velocities_a: try_alloc("velocities (A)", count, Vec3::ZERO)?,
            velocities_b: try_alloc("velocities (B)", count, Vec3::ZERO)?,
            current: VelocityBuffer::A,
            ids,
        })
    }

    /// Build a store from explicit state. Both slices must have the same,
    /// non-zero length.
    pub fn from_state(positions: &[Vec3], velocities: &[Vec3]) -> Result<Self, FlockError> {
        if positions.len() != velocities.len() {
            return Err(FlockError::invalid(format!(
                "{} positions but {} velocities",
                positions.len(),
                velocities.len()
            )));
        }
        let mut store = Self::new(positions.len())?;
        store.positions.copy_from_slice(positions);
        store.velocities_a.copy_from_slice(velocities);
        Ok(store)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// Velocities of the current role.
    pub fn velocities(&self) -> &[Vec3] {
        match self.current {
            VelocityBuffer::A => &self.velocities_a,
            VelocityBuffer::B => &self.velocities_b,
        }
    }

    /// Identity tag of the agent in each slot.
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Split the store into the disjoint borrows one step needs.
    pub fn step_buffers(&mut self) -> StepBuffers<'_> {
        let (current, next) = match self.current {
            VelocityBuffer::A => (&mut self.velocities_a, &mut self.velocities_b),
            VelocityBuffer::B => (&mut self.velocities_b, &mut self.velocities_a),
        };
        StepBuffers {
            positions: &mut self.positions,
            current,
            next,
            ids: &mut self.ids,
        }
    }

    /// Swap in positions and ids that were reordered elsewhere. Lengths must
    /// match the store's.
    pub fn exchange_layout(&mut self, positions: &mut Vec<Vec3>, ids: &mut Vec<u32>) {
        debug_assert_eq!(positions.len(), self.positions.len());
        debug_assert_eq!(ids.len(), self.ids.len());
        std::mem::swap(&mut self.positions, positions);
        std::mem::swap(&mut self.ids, ids);
    }

    /// Hand the "current" role to the buffer written during the last step.
    pub fn swap_velocities(&mut self) {
        self.current = match self.current {
            VelocityBuffer::A => VelocityBuffer::B,
            VelocityBuffer::B => VelocityBuffer::A,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_agents_rejected() {
        assert!(matches!(AgentStore::new(0), Err(FlockError::InvalidConfig(_))));
    }

    #[test]
    fn test_count_above_range_index_rejected_before_allocation() {
        let count = i32::MAX as usize + 1;
        assert!(matches!(AgentStore::new(count), Err(FlockError::InvalidConfig(_))));
    }

    #[test]
    fn test_identity_tags_start_at_slot() {
        let store = AgentStore::new(5).unwrap();
        assert_eq!(store.ids(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_swap_exchanges_roles_without_copying() {
        let mut store =
            AgentStore::from_state(&[Vec3::ZERO; 2], &[Vec3::X, Vec3::Y]).unwrap();
        {
            let buffers = store.step_buffers();
            assert_eq!(buffers.current, &[Vec3::X, Vec3::Y]);
            buffers.next[0] = Vec3::Z;
            buffers.next[1] = Vec3::NEG_Z;
        }
        assert_eq!(store.velocities(), &[Vec3::X, Vec3::Y]);
        store.swap_velocities();
        assert_eq!(store.velocities(), &[Vec3::Z, Vec3::NEG_Z]);
        store.swap_velocities();
        assert_eq!(store.velocities(), &[Vec3::X, Vec3::Y]);
    }

    #[test]
    fn test_mismatched_state_rejected() {
        assert!(AgentStore::from_state(&[Vec3::ZERO; 2], &[Vec3::ZERO]).is_err());
    }
}
