//! Grid partitioner: sort `(agent, cell)` pairs by cell, then derive each
//! cell's contiguous slice of the sorted array.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicI32, Ordering};

use rayon::prelude::*;

use crate::error::{try_alloc_with, FlockError};

/// Start marker of a cell with no agents.
pub const EMPTY_START: i32 = -1;
/// End marker of a cell with no agents. `EMPTY_START > EMPTY_END`, so an
/// inclusive loop over an empty cell runs zero times.
pub const EMPTY_END: i32 = -2;

/// Sort the parallel key/value arrays by cell id, ascending.
///
/// Ties are broken by agent id, so the result does not depend on how the
/// parallel sort splits its work. `scratch` is reused across steps.
pub fn sort_by_cell(cell_ids: &mut [u32], agent_ids: &mut [u32], scratch: &mut Vec<(u32, u32)>) {
    debug_assert_eq!(cell_ids.len(), agent_ids.len());

    scratch.clear();
    scratch.par_extend(
        cell_ids
            .par_iter()
            .zip(agent_ids.par_iter())
            .map(|(&cell, &agent)| (cell, agent)),
    );
    scratch.par_sort_unstable();

    cell_ids
        .par_iter_mut()
        .zip(agent_ids.par_iter_mut())
        .zip(scratch.par_iter())
        .for_each(|((cell, agent), &(c, a))| {
            *cell = c;
            *agent = a;
        });
}

/// Per-cell `[start, end]` table over the sorted index array.
///
/// Slots are atomics because range derivation writes them from many workers
/// at once; each slot has exactly one writer per step.
pub struct CellRanges {
    start: Vec<AtomicI32>,
    end: Vec<AtomicI32>,
}

impl CellRanges {
    pub fn new(cell_count: usize) -> Result<Self, FlockError> {
        Ok(Self {
            start: try_alloc_with("cell start table", cell_count, || AtomicI32::new(EMPTY_START))?,
            end: try_alloc_with("cell end table", cell_count, || AtomicI32::new(EMPTY_END))?,
        })
    }

    pub fn cell_count(&self) -> usize {
        self.start.len()
    }

    /// Mark every cell empty.
    pub fn reset(&self) {
        self.start
            .par_iter()
            .zip(self.end.par_iter())
            .for_each(|(s, e)| {
                s.store(EMPTY_START, Ordering::Relaxed);
                e.store(EMPTY_END, Ordering::Relaxed);
            });
    }

    /// Rebuild the table from cell ids that are already sorted.
    ///
    /// Position `i` opens its cell when it differs from `i - 1` (or is the
    /// first element) and closes it when it differs from `i + 1` (or is the
    /// last). Ids outside the table are skipped.
    pub fn derive(&self, sorted_cells: &[u32]) {
        self.reset();

        let n = sorted_cells.len();
        debug_assert!(n <= i32::MAX as usize);
        let cell_count = self.cell_count();
        sorted_cells.par_iter().enumerate().for_each(|(i, &cell)| {
            let slot = cell as usize;
            if slot >= cell_count {
                return;
            }
            if i == 0 || sorted_cells[i - 1] != cell {
                self.start[slot].store(i as i32, Ordering::Relaxed);
            }
            if i + 1 == n || sorted_cells[i + 1] != cell {
                self.end[slot].store(i as i32, Ordering::Relaxed);
            }
        });
    }

    /// Raw `(start, end)` of a cell, sentinels included.
    #[inline]
    pub fn bounds(&self, cell: u32) -> (i32, i32) {
        let slot = cell as usize;
        (
            self.start[slot].load(Ordering::Relaxed),
            self.end[slot].load(Ordering::Relaxed),
        )
    }

    /// Sorted-array positions belonging to `cell`; `None` for empty or
    /// out-of-range cells.
    #[inline]
    pub fn range(&self, cell: u32) -> Option<RangeInclusive<usize>> {
        if cell as usize >= self.cell_count() {
            return None;
        }
        let (start, end) = self.bounds(cell);
        if start > end {
            return None;
        }
        Some(start as usize..=end as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::INVALID_CELL;

    #[test]
    fn test_sort_orders_by_cell_then_agent() {
        let mut cells = vec![5, 2, 5, 0, 2];
        let mut agents = vec![0, 1, 2, 3, 4];
        let mut scratch = Vec::new();
        sort_by_cell(&mut cells, &mut agents, &mut scratch);
        assert_eq!(cells, vec![0, 2, 2, 5, 5]);
        assert_eq!(agents, vec![3, 1, 4, 0, 2]);
    }

    #[test]
    fn test_ranges_from_sorted_cells() {
        let ranges = CellRanges::new(8).unwrap();
        ranges.derive(&[1, 1, 3, 6, 6, 6]);
        assert_eq!(ranges.range(1), Some(0..=1));
        assert_eq!(ranges.range(3), Some(2..=2));
        assert_eq!(ranges.range(6), Some(3..=5));
        assert_eq!(ranges.range(0), None);
        assert_eq!(ranges.bounds(7), (EMPTY_START, EMPTY_END));
    }

    #[test]
    fn test_single_cell_covers_whole_array() {
        let ranges = CellRanges::new(4).unwrap();
        ranges.derive(&[2, 2, 2]);
        assert_eq!(ranges.range(2), Some(0..=2));
    }

    #[test]
    fn test_invalid_cells_are_skipped() {
        let ranges = CellRanges::new(4).unwrap();
        ranges.derive(&[0, 3, INVALID_CELL, INVALID_CELL]);
        assert_eq!(ranges.range(0), Some(0..=0));
        assert_eq!(ranges.range(3), Some(1..=1));
        assert_eq!(ranges.range(INVALID_CELL), None);
    }

    #[test]
    fn test_rederive_clears_previous_step() {
        let ranges = CellRanges::new(4).unwrap();
        ranges.derive(&[0, 0, 1]);
        ranges.derive(&[2, 2, 2]);
        assert_eq!(ranges.range(0), None);
        assert_eq!(ranges.range(1), None);
        assert_eq!(ranges.range(2), Some(0..=2));
    }
}
