//! Read-only export of agent state for a renderer.
//!
//! A snapshot is one `vec4` per agent, in slot order: the xyz components
//! multiplied by a caller-chosen scale and `w = 1.0`. The layout matches a
//! GPU vertex or storage buffer of `vec4<f32>`, so [`as_bytes`] can be
//! uploaded as is.

use glam::{Vec3, Vec4};
use rayon::prelude::*;

use crate::error::FlockError;

/// Write one scaled record per value into `out`.
///
/// `out` must hold exactly one record per value; nothing is written
/// otherwise.
pub fn write_records(values: &[Vec3], scale: f32, out: &mut [Vec4]) -> Result<(), FlockError> {
    if out.len() != values.len() {
        return Err(FlockError::SnapshotLength {
            expected: values.len(),
            actual: out.len(),
        });
    }
    out.par_iter_mut()
        .zip(values.par_iter())
        .for_each(|(record, &v)| *record = (v * scale).extend(1.0));
    Ok(())
}

/// Allocate and fill a snapshot of `values`.
pub fn records(values: &[Vec3], scale: f32) -> Vec<Vec4> {
    values.par_iter().map(|&v| (v * scale).extend(1.0)).collect()
}

/// Byte view of a snapshot, for direct upload.
pub fn as_bytes(records: &[Vec4]) -> &[u8] {
    bytemuck::cast_slice(records)
}
