//! Error types for flockgrid.
//!
//! Every failure is fatal for the simulation it happens in: a half-written
//! velocity buffer is not a state a step can resume from, so nothing here is
//! retried. GPU failures carry the [`Stage`] whose commands failed.

use std::fmt;

use thiserror::Error;

/// Pipeline stage a failure is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Device, buffer or pipeline creation.
    Initialization,
    /// Writing host data into device buffers.
    Upload,
    /// Computing per-agent cell ids.
    Indexing,
    /// Sorting agent ids by cell id.
    Sorting,
    /// Building the per-cell start/end table.
    RangeDerivation,
    /// Reordering state into cell order (coherent strategy).
    Reshuffle,
    /// Evaluating the flocking rules.
    Evaluation,
    /// Advancing positions and wrapping them.
    Integration,
    /// Writing a snapshot for the renderer.
    Snapshot,
    /// Copying device buffers back to the host.
    Readback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Initialization => "initialization",
            Stage::Upload => "upload",
            Stage::Indexing => "indexing",
            Stage::Sorting => "sorting",
            Stage::RangeDerivation => "range derivation",
            Stage::Reshuffle => "reshuffle",
            Stage::Evaluation => "rule evaluation",
            Stage::Integration => "integration",
            Stage::Snapshot => "snapshot",
            Stage::Readback => "readback",
        };
        f.write_str(name)
    }
}

/// Errors raised by the GPU backend.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No compatible GPU adapter found.
    #[error("no compatible GPU adapter found; a Vulkan/Metal/DX12/GL capable device is required")]
    NoAdapter,
    /// Failed to create GPU device.
    #[error("failed to create GPU device: {0}")]
    DeviceCreation(#[from] wgpu::RequestDeviceError),
    /// A command, shader or pipeline was rejected by validation.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The device ran out of memory while allocating a resource.
    #[error("device out of memory: {0}")]
    OutOfMemory(String),
    /// Failed to map buffer for reading.
    #[error("failed to map GPU buffer: {0}")]
    BufferMapping(String),
}

impl GpuError {
    /// Classify an error popped from a `wgpu` error scope.
    pub(crate) fn from_scope(error: wgpu::Error) -> Self {
        match error {
            wgpu::Error::OutOfMemory { .. } => GpuError::OutOfMemory(error.to_string()),
            other => GpuError::Validation(other.to_string()),
        }
    }
}

/// Errors that can occur when creating, stepping or reading a flock.
#[derive(Debug, Error)]
pub enum FlockError {
    /// Rejected before any allocation or dispatch.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A host buffer could not be allocated.
    #[error("failed to allocate {buffer} ({len} elements)")]
    Allocation {
        /// Buffer that failed.
        buffer: &'static str,
        /// Requested element count.
        len: usize,
    },
    /// Caller-provided snapshot buffer does not hold one record per agent.
    #[error("snapshot buffer holds {actual} records, {expected} required")]
    SnapshotLength {
        /// Records required (one per agent).
        expected: usize,
        /// Records provided.
        actual: usize,
    },
    /// GPU failure, tagged with the stage whose work failed.
    #[error("GPU failure during {stage}: {source}")]
    Gpu {
        /// Failing stage.
        stage: Stage,
        /// Underlying device error.
        #[source]
        source: GpuError,
    },
}

impl FlockError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        FlockError::InvalidConfig(msg.into())
    }

    pub(crate) fn gpu(stage: Stage, source: GpuError) -> Self {
        FlockError::Gpu { stage, source }
    }
}

/// Allocate a zero-filled host buffer, reporting exhaustion instead of aborting.
pub(crate) fn try_alloc<T: Clone>(
    buffer: &'static str,
    len: usize,
    fill: T,
) -> Result<Vec<T>, FlockError> {
    try_alloc_with(buffer, len, || fill.clone())
}

/// Like [`try_alloc`], for element types that are built rather than cloned.
pub(crate) fn try_alloc_with<T>(
    buffer: &'static str,
    len: usize,
    make: impl FnMut() -> T,
) -> Result<Vec<T>, FlockError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| FlockError::Allocation { buffer, len })?;
    v.extend(std::iter::repeat_with(make).take(len));
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_error_names_stage() {
        let err = FlockError::gpu(Stage::Sorting, GpuError::Validation("bad binding".into()));
        let msg = err.to_string();
        assert!(msg.contains("sorting"));
        assert!(msg.contains("bad binding"));
    }

    #[test]
    fn test_try_alloc_reports_exhaustion() {
        let err = try_alloc::<u64>("huge", usize::MAX / 4, 0).unwrap_err();
        assert!(matches!(err, FlockError::Allocation { buffer: "huge", .. }));
    }

    #[test]
    fn test_try_alloc_fills() {
        let v = try_alloc("small", 4, 7u32).unwrap();
        assert_eq!(v, vec![7, 7, 7, 7]);
    }
}
