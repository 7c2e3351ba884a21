//! GPU backend: the step pipeline as `wgpu` compute passes.
//!
//! Each stage is recorded into its own command encoder and submitted inside
//! a pair of error scopes, so a validation or out-of-memory error is
//! reported against the stage whose commands caused it. Submissions go to a
//! single queue in order, which is the barrier between stages.

mod flock_gpu;
mod spatial_gpu;

use std::sync::mpsc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tracing::info;

use crate::config::FlockConfig;
use crate::error::{FlockError, GpuError, Stage};
use crate::spatial::GridParams;

pub use flock_gpu::GpuFlock;

pub(crate) const WORKGROUP_SIZE: u32 = 256;
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Adapter, device and queue shared by every flock created from it.
///
/// Cloning is cheap; clones share the same device.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
}

impl GpuContext {
    /// Headless context on the highest-performance adapter with compute
    /// support.
    pub fn new() -> Result<Self, FlockError> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Self, FlockError> {
        let init = |e| FlockError::gpu(Stage::Initialization, e);

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| init(GpuError::NoAdapter))?;

        if !adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(init(GpuError::NoAdapter));
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Flock Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| init(GpuError::from(e)))?;

        let adapter_info = adapter.get_info();
        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "GPU context created"
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Run `f` inside validation and out-of-memory error scopes.
    pub(crate) fn scoped<T>(&self, stage: Stage, f: impl FnOnce() -> T) -> Result<T, FlockError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            Some(error) => Err(FlockError::gpu(stage, GpuError::from_scope(error))),
            None => Ok(out),
        }
    }

    /// Record one stage into a fresh encoder and submit it.
    pub(crate) fn submit_stage(
        &self,
        stage: Stage,
        record: impl FnOnce(&mut wgpu::CommandEncoder),
    ) -> Result<(), FlockError> {
        self.scoped(stage, || {
            let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Flock Stage Encoder"),
            });
            record(&mut encoder);
            self.queue.submit(Some(encoder.finish()));
        })
    }

    /// Map `staging` and copy out its first `words` 32-bit words.
    pub(crate) fn read_words(&self, staging: &wgpu::Buffer, words: usize) -> Result<Vec<u32>, FlockError> {
        let readback = |msg: String| FlockError::gpu(Stage::Readback, GpuError::BufferMapping(msg));

        let size = (words * std::mem::size_of::<u32>()) as u64;
        let slice = staging.slice(..size);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(readback(e.to_string())),
            Err(_) => return Err(readback("map callback never ran".into())),
        }

        let data = {
            let view = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, u32>(&view).to_vec()
        };
        staging.unmap();
        Ok(data)
    }
}

/// Uniform block shared by every flock kernel. Mirrors [`SIM_PARAMS_WGSL`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub(crate) struct SimParams {
    pub grid_min: [f32; 3],
    pub inv_cell_width: f32,
    pub distances: [f32; 3],
    pub max_speed: f32,
    pub scales: [f32; 3],
    pub scene_scale: f32,
    pub cell_width: f32,
    pub side_count: i32,
    pub cell_count: u32,
    pub num_agents: u32,
    pub padded_count: u32,
    pub dt: f32,
    pub _pad0: u32,
    pub _pad1: u32,
}

impl SimParams {
    pub fn new(config: &FlockConfig, grid: &GridParams, num_agents: u32, padded_count: u32) -> Self {
        Self {
            grid_min: grid.minimum.to_array(),
            inv_cell_width: grid.inv_cell_width,
            distances: [
                config.cohesion.distance,
                config.separation.distance,
                config.alignment.distance,
            ],
            max_speed: config.max_speed,
            scales: [config.cohesion.scale, config.separation.scale, config.alignment.scale],
            scene_scale: config.scene_scale,
            cell_width: grid.cell_width,
            side_count: grid.side_count,
            cell_count: grid.cell_count,
            num_agents,
            padded_count,
            dt: 0.0,
            _pad0: 0,
            _pad1: 0,
        }
    }
}

pub(crate) const SIM_PARAMS_WGSL: &str = r#"
struct SimParams {
    grid_min: vec3<f32>,
    inv_cell_width: f32,
    distances: vec3<f32>,
    max_speed: f32,
    scales: vec3<f32>,
    scene_scale: f32,
    cell_width: f32,
    side_count: i32,
    cell_count: u32,
    num_agents: u32,
    padded_count: u32,
    dt: f32,
    _pad0: u32,
    _pad1: u32,
}

const WORKGROUP_SIZE: u32 = 256u;

// Flat invocation index for 1D or 2D dispatches
fn invocation_index(gid: vec3<u32>, groups: vec3<u32>) -> u32 {
    return gid.x + gid.y * groups.x * WORKGROUP_SIZE;
}
"#;

/// Workgroup counts `(x, y)` covering `threads` invocations without
/// exceeding the per-dimension dispatch limit.
pub(crate) fn dispatch_dims(threads: u32) -> (u32, u32) {
    let groups = threads.div_ceil(WORKGROUP_SIZE).max(1);
    if groups <= MAX_GROUPS_PER_DIM {
        (groups, 1)
    } else {
        let y = groups.div_ceil(MAX_GROUPS_PER_DIM);
        (groups.div_ceil(y), y)
    }
}

/// One compute pass dispatching `threads` invocations.
pub(crate) fn dispatch(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    offsets: &[u32],
    threads: u32,
) {
    let (x, y) = dispatch_dims(threads);
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(label),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind_group, offsets);
    pass.dispatch_workgroups(x, y, 1);
}

pub(crate) fn create_compute_pipeline(
    device: &wgpu::Device,
    shader: &wgpu::ShaderModule,
    layout: Option<&wgpu::PipelineLayout>,
    label: &str,
) -> wgpu::ComputePipeline {
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout, // None = auto layout
        module: shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}

pub(crate) fn create_shader(device: &wgpu::Device, label: &str, source: String) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

pub(crate) fn storage_buffer(device: &wgpu::Device, label: &str, size: u64, extra: wgpu::BufferUsages) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(4),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | extra,
        mapped_at_creation: false,
    })
}

/// Bind group with `buffers[i]` at binding `i`, against the pipeline's
/// (auto) layout.
pub(crate) fn bind_buffers(
    device: &wgpu::Device,
    label: &str,
    pipeline: &wgpu::ComputePipeline,
    buffers: &[&wgpu::Buffer],
) -> wgpu::BindGroup {
    let layout = pipeline.get_bind_group_layout(0);
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout: &layout,
        entries: &entries,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn validate_wgsl(code: &str) -> Result<(), String> {
        let module = naga::front::wgsl::parse_str(code)
            .map_err(|e| format!("WGSL parse error: {:?}", e))?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator
            .validate(&module)
            .map_err(|e| format!("WGSL validation error: {:?}", e))?;

        Ok(())
    }

    #[test]
    fn test_sim_params_layout() {
        assert_eq!(std::mem::size_of::<SimParams>(), 80);
    }

    #[test]
    fn test_dispatch_dims_cover_threads() {
        assert_eq!(dispatch_dims(1), (1, 1));
        assert_eq!(dispatch_dims(256), (1, 1));
        assert_eq!(dispatch_dims(257), (2, 1));
        let threads = 40_000_000;
        let (x, y) = dispatch_dims(threads);
        assert!(x <= MAX_GROUPS_PER_DIM && y <= MAX_GROUPS_PER_DIM);
        assert!(x as u64 * y as u64 * WORKGROUP_SIZE as u64 >= threads as u64);
    }
}
