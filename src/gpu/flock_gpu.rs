//! GPU flock: agent buffers, evaluation kernels and the step sequence.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use super::spatial_gpu::SpatialGpu;
use super::{
    bind_buffers, create_compute_pipeline, create_shader, dispatch, storage_buffer, GpuContext, SimParams,
    SIM_PARAMS_WGSL,
};
use crate::config::{validate_dt, FlockConfig};
use crate::error::{try_alloc, FlockError, Stage};
use crate::rules::RULES_WGSL;
use crate::simulation::{FlockBackend, Strategy};
use crate::spatial::{GridParams, GRID_WGSL};
use crate::spawn::SpawnContext;
use crate::time::StepTimer;

const VEC4_BYTES: u64 = 16;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct ExportParams {
    scale: f32,
    count: u32,
    _pad0: u32,
    _pad1: u32,
}

/// A flock simulated with `wgpu` compute shaders.
///
/// Positions and velocities live on the device as `vec4<f32>` arrays. The
/// two velocity buffers swap roles after every step; every kernel that
/// reads or writes velocities has one bind group per role assignment.
pub struct GpuFlock {
    ctx: GpuContext,
    config: FlockConfig,
    grid: GridParams,
    params: SimParams,
    num_agents: u32,

    params_buffer: wgpu::Buffer,
    positions: wgpu::Buffer,
    velocities: [wgpu::Buffer; 2],
    ids: wgpu::Buffer,
    sorted_positions: wgpu::Buffer,
    sorted_velocities: wgpu::Buffer,
    sorted_ids: wgpu::Buffer,
    snapshot_buffer: wgpu::Buffer,
    staging: wgpu::Buffer,
    export_params_buffer: wgpu::Buffer,

    spatial: SpatialGpu,

    brute_force_pipeline: wgpu::ComputePipeline,
    scattered_pipeline: wgpu::ComputePipeline,
    reshuffle_pipeline: wgpu::ComputePipeline,
    coherent_pipeline: wgpu::ComputePipeline,
    integrate_pipeline: wgpu::ComputePipeline,
    export_pipeline: wgpu::ComputePipeline,

    // Indexed by `current`
    brute_force_bind_groups: [wgpu::BindGroup; 2],
    scattered_bind_groups: [wgpu::BindGroup; 2],
    reshuffle_bind_groups: [wgpu::BindGroup; 2],
    coherent_bind_groups: [wgpu::BindGroup; 2],
    integrate_bind_groups: [wgpu::BindGroup; 2],

    /// Index of the velocity buffer holding the current velocities.
    current: usize,
    timer: StepTimer,
}

impl GpuFlock {
    /// `agent_count` agents uniformly placed in the scene cube, at rest.
    pub fn new(ctx: &GpuContext, agent_count: usize, config: FlockConfig) -> Result<Self, FlockError> {
        if agent_count == 0 {
            return Err(FlockError::invalid("agent count must be at least 1"));
        }
        let grid = GridParams::from_config(&config)?;
        let positions = SpawnContext::new(config.seed, config.scene_scale).uniform_positions(agent_count)?;
        let velocities = try_alloc("initial velocities", agent_count, Vec3::ZERO)?;
        Self::build(ctx, config, grid, &positions, &velocities)
    }

    /// A flock with explicit initial state.
    pub fn from_agents(
        ctx: &GpuContext,
        config: FlockConfig,
        positions: &[Vec3],
        velocities: &[Vec3],
    ) -> Result<Self, FlockError> {
        let grid = GridParams::from_config(&config)?;
        if positions.len() != velocities.len() {
            return Err(FlockError::invalid(format!(
                "{} positions but {} velocities",
                positions.len(),
                velocities.len()
            )));
        }
        if positions.is_empty() {
            return Err(FlockError::invalid("agent count must be at least 1"));
        }
        if positions.iter().chain(velocities).any(|v| !v.is_finite()) {
            return Err(FlockError::invalid("initial state contains non-finite values"));
        }
        Self::build(ctx, config, grid, positions, velocities)
    }

    fn build(
        ctx: &GpuContext,
        config: FlockConfig,
        grid: GridParams,
        positions: &[Vec3],
        velocities: &[Vec3],
    ) -> Result<Self, FlockError> {
        let n = positions.len();
        // Range tables hold i32 indices into the sorted array
        let padded_count = i32::try_from(n)
            .ok()
            .and_then(|n| (n as u32).checked_next_power_of_two())
            .ok_or_else(|| FlockError::invalid(format!("{n} agents exceed the GPU index range")))?;
        let num_agents = n as u32;

        let max_binding = ctx.device.limits().max_storage_buffer_binding_size as u64;
        for (buffer, len, stride) in [
            ("positions", n, VEC4_BYTES),
            ("sort keys", padded_count as usize, 4),
            ("cell range table", grid.cell_count as usize, 4),
        ] {
            if len as u64 * stride > max_binding {
                return Err(FlockError::Allocation { buffer, len });
            }
        }

        let flock = ctx.scoped(Stage::Initialization, || {
            Self::create(ctx, config, grid, positions, velocities, num_agents, padded_count)
        })?;

        info!(
            agents = n,
            padded = padded_count,
            cell_width = grid.cell_width,
            side_count = grid.side_count,
            cell_count = grid.cell_count,
            backend = "gpu",
            "flock created"
        );
        Ok(flock)
    }

    fn create(
        ctx: &GpuContext,
        config: FlockConfig,
        grid: GridParams,
        positions: &[Vec3],
        velocities: &[Vec3],
        num_agents: u32,
        padded_count: u32,
    ) -> Self {
        let device = &ctx.device;
        let n = num_agents as u64;
        let params = SimParams::new(&config, &grid, num_agents, padded_count);

        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sim Params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let position_data: Vec<Vec4> = positions.iter().map(|p| p.extend(1.0)).collect();
        let velocity_data: Vec<Vec4> = velocities.iter().map(|v| v.extend(0.0)).collect();
        let id_data: Vec<u32> = (0..num_agents).collect();
        let storage_usage =
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;

        let positions_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Positions"),
            contents: bytemuck::cast_slice(&position_data),
            usage: storage_usage,
        });
        let velocities_buffers = [
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Velocities A"),
                contents: bytemuck::cast_slice(&velocity_data),
                usage: storage_usage,
            }),
            storage_buffer(device, "Velocities B", n * VEC4_BYTES, wgpu::BufferUsages::COPY_SRC),
        ];
        let ids = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Identities"),
            contents: bytemuck::cast_slice(&id_data),
            usage: storage_usage,
        });

        let sorted_positions = storage_buffer(device, "Sorted Positions", n * VEC4_BYTES, wgpu::BufferUsages::COPY_SRC);
        let sorted_velocities = storage_buffer(device, "Sorted Velocities", n * VEC4_BYTES, wgpu::BufferUsages::COPY_SRC);
        let sorted_ids = storage_buffer(device, "Sorted Identities", n * 4, wgpu::BufferUsages::COPY_SRC);
        let snapshot_buffer = storage_buffer(device, "Snapshot", n * VEC4_BYTES, wgpu::BufferUsages::COPY_SRC);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size: n * VEC4_BYTES,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let export_params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Export Params"),
            size: std::mem::size_of::<ExportParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let spatial = SpatialGpu::new(
            device,
            &positions_buffer,
            &params_buffer,
            num_agents,
            padded_count,
            grid.cell_count,
        );

        let pipeline = |label: &str, source: String| {
            create_compute_pipeline(device, &create_shader(device, label, source), None, label)
        };
        let brute_force_pipeline = pipeline("Brute Force", brute_force_source());
        let scattered_pipeline = pipeline("Scattered", scattered_source());
        let reshuffle_pipeline = pipeline("Reshuffle", reshuffle_source());
        let coherent_pipeline = pipeline("Coherent", coherent_source());
        let integrate_pipeline = pipeline("Integrate", integrate_source());
        let export_pipeline = pipeline("Export", EXPORT_WGSL.to_string());

        let v = &velocities_buffers;
        // [c] binds velocities[c] as current and velocities[1 - c] as next.
        let brute_force_bind_groups = [0, 1].map(|c| {
            bind_buffers(
                device,
                "Brute Force Bind Group",
                &brute_force_pipeline,
                &[&positions_buffer, &v[c], &v[1 - c], &params_buffer],
            )
        });
        let scattered_bind_groups = [0, 1].map(|c| {
            bind_buffers(
                device,
                "Scattered Bind Group",
                &scattered_pipeline,
                &[
                    &positions_buffer,
                    &v[c],
                    &v[1 - c],
                    &spatial.sorted_agents,
                    &spatial.cell_start,
                    &spatial.cell_end,
                    &params_buffer,
                ],
            )
        });
        let reshuffle_bind_groups = [0, 1].map(|c| {
            bind_buffers(
                device,
                "Reshuffle Bind Group",
                &reshuffle_pipeline,
                &[
                    &positions_buffer,
                    &v[c],
                    &ids,
                    &spatial.sorted_agents,
                    &sorted_positions,
                    &sorted_velocities,
                    &sorted_ids,
                    &params_buffer,
                ],
            )
        });
        let coherent_bind_groups = [0, 1].map(|c| {
            bind_buffers(
                device,
                "Coherent Bind Group",
                &coherent_pipeline,
                &[
                    &sorted_positions,
                    &sorted_velocities,
                    &v[1 - c],
                    &spatial.cell_start,
                    &spatial.cell_end,
                    &params_buffer,
                ],
            )
        });
        let integrate_bind_groups = [0, 1].map(|c| {
            bind_buffers(
                device,
                "Integrate Bind Group",
                &integrate_pipeline,
                &[&positions_buffer, &v[1 - c], &params_buffer],
            )
        });

        Self {
            ctx: ctx.clone(),
            config,
            grid,
            params,
            num_agents,
            params_buffer,
            positions: positions_buffer,
            velocities: velocities_buffers,
            ids,
            sorted_positions,
            sorted_velocities,
            sorted_ids,
            snapshot_buffer,
            staging,
            export_params_buffer,
            spatial,
            brute_force_pipeline,
            scattered_pipeline,
            reshuffle_pipeline,
            coherent_pipeline,
            integrate_pipeline,
            export_pipeline,
            brute_force_bind_groups,
            scattered_bind_groups,
            reshuffle_bind_groups,
            coherent_bind_groups,
            integrate_bind_groups,
            current: 0,
            timer: StepTimer::new(config.timing_window),
        }
    }

    pub fn agent_count(&self) -> usize {
        self.num_agents as usize
    }

    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    pub fn grid(&self) -> &GridParams {
        &self.grid
    }

    pub fn timer(&self) -> &StepTimer {
        &self.timer
    }

    /// Advance the flock by `dt` seconds. Returns once the device has
    /// finished the step.
    pub fn step(&mut self, dt: f32, strategy: Strategy) -> Result<(), FlockError> {
        validate_dt(dt)?;
        let started = self.timer.begin();
        debug!(step = self.timer.total_steps(), %strategy, dt, "gpu step");

        self.params.dt = dt;
        let ctx = &self.ctx;
        ctx.scoped(Stage::Upload, || {
            ctx.queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&self.params));
        })?;

        let n = self.num_agents;
        let c = self.current;
        match strategy {
            Strategy::BruteForce => {
                ctx.submit_stage(Stage::Evaluation, |encoder| {
                    dispatch(
                        encoder,
                        "Brute Force",
                        &self.brute_force_pipeline,
                        &self.brute_force_bind_groups[c],
                        &[],
                        n,
                    );
                })?;
            }
            Strategy::Scattered => {
                self.encode_partition()?;
                ctx.submit_stage(Stage::Evaluation, |encoder| {
                    dispatch(
                        encoder,
                        "Scattered",
                        &self.scattered_pipeline,
                        &self.scattered_bind_groups[c],
                        &[],
                        n,
                    );
                })?;
            }
            Strategy::Coherent => {
                self.encode_partition()?;
                ctx.submit_stage(Stage::Reshuffle, |encoder| {
                    dispatch(
                        encoder,
                        "Reshuffle",
                        &self.reshuffle_pipeline,
                        &self.reshuffle_bind_groups[c],
                        &[],
                        n,
                    );
                })?;
                ctx.submit_stage(Stage::Evaluation, |encoder| {
                    dispatch(
                        encoder,
                        "Coherent",
                        &self.coherent_pipeline,
                        &self.coherent_bind_groups[c],
                        &[],
                        n,
                    );
                })?;
            }
        }

        ctx.submit_stage(Stage::Integration, |encoder| {
            if strategy == Strategy::Coherent {
                // The reordered layout becomes the slot layout.
                encoder.copy_buffer_to_buffer(&self.sorted_positions, 0, &self.positions, 0, n as u64 * VEC4_BYTES);
                encoder.copy_buffer_to_buffer(&self.sorted_ids, 0, &self.ids, 0, n as u64 * 4);
            }
            dispatch(
                encoder,
                "Integrate",
                &self.integrate_pipeline,
                &self.integrate_bind_groups[c],
                &[],
                n,
            );
        })?;
        let _ = ctx.device.poll(wgpu::Maintain::Wait);

        self.current = 1 - c;
        self.timer.end(started);
        Ok(())
    }

    fn encode_partition(&self) -> Result<(), FlockError> {
        let ctx = &self.ctx;
        ctx.submit_stage(Stage::Indexing, |encoder| self.spatial.encode_indexing(encoder))?;
        ctx.submit_stage(Stage::Sorting, |encoder| self.spatial.encode_sort(encoder))?;
        ctx.submit_stage(Stage::RangeDerivation, |encoder| self.spatial.encode_ranges(encoder))
    }

    /// Partition the current positions and read back `(sorted_agents,
    /// sorted_cells)`.
    pub fn partition(&self) -> Result<(Vec<u32>, Vec<u32>), FlockError> {
        self.encode_partition()?;
        let agents = self.read_u32s(&self.spatial.sorted_agents)?;
        let cells = self.read_u32s(&self.spatial.sorted_cells)?;
        Ok((agents, cells))
    }

    /// Write scaled `vec4` positions into a caller-owned storage buffer of
    /// at least one record per agent.
    pub fn write_positions_into(&self, scale: f32, target: &wgpu::Buffer) -> Result<(), FlockError> {
        self.export_into(&self.positions, scale, target)
    }

    /// Like [`GpuFlock::write_positions_into`], for the current velocities.
    pub fn write_velocities_into(&self, scale: f32, target: &wgpu::Buffer) -> Result<(), FlockError> {
        self.export_into(&self.velocities[self.current], scale, target)
    }

    fn export_into(&self, source: &wgpu::Buffer, scale: f32, target: &wgpu::Buffer) -> Result<(), FlockError> {
        let records = (target.size() / VEC4_BYTES) as usize;
        if records < self.agent_count() {
            return Err(FlockError::SnapshotLength {
                expected: self.agent_count(),
                actual: records,
            });
        }
        if !target.usage().contains(wgpu::BufferUsages::STORAGE) {
            return Err(FlockError::invalid("snapshot target must have STORAGE usage"));
        }

        let ctx = &self.ctx;
        let export = ExportParams {
            scale,
            count: self.num_agents,
            _pad0: 0,
            _pad1: 0,
        };
        ctx.scoped(Stage::Upload, || {
            ctx.queue.write_buffer(&self.export_params_buffer, 0, bytemuck::bytes_of(&export));
        })?;
        let bind_group = ctx.scoped(Stage::Snapshot, || {
            bind_buffers(
                &ctx.device,
                "Export Bind Group",
                &self.export_pipeline,
                &[source, target, &self.export_params_buffer],
            )
        })?;
        ctx.submit_stage(Stage::Snapshot, |encoder| {
            dispatch(encoder, "Export", &self.export_pipeline, &bind_group, &[], self.num_agents);
        })
    }

    fn read_vec4s(&self, source: &wgpu::Buffer, scale: f32) -> Result<Vec<Vec4>, FlockError> {
        self.export_into(source, scale, &self.snapshot_buffer)?;
        let n = self.agent_count();
        self.ctx.submit_stage(Stage::Readback, |encoder| {
            encoder.copy_buffer_to_buffer(&self.snapshot_buffer, 0, &self.staging, 0, n as u64 * VEC4_BYTES);
        })?;
        let words = self.ctx.read_words(&self.staging, n * 4)?;
        Ok(words
            .chunks_exact(4)
            .map(|w| {
                Vec4::new(
                    f32::from_bits(w[0]),
                    f32::from_bits(w[1]),
                    f32::from_bits(w[2]),
                    f32::from_bits(w[3]),
                )
            })
            .collect())
    }

    /// First `agent_count` words of a `u32` buffer.
    fn read_u32s(&self, source: &wgpu::Buffer) -> Result<Vec<u32>, FlockError> {
        let n = self.agent_count();
        self.ctx.submit_stage(Stage::Readback, |encoder| {
            encoder.copy_buffer_to_buffer(source, 0, &self.staging, 0, n as u64 * 4);
        })?;
        self.ctx.read_words(&self.staging, n)
    }

    /// Release every device buffer.
    pub fn shutdown(self) {
        for buffer in [
            &self.positions,
            &self.velocities[0],
            &self.velocities[1],
            &self.ids,
            &self.sorted_positions,
            &self.sorted_velocities,
            &self.sorted_ids,
            &self.snapshot_buffer,
            &self.staging,
        ] {
            buffer.destroy();
        }
        info!(agents = self.num_agents, steps = self.timer.total_steps(), "gpu flock shut down");
    }
}

impl FlockBackend for GpuFlock {
    fn agent_count(&self) -> usize {
        GpuFlock::agent_count(self)
    }

    fn step(&mut self, dt: f32, strategy: Strategy) -> Result<(), FlockError> {
        GpuFlock::step(self, dt, strategy)
    }

    fn positions_snapshot(&self, scale: f32) -> Result<Vec<Vec4>, FlockError> {
        self.read_vec4s(&self.positions, scale)
    }

    fn velocities_snapshot(&self, scale: f32) -> Result<Vec<Vec4>, FlockError> {
        self.read_vec4s(&self.velocities[self.current], scale)
    }

    fn identities(&self) -> Result<Vec<u32>, FlockError> {
        self.read_u32s(&self.ids)
    }
}

/// Shared prelude of the evaluation kernels.
fn kernel_prelude() -> String {
    format!("{SIM_PARAMS_WGSL}\n{GRID_WGSL}\n{RULES_WGSL}")
}

fn brute_force_source() -> String {
    format!(
        r#"{prelude}

@group(0) @binding(0) var<storage, read> positions: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> vel_current: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read_write> vel_next: array<vec4<f32>>;
@group(0) @binding(3) var<uniform> params: SimParams;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let idx = invocation_index(global_id, groups);
    if idx >= params.num_agents {{
        return;
    }}

    let pos = positions[idx].xyz;
    var sums = empty_sums();
    for (var other = 0u; other < params.num_agents; other += 1u) {{
        if other == idx {{
            continue;
        }}
        sums = accumulate_neighbor(sums, pos, positions[other].xyz, vel_current[other].xyz, params.distances);
    }}

    let vel = resolve_velocity(sums, pos, vel_current[idx].xyz, params.scales, params.max_speed);
    vel_next[idx] = vec4<f32>(vel, 0.0);
}}
"#,
        prelude = kernel_prelude()
    )
}

fn scattered_source() -> String {
    format!(
        r#"{prelude}

@group(0) @binding(0) var<storage, read> positions: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> vel_current: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read_write> vel_next: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read> sorted_agents: array<u32>;
@group(0) @binding(4) var<storage, read> cell_start: array<i32>;
@group(0) @binding(5) var<storage, read> cell_end: array<i32>;
@group(0) @binding(6) var<uniform> params: SimParams;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let idx = invocation_index(global_id, groups);
    if idx >= params.num_agents {{
        return;
    }}

    let pos = positions[idx].xyz;
    var sums = empty_sums();
    for (var k = 0u; k < 8u; k += 1u) {{
        let cell = neighborhood_cell(pos, k, params.grid_min, params.inv_cell_width, params.side_count);
        if cell == INVALID_CELL {{
            continue;
        }}
        let last = cell_end[cell];
        for (var s = cell_start[cell]; s <= last; s += 1) {{
            let other = sorted_agents[u32(s)];
            if other == idx {{
                continue;
            }}
            sums = accumulate_neighbor(sums, pos, positions[other].xyz, vel_current[other].xyz, params.distances);
        }}
    }}

    let vel = resolve_velocity(sums, pos, vel_current[idx].xyz, params.scales, params.max_speed);
    vel_next[idx] = vec4<f32>(vel, 0.0);
}}
"#,
        prelude = kernel_prelude()
    )
}

fn reshuffle_source() -> String {
    format!(
        r#"{SIM_PARAMS_WGSL}

@group(0) @binding(0) var<storage, read> positions: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> vel_current: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read> ids: array<u32>;
@group(0) @binding(3) var<storage, read> sorted_agents: array<u32>;
@group(0) @binding(4) var<storage, read_write> sorted_positions: array<vec4<f32>>;
@group(0) @binding(5) var<storage, read_write> sorted_velocities: array<vec4<f32>>;
@group(0) @binding(6) var<storage, read_write> sorted_ids: array<u32>;
@group(0) @binding(7) var<uniform> params: SimParams;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let idx = invocation_index(global_id, groups);
    if idx >= params.num_agents {{
        return;
    }}
    let src = sorted_agents[idx];
    sorted_positions[idx] = positions[src];
    sorted_velocities[idx] = vel_current[src];
    sorted_ids[idx] = ids[src];
}}
"#
    )
}

fn coherent_source() -> String {
    format!(
        r#"{prelude}

@group(0) @binding(0) var<storage, read> sorted_positions: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> sorted_velocities: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read_write> vel_next: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read> cell_start: array<i32>;
@group(0) @binding(4) var<storage, read> cell_end: array<i32>;
@group(0) @binding(5) var<uniform> params: SimParams;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let idx = invocation_index(global_id, groups);
    if idx >= params.num_agents {{
        return;
    }}

    let pos = sorted_positions[idx].xyz;
    var sums = empty_sums();
    for (var k = 0u; k < 8u; k += 1u) {{
        let cell = neighborhood_cell(pos, k, params.grid_min, params.inv_cell_width, params.side_count);
        if cell == INVALID_CELL {{
            continue;
        }}
        let last = cell_end[cell];
        for (var s = cell_start[cell]; s <= last; s += 1) {{
            let other = u32(s);
            if other == idx {{
                continue;
            }}
            sums = accumulate_neighbor(sums, pos, sorted_positions[other].xyz, sorted_velocities[other].xyz, params.distances);
        }}
    }}

    let vel = resolve_velocity(sums, pos, sorted_velocities[idx].xyz, params.scales, params.max_speed);
    vel_next[idx] = vec4<f32>(vel, 0.0);
}}
"#,
        prelude = kernel_prelude()
    )
}

fn integrate_source() -> String {
    format!(
        r#"{SIM_PARAMS_WGSL}

@group(0) @binding(0) var<storage, read_write> positions: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> vel_next: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> params: SimParams;

fn wrap_axis(x: f32, scale: f32) -> f32 {{
    if x < -scale {{
        return scale;
    }}
    if x > scale {{
        return -scale;
    }}
    return x;
}}

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let idx = invocation_index(global_id, groups);
    if idx >= params.num_agents {{
        return;
    }}
    let moved = positions[idx].xyz + vel_next[idx].xyz * params.dt;
    let s = params.scene_scale;
    positions[idx] = vec4<f32>(wrap_axis(moved.x, s), wrap_axis(moved.y, s), wrap_axis(moved.z, s), 1.0);
}}
"#
    )
}

const EXPORT_WGSL: &str = r#"
struct ExportParams {
    scale: f32,
    count: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read> source: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> records: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> params: ExportParams;

const WORKGROUP_SIZE: u32 = 256u;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let idx = global_id.x + global_id.y * groups.x * WORKGROUP_SIZE;
    if idx >= params.count {
        return;
    }
    records[idx] = vec4<f32>(source[idx].xyz * params.scale, 1.0);
}
"#;
