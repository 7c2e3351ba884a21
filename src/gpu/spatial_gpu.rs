//! GPU grid partitioning
//!
//! Handles cell id computation, bitonic key/value sort, and the cell range
//! table.

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use super::{bind_buffers, create_compute_pipeline, create_shader, dispatch, storage_buffer, SIM_PARAMS_WGSL};
use crate::spatial::GRID_WGSL;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct BitonicParams {
    /// Size of the bitonic sequences being merged.
    k: u32,
    /// Compare distance within the merge.
    j: u32,
    count: u32,
    _pad: u32,
}

/// `(k, j)` of every bitonic pass for `count` (a power of two) keys.
fn bitonic_passes(count: u32) -> Vec<(u32, u32)> {
    let mut passes = Vec::new();
    let mut k = 2;
    while k <= count {
        let mut j = k / 2;
        while j > 0 {
            passes.push((k, j));
            j /= 2;
        }
        k *= 2;
    }
    passes
}

/// GPU resources for grid partitioning
pub(crate) struct SpatialGpu {
    /// Cell id per entry, sorted ascending after [`SpatialGpu::encode_sort`].
    pub sorted_cells: wgpu::Buffer,
    /// Agent slot per entry, permuted together with `sorted_cells`.
    pub sorted_agents: wgpu::Buffer,
    pub cell_start: wgpu::Buffer,
    pub cell_end: wgpu::Buffer,

    compute_indices_pipeline: wgpu::ComputePipeline,
    bitonic_pipeline: wgpu::ComputePipeline,
    reset_ranges_pipeline: wgpu::ComputePipeline,
    identify_ranges_pipeline: wgpu::ComputePipeline,

    compute_indices_bind_group: wgpu::BindGroup,
    bitonic_bind_group: wgpu::BindGroup,
    reset_ranges_bind_group: wgpu::BindGroup,
    identify_ranges_bind_group: wgpu::BindGroup,

    /// Per-pass bitonic parameters, `sort_params_stride` bytes apart.
    _sort_params_buffer: wgpu::Buffer,
    sort_params_stride: u32,
    sort_passes: u32,

    num_agents: u32,
    padded_count: u32,
    cell_count: u32,
}

impl SpatialGpu {
    pub fn new(
        device: &wgpu::Device,
        positions: &wgpu::Buffer,
        params: &wgpu::Buffer,
        num_agents: u32,
        padded_count: u32,
        cell_count: u32,
    ) -> Self {
        let key_bytes = padded_count as u64 * 4;
        let sorted_cells = storage_buffer(device, "Sorted Cells", key_bytes, wgpu::BufferUsages::COPY_SRC);
        let sorted_agents = storage_buffer(device, "Sorted Agents", key_bytes, wgpu::BufferUsages::COPY_SRC);

        let table_bytes = cell_count as u64 * 4;
        let cell_start = storage_buffer(device, "Cell Start", table_bytes, wgpu::BufferUsages::COPY_SRC);
        let cell_end = storage_buffer(device, "Cell End", table_bytes, wgpu::BufferUsages::COPY_SRC);

        // One uniform slot per pass so the whole sort records into one
        // encoder with dynamic offsets.
        let alignment = device.limits().min_uniform_buffer_offset_alignment;
        let sort_params_stride = (std::mem::size_of::<BitonicParams>() as u32).next_multiple_of(alignment);
        let passes = bitonic_passes(padded_count);
        let mut sort_params_bytes = vec![0u8; passes.len().max(1) * sort_params_stride as usize];
        for (i, &(k, j)) in passes.iter().enumerate() {
            let p = BitonicParams { k, j, count: padded_count, _pad: 0 };
            let at = i * sort_params_stride as usize;
            sort_params_bytes[at..at + std::mem::size_of::<BitonicParams>()]
                .copy_from_slice(bytemuck::bytes_of(&p));
        }
        let sort_params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Bitonic Params"),
            contents: &sort_params_bytes,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let compute_indices_pipeline = create_compute_pipeline(
            device,
            &create_shader(device, "Compute Indices Shader", compute_indices_source()),
            None,
            "Compute Indices Pipeline",
        );

        let bitonic_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Bitonic Layout"),
            entries: &[
                storage_entry(0),
                storage_entry(1),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<BitonicParams>() as u64),
                    },
                    count: None,
                },
            ],
        });
        let bitonic_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Bitonic Pipeline Layout"),
            bind_group_layouts: &[&bitonic_layout],
            push_constant_ranges: &[],
        });
        let bitonic_pipeline = create_compute_pipeline(
            device,
            &create_shader(device, "Bitonic Shader", BITONIC_WGSL.to_string()),
            Some(&bitonic_pipeline_layout),
            "Bitonic Pipeline",
        );

        let reset_ranges_pipeline = create_compute_pipeline(
            device,
            &create_shader(device, "Reset Ranges Shader", reset_ranges_source()),
            None,
            "Reset Ranges Pipeline",
        );
        let identify_ranges_pipeline = create_compute_pipeline(
            device,
            &create_shader(device, "Identify Ranges Shader", identify_ranges_source()),
            None,
            "Identify Ranges Pipeline",
        );

        let compute_indices_bind_group = bind_buffers(
            device,
            "Compute Indices Bind Group",
            &compute_indices_pipeline,
            &[positions, &sorted_cells, &sorted_agents, params],
        );
        let bitonic_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Bitonic Bind Group"),
            layout: &bitonic_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: sorted_cells.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: sorted_agents.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &sort_params_buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(std::mem::size_of::<BitonicParams>() as u64),
                    }),
                },
            ],
        });
        let reset_ranges_bind_group = bind_buffers(
            device,
            "Reset Ranges Bind Group",
            &reset_ranges_pipeline,
            &[&cell_start, &cell_end, params],
        );
        let identify_ranges_bind_group = bind_buffers(
            device,
            "Identify Ranges Bind Group",
            &identify_ranges_pipeline,
            &[&sorted_cells, &cell_start, &cell_end, params],
        );

        Self {
            sorted_cells,
            sorted_agents,
            cell_start,
            cell_end,
            compute_indices_pipeline,
            bitonic_pipeline,
            reset_ranges_pipeline,
            identify_ranges_pipeline,
            compute_indices_bind_group,
            bitonic_bind_group,
            reset_ranges_bind_group,
            identify_ranges_bind_group,
            _sort_params_buffer: sort_params_buffer,
            sort_params_stride,
            sort_passes: passes.len() as u32,
            num_agents,
            padded_count,
            cell_count,
        }
    }

    /// Cell id and slot for every agent; padding entries get the invalid id.
    pub fn encode_indexing(&self, encoder: &mut wgpu::CommandEncoder) {
        dispatch(
            encoder,
            "Compute Indices",
            &self.compute_indices_pipeline,
            &self.compute_indices_bind_group,
            &[],
            self.padded_count,
        );
    }

    /// Sort `(cell, agent)` pairs by cell, ties by agent.
    pub fn encode_sort(&self, encoder: &mut wgpu::CommandEncoder) {
        for pass_idx in 0..self.sort_passes {
            dispatch(
                encoder,
                "Bitonic Step",
                &self.bitonic_pipeline,
                &self.bitonic_bind_group,
                &[pass_idx * self.sort_params_stride],
                self.padded_count,
            );
        }
    }

    /// Clear the range table, then mark every occupied cell's first and last
    /// sorted position.
    pub fn encode_ranges(&self, encoder: &mut wgpu::CommandEncoder) {
        dispatch(
            encoder,
            "Reset Ranges",
            &self.reset_ranges_pipeline,
            &self.reset_ranges_bind_group,
            &[],
            self.cell_count,
        );
        dispatch(
            encoder,
            "Identify Ranges",
            &self.identify_ranges_pipeline,
            &self.identify_ranges_bind_group,
            &[],
            self.num_agents,
        );
    }
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn compute_indices_source() -> String {
    format!(
        r#"{SIM_PARAMS_WGSL}
{GRID_WGSL}

@group(0) @binding(0) var<storage, read> positions: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> cell_ids: array<u32>;
@group(0) @binding(2) var<storage, read_write> agent_ids: array<u32>;
@group(0) @binding(3) var<uniform> params: SimParams;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let idx = invocation_index(global_id, groups);
    if idx >= params.padded_count {{
        return;
    }}

    agent_ids[idx] = idx;
    if idx < params.num_agents {{
        let pos = positions[idx].xyz;
        cell_ids[idx] = cell_of(pos, params.grid_min, params.inv_cell_width, params.side_count);
    }} else {{
        cell_ids[idx] = INVALID_CELL;
    }}
}}
"#
    )
}

const BITONIC_WGSL: &str = r#"
struct BitonicParams {
    k: u32,
    j: u32,
    count: u32,
    _pad: u32,
}

@group(0) @binding(0) var<storage, read_write> keys: array<u32>;
@group(0) @binding(1) var<storage, read_write> vals: array<u32>;
@group(0) @binding(2) var<uniform> params: BitonicParams;

const WORKGROUP_SIZE: u32 = 256u;

// Strict ordering by key, then value
fn precedes(ka: u32, va: u32, kb: u32, vb: u32) -> bool {
    return ka < kb || (ka == kb && va < vb);
}

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let idx = global_id.x + global_id.y * groups.x * WORKGROUP_SIZE;
    if idx >= params.count {
        return;
    }
    let partner = idx ^ params.j;
    if partner <= idx {
        return;
    }

    let key_a = keys[idx];
    let val_a = vals[idx];
    let key_b = keys[partner];
    let val_b = vals[partner];

    let ascending = (idx & params.k) == 0u;
    let out_of_order = select(
        precedes(key_a, val_a, key_b, val_b),
        precedes(key_b, val_b, key_a, val_a),
        ascending,
    );
    if out_of_order {
        keys[idx] = key_b;
        vals[idx] = val_b;
        keys[partner] = key_a;
        vals[partner] = val_a;
    }
}
"#;

fn reset_ranges_source() -> String {
    format!(
        r#"{SIM_PARAMS_WGSL}

@group(0) @binding(0) var<storage, read_write> cell_start: array<i32>;
@group(0) @binding(1) var<storage, read_write> cell_end: array<i32>;
@group(0) @binding(2) var<uniform> params: SimParams;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let idx = invocation_index(global_id, groups);
    if idx >= params.cell_count {{
        return;
    }}
    cell_start[idx] = -1;
    cell_end[idx] = -2;
}}
"#
    )
}

fn identify_ranges_source() -> String {
    format!(
        r#"{SIM_PARAMS_WGSL}

@group(0) @binding(0) var<storage, read> sorted_cells: array<u32>;
@group(0) @binding(1) var<storage, read_write> cell_start: array<i32>;
@group(0) @binding(2) var<storage, read_write> cell_end: array<i32>;
@group(0) @binding(3) var<uniform> params: SimParams;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let idx = invocation_index(global_id, groups);
    let n = params.num_agents;
    if idx >= n {{
        return;
    }}

    let cell = sorted_cells[idx];
    if cell >= params.cell_count {{
        return;
    }}
    if idx == 0u || sorted_cells[idx - 1u] != cell {{
        cell_start[cell] = i32(idx);
    }}
    if idx == n - 1u || sorted_cells[idx + 1u] != cell {{
        cell_end[cell] = i32(idx);
    }}
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::tests::validate_wgsl;

    #[test]
    fn test_bitonic_pass_schedule() {
        assert!(bitonic_passes(1).is_empty());
        assert_eq!(bitonic_passes(2), vec![(2, 1)]);
        assert_eq!(bitonic_passes(8).len(), 6);
        assert_eq!(bitonic_passes(1 << 10).len(), 55);
    }

    #[test]
    fn test_bitonic_schedule_sorts_on_host() {
        // Run the kernel's compare-exchange on the host to check the schedule.
        let mut keys = vec![7u32, 3, u32::MAX, 3, 0, 9, 1, u32::MAX];
        let mut vals: Vec<u32> = (0..8).collect();
        for (k, j) in bitonic_passes(8) {
            for idx in 0..8usize {
                let partner = idx ^ j as usize;
                if partner <= idx {
                    continue;
                }
                let precedes = |ka: u32, va: u32, kb: u32, vb: u32| ka < kb || (ka == kb && va < vb);
                let ascending = (idx & k as usize) == 0;
                let swap = if ascending {
                    precedes(keys[partner], vals[partner], keys[idx], vals[idx])
                } else {
                    precedes(keys[idx], vals[idx], keys[partner], vals[partner])
                };
                if swap {
                    keys.swap(idx, partner);
                    vals.swap(idx, partner);
                }
            }
        }
        assert_eq!(keys, vec![0, 1, 3, 3, 7, 9, u32::MAX, u32::MAX]);
        assert_eq!(vals, vec![4, 6, 1, 3, 0, 5, 2, 7]);
    }

    #[test]
    fn test_compute_indices_wgsl() {
        validate_wgsl(&compute_indices_source()).unwrap();
    }

    #[test]
    fn test_bitonic_wgsl() {
        validate_wgsl(BITONIC_WGSL).unwrap();
    }

    #[test]
    fn test_range_kernels_wgsl() {
        validate_wgsl(&reset_ranges_source()).unwrap();
        validate_wgsl(&identify_ranges_source()).unwrap();
    }
}
