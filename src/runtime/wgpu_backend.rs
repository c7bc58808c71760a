//! Module implementing the accelerated unpooling operator on top of wgpu.
//!
//! The operator owns its device, queue, shader module and both compute
//! pipelines. They are built together by [`WgpuUnpooling::new`] and released
//! together when the operator is dropped.

use super::backend::{resolve_mask, RuntimeError, SliceLayout, UnpoolingOperator};
use bytemuck::{Pod, Zeroable};
use std::fmt;
use wgpu::util::DeviceExt;

const WORKGROUP_SIZE: u32 = 64;
const MAX_WORKGROUPS_PER_DIM: u32 = 65_535;
const NO_ADAPTER: &str = "no compatible wgpu adapter";

const UNPOOL_SHADER: &str = r#"
struct Dims {
    num_slices: u32,
    input_volume: u32,
    output_volume: u32,
    row_pitch: u32,
}

@group(0) @binding(0) var<storage, read> src: array<f32>;
@group(0) @binding(1) var<storage, read> mask: array<u32>;
@group(0) @binding(2) var<storage, read_write> dst: array<f32>;
@group(0) @binding(3) var<uniform> dims: Dims;

// One invocation per slice, walking the slice in row-major order.
@compute @workgroup_size(64)
fn scatter(@builtin(global_invocation_id) id: vec3<u32>) {
    let slice = id.x + id.y * dims.row_pitch;
    if (slice >= dims.num_slices) { return; }
    let src_base = slice * dims.input_volume;
    let dst_base = slice * dims.output_volume;
    for (var i = 0u; i < dims.input_volume; i = i + 1u) {
        dst[dst_base + mask[src_base + i]] = src[src_base + i];
    }
}

// One invocation per bottom element.
@compute @workgroup_size(64)
fn gather(@builtin(global_invocation_id) id: vec3<u32>) {
    let index = id.x + id.y * dims.row_pitch;
    if (index >= dims.num_slices * dims.input_volume) { return; }
    let slice = index / dims.input_volume;
    dst[index] = src[slice * dims.output_volume + mask[index]];
}
"#;

/// Uniform block shared by both entry points.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Dims {
    num_slices: u32,
    input_volume: u32,
    output_volume: u32,
    row_pitch: u32,
}

/// Workgroup grid covering `threads` invocations, folding into the y axis
/// once the x axis limit is reached.
pub fn workgroup_grid(threads: u32) -> [u32; 3] {
    let groups = threads.div_ceil(WORKGROUP_SIZE).max(1);
    if groups <= MAX_WORKGROUPS_PER_DIM {
        [groups, 1, 1]
    } else {
        let rows = groups.div_ceil(MAX_WORKGROUPS_PER_DIM);
        [MAX_WORKGROUPS_PER_DIM, rows, 1]
    }
}

/// Accelerated operator: WGSL scatter/gather kernels.
pub struct WgpuUnpooling {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    bind_group_layout: wgpu::BindGroupLayout,
    scatter: wgpu::ComputePipeline,
    gather: wgpu::ComputePipeline,
}

impl fmt::Debug for WgpuUnpooling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuUnpooling")
            .field("adapter", &self.adapter_name)
            .finish_non_exhaustive()
    }
}

impl WgpuUnpooling {
    /// Returns true when a wgpu adapter can be acquired on this machine.
    pub async fn adapter_available() -> bool {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .is_some()
    }

    /// Acquires an adapter and device, then builds the pipelines.
    ///
    /// Nothing is returned unless every step succeeds; resources created
    /// before a failing step are dropped on the error path.
    pub async fn new() -> Result<Self, RuntimeError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| RuntimeError::AcceleratorUnavailable(NO_ADAPTER.into()))?;
        let info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default(), None)
            .await
            .map_err(|e| RuntimeError::DeviceError(e.to_string()))?;

        let operator = Self::build(device, queue, info.name).await?;
        log::info!(
            "wgpu unpooling ready on '{}' ({:?})",
            operator.adapter_name,
            info.backend
        );
        Ok(operator)
    }

    async fn build(
        device: wgpu::Device,
        queue: wgpu::Queue,
        adapter_name: String,
    ) -> Result<Self, RuntimeError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("unpool_shader"),
            source: wgpu::ShaderSource::Wgsl(UNPOOL_SHADER.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("unpool_bind_group_layout"),
            entries: &[
                storage(0, true),
                storage(1, true),
                storage(2, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("unpool_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = |entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let scatter = pipeline("scatter");
        let gather = pipeline("gather");

        if let Some(error) = device.pop_error_scope().await {
            return Err(RuntimeError::DeviceError(format!("pipeline creation failed: {error}")));
        }

        Ok(Self {
            device,
            queue,
            adapter_name,
            bind_group_layout,
            scatter,
            gather,
        })
    }

    /// Rejects layouts the 32-bit shader addressing or the device's binding
    /// limits cannot express.
    fn check_limits(&self, layout: &SliceLayout) -> Result<(), RuntimeError> {
        let largest = layout.input_len().max(layout.output_len());
        let max_binding = self.device.limits().max_storage_buffer_binding_size as usize;
        if largest > u32::MAX as usize || largest * std::mem::size_of::<f32>() > max_binding {
            return Err(RuntimeError::DeviceError(format!(
                "{largest} elements exceed the device storage binding limit of {max_binding} bytes"
            )));
        }
        Ok(())
    }

    fn mask_indices(layout: &SliceLayout, mask: &[f32]) -> Result<Vec<u32>, RuntimeError> {
        // `check_limits` has bounded every index by u32::MAX.
        Ok(resolve_mask(layout, mask)?
            .into_iter()
            .map(|index| index as u32)
            .collect())
    }

    /// Uploads `src` and `mask`, runs `pipeline` over `threads` invocations and
    /// reads back a zero-initialised destination of `dst_len` elements.
    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        layout: &SliceLayout,
        threads: u32,
        src: &[f32],
        mask: &[u32],
        dst_len: usize,
    ) -> Result<Vec<f32>, RuntimeError> {
        let grid = workgroup_grid(threads);
        let dims = Dims {
            num_slices: layout.num_slices as u32,
            input_volume: layout.input_volume as u32,
            output_volume: layout.output_volume as u32,
            row_pitch: grid[0] * WORKGROUP_SIZE,
        };
        let dst_size = (dst_len * std::mem::size_of::<f32>()) as u64;
        let device = &self.device;

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let src_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("unpool_src"),
            contents: bytemuck::cast_slice(src),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let mask_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("unpool_mask"),
            contents: bytemuck::cast_slice(mask),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let dims_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("unpool_dims"),
            contents: bytemuck::bytes_of(&dims),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let dst_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("unpool_dst"),
            size: dst_size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("unpool_staging"),
            size: dst_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("unpool_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: src_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: mask_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: dst_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: dims_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("unpool_encoder"),
        });
        encoder.clear_buffer(&dst_buffer, 0, None);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("unpool_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(grid[0], grid[1], grid[2]);
        }
        encoder.copy_buffer_to_buffer(&dst_buffer, 0, &staging_buffer, 0, dst_size);
        self.queue.submit(Some(encoder.finish()));

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(RuntimeError::DeviceError(error.to_string()));
        }

        let slice = staging_buffer.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);
        pollster::block_on(receiver.receive())
            .ok_or_else(|| RuntimeError::DeviceError("readback channel closed".to_string()))?
            .map_err(|e| RuntimeError::DeviceError(e.to_string()))?;

        let data = slice.get_mapped_range();
        let result = bytemuck::cast_slice::<u8, f32>(&data).to_vec();
        drop(data);
        staging_buffer.unmap();
        Ok(result)
    }
}

impl UnpoolingOperator for WgpuUnpooling {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn forward(
        &self,
        layout: &SliceLayout,
        input: &[f32],
        mask: &[f32],
        output: &mut [f32],
    ) -> Result<(), RuntimeError> {
        layout.check_len("input", input.len(), layout.input_len())?;
        layout.check_len("output", output.len(), layout.output_len())?;
        if layout.num_slices == 0 {
            return Ok(());
        }
        self.check_limits(layout)?;
        let indices = Self::mask_indices(layout, mask)?;

        let result = self.dispatch(
            &self.scatter,
            layout,
            layout.num_slices as u32,
            input,
            &indices,
            layout.output_len(),
        )?;
        output.copy_from_slice(&result);
        Ok(())
    }

    fn backward(
        &self,
        layout: &SliceLayout,
        top_diff: &[f32],
        mask: &[f32],
        bottom_diff: &mut [f32],
    ) -> Result<(), RuntimeError> {
        layout.check_len("top_diff", top_diff.len(), layout.output_len())?;
        layout.check_len("bottom_diff", bottom_diff.len(), layout.input_len())?;
        if layout.num_slices == 0 {
            return Ok(());
        }
        self.check_limits(layout)?;
        let indices = Self::mask_indices(layout, mask)?;

        let result = self.dispatch(
            &self.gather,
            layout,
            layout.input_len() as u32,
            top_diff,
            &indices,
            layout.input_len(),
        )?;
        bottom_diff.copy_from_slice(&result);
        Ok(())
    }
}

impl Drop for WgpuUnpooling {
    fn drop(&mut self) {
        log::debug!("releasing wgpu unpooling on '{}'", self.adapter_name);
    }
}
