//! Visibility compute stage
//!
//! Three embarrassingly parallel kernels turn the rasterized ID image into a
//! compact visible-triangle list: clean-visibility, accumulate-visibility and
//! compact-visible. Each kernel runs in its own compute pass inside one
//! command encoder; wgpu's storage-buffer hazard tracking orders the passes
//! on the device, so accumulate always completes before compact consumes the
//! bitset.

use bytemuck::{Pod, Zeroable};

/// Uniform parameters shared by all three kernels
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct Params {
    triangle_count: u32,
    image_width: u32,
    image_height: u32,
    _pad: u32,
}

/// Per-pack scratch buffers consumed by the kernels.
pub struct CheckBuffers {
    /// One u32 flag per triangle.
    pub bitset: wgpu::Buffer,
    /// Dense visible-index list, capacity = triangle count, zero-filled
    /// before each check.
    pub visible: wgpu::Buffer,
    /// Atomic append counter.
    pub counter: wgpu::Buffer,
    pub triangle_count: u32,
}

/// Compute pipelines for the visibility extraction pass.
pub struct VisibilityCompute {
    clean_pipeline: wgpu::ComputePipeline,
    accumulate_pipeline: wgpu::ComputePipeline,
    compact_pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
}

impl VisibilityCompute {
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Visibility Compute Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("visibility.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Visibility Compute Bind Group Layout"),
            entries: &[
                // ID image
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                // Visibility bitset
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Visible-index list
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Append counter
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Params
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
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
            label: Some("Visibility Compute Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let clean_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Clean Visibility Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "clean_visibility",
        });

        let accumulate_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Accumulate Visibility Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "accumulate_visibility",
        });

        let compact_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Compact Visible Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "compact_visible",
        });

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visibility Params Buffer"),
            size: std::mem::size_of::<Params>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            clean_pipeline,
            accumulate_pipeline,
            compact_pipeline,
            bind_group_layout,
            params_buffer,
        }
    }

    /// Allocate the per-pack scratch buffers, sized to the triangle count.
    pub fn alloc_buffers(&self, device: &wgpu::Device, triangle_count: u32) -> CheckBuffers {
        let slot_bytes = (triangle_count as u64) * 4;

        let bitset = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visibility Bitset Buffer"),
            size: slot_bytes,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let visible = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visible Triangle Buffer"),
            size: slot_bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let counter = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visible Count Buffer"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        CheckBuffers {
            bitset,
            visible,
            counter,
            triangle_count,
        }
    }

    /// Rewrite the kernel params. Called on every repack.
    pub fn update_params(&self, queue: &wgpu::Queue, triangle_count: u32, resolution: u32) {
        let params = Params {
            triangle_count,
            image_width: resolution,
            image_height: resolution,
            _pad: 0,
        };
        queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&params));
    }

    /// Create the bind group tying the ID image to the scratch buffers.
    pub fn create_bind_group(
        &self,
        device: &wgpu::Device,
        id_view: &wgpu::TextureView,
        buffers: &CheckBuffers,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Visibility Compute Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(id_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.bitset.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.visible.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.counter.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: self.params_buffer.as_entire_binding(),
                },
            ],
        })
    }

    /// Record the full extraction: clean (when the bitset may be stale),
    /// accumulate, then compact. Pass order is mandatory; compact consumes
    /// the bitset accumulate produces.
    pub fn encode_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        triangle_count: u32,
        resolution: u32,
        clean_bitset: bool,
    ) {
        let image_groups = (resolution + 7) / 8;

        if clean_bitset {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Clean Visibility Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.clean_pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(image_groups, image_groups, 1);
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Accumulate Visibility Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.accumulate_pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(image_groups, image_groups, 1);
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Compact Visible Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.compact_pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups((triangle_count + 63) / 64, 1, 1);
        }
    }
}
