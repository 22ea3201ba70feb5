//! Triangle-ID rasterizer
//!
//! Draws all packed triangles through the offscreen camera into a
//! fixed-resolution color target, encoding each triangle's linear index as an
//! RGBA color. Drawing is sliced across submissions so a large scene does not
//! monopolize a single frame: slice `i` covers global triangle indices
//! `[i * slice, (i + 1) * slice)`, with the vertex-ID offset riding the draw
//! call's `first_vertex` range. The target is cleared to the background
//! sentinel only on the first slice of a run; later slices accumulate.

pub mod encoding;

pub use encoding::{decode_triangle_id, encode_triangle_id, NO_TRIANGLE};

use bytemuck::{Pod, Zeroable};

use crate::camera::OffscreenCamera;
use crate::geometry::GeometryBuffers;

/// Color target format for the ID image.
pub const ID_IMAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Depth format paired with the ID image so nearer triangles win.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Camera uniform for the ID vertex stage
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct RasterCamera {
    view_proj: [[f32; 4]; 4],
}

/// Offscreen ID rasterization pipeline and its render targets.
pub struct IdRasterizer {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    camera_buffer: wgpu::Buffer,
    id_texture: wgpu::Texture,
    id_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    resolution: u32,
}

impl IdRasterizer {
    pub fn new(device: &wgpu::Device, resolution: u32) -> Self {
        // Clamp to what the adapter can actually allocate
        let max_dimension = device.limits().max_texture_dimension_2d;
        let resolution = resolution.max(1);
        let clamped = resolution.min(max_dimension);
        if clamped != resolution {
            log::warn!(
                "[IdRasterizer::new] ID image resolution clamped from {} to {} due to GPU limits",
                resolution,
                clamped
            );
        }
        let resolution = clamped;

        let id_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Triangle ID Image"),
            size: wgpu::Extent3d {
                width: resolution,
                height: resolution,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: ID_IMAGE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let id_view = id_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let depth_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Triangle ID Depth"),
            size: wgpu::Extent3d {
                width: resolution,
                height: resolution,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let depth_view = depth_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let camera_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ID Camera Uniform Buffer"),
            size: std::mem::size_of::<RasterCamera>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Triangle ID Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("triangle_id.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ID Raster Bind Group Layout"),
            entries: &[
                // Camera
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Packed vertices
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Model transforms
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("ID Raster Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Triangle ID Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: ID_IMAGE_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                // Visibility must not depend on winding
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        Self {
            pipeline,
            bind_group_layout,
            camera_buffer,
            id_texture,
            id_view,
            depth_view,
            resolution,
        }
    }

    /// Create the per-geometry bind group. Rebuilt on every repack.
    pub fn create_bind_group(
        &self,
        device: &wgpu::Device,
        geometry: &GeometryBuffers,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ID Raster Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.camera_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: geometry.vertex_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: geometry.transform_buffer.as_entire_binding(),
                },
            ],
        })
    }

    /// Upload the camera's view-projection matrix.
    pub fn update_camera(&self, queue: &wgpu::Queue, camera: &OffscreenCamera) {
        let view_proj = camera.build_projection_matrix() * camera.build_view_matrix();
        let uniform = RasterCamera {
            view_proj: view_proj.into(),
        };
        queue.write_buffer(&self.camera_buffer, 0, bytemuck::bytes_of(&uniform));
    }

    /// Record one slice of the frame-sliced draw.
    ///
    /// The first slice clears color to the background sentinel (opaque white,
    /// the encoding of 0xFFFFFFFF) and depth to 1.0; later slices load both
    /// and accumulate into the same image.
    pub fn encode_slice(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        first_triangle: u32,
        triangle_count: u32,
        first_slice: bool,
    ) {
        let (color_load, depth_load) = if first_slice {
            (
                wgpu::LoadOp::Clear(wgpu::Color {
                    r: 1.0,
                    g: 1.0,
                    b: 1.0,
                    a: 1.0,
                }),
                wgpu::LoadOp::Clear(1.0),
            )
        } else {
            (wgpu::LoadOp::Load, wgpu::LoadOp::Load)
        };

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Triangle ID Slice Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.id_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: color_load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);

        let first_vertex = first_triangle * 3;
        let vertex_count = triangle_count * 3;
        pass.draw(first_vertex..first_vertex + vertex_count, 0..1);
    }

    /// View of the ID image for the compute stage.
    pub fn id_view(&self) -> &wgpu::TextureView {
        &self.id_view
    }

    pub fn id_texture(&self) -> &wgpu::Texture {
        &self.id_texture
    }

    /// Actual (possibly clamped) target resolution.
    pub fn resolution(&self) -> u32 {
        self.resolution
    }
}
