//! Geometry packing
//!
//! Flattens an ordered list of (mesh, world transform) pairs into one
//! contiguous per-corner vertex stream tagged with a model id, plus a
//! parallel per-model transform table. Packing is the expensive, front-loaded
//! part of the pipeline; callers re-pack only when geometry changes, not on
//! every check.

use bytemuck::{Pod, Zeroable};
use cgmath::Matrix4;
use wgpu::util::DeviceExt;

use crate::error::{VisibilityError, VisibilityResult};

/// Triangle mesh in model space.
#[derive(Debug, Clone)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    /// Triangle index list; length must be a multiple of 3.
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }
}

/// One mesh plus its already-resolved world transform.
#[derive(Debug, Clone)]
pub struct MeshInstance {
    pub mesh: MeshData,
    pub world_from_local: Matrix4<f32>,
}

/// One triangle-corner occurrence in the packed stream.
///
/// Field order mirrors the WGSL struct `{ position: vec3f, model_id: u32,
/// normal: vec3f, pad: u32 }` so the storage-buffer layout matches on both
/// sides. Records `3k`, `3k+1`, `3k+2` are triangle `k`'s corners.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PackedVertex {
    pub position: [f32; 3],
    pub model_id: u32,
    pub normal: [f32; 3],
    pub _pad: u32,
}

/// CPU-side packing output.
#[derive(Debug, Clone)]
pub struct PackedGeometry {
    pub vertices: Vec<PackedVertex>,
    pub transforms: Vec<[[f32; 4]; 4]>,
}

impl PackedGeometry {
    pub fn triangle_count(&self) -> u32 {
        (self.vertices.len() / 3) as u32
    }
}

/// GPU-resident packed buffers, sized exactly to the element counts.
pub struct GeometryBuffers {
    pub vertex_buffer: wgpu::Buffer,
    pub transform_buffer: wgpu::Buffer,
    pub triangle_count: u32,
}

/// Flatten mesh instances into the packed vertex stream and transform table.
///
/// Pure function of its input; fails without producing anything when given
/// zero meshes, zero triangles, or an index that exceeds its mesh's vertex
/// arrays. The record count invariant holds on success: vertices.len() is a
/// multiple of 3 and equals the summed index-list length of all meshes.
pub fn pack_meshes(instances: &[MeshInstance]) -> VisibilityResult<PackedGeometry> {
    if instances.is_empty() {
        return Err(VisibilityError::EmptyMeshSet);
    }

    let corner_count: usize = instances.iter().map(|i| i.mesh.indices.len()).sum();
    if corner_count == 0 {
        return Err(VisibilityError::EmptyMeshSet);
    }

    let mut vertices = Vec::with_capacity(corner_count);
    let mut transforms = Vec::with_capacity(instances.len());

    for (model_id, instance) in instances.iter().enumerate() {
        let mesh = &instance.mesh;
        let vertex_count = mesh.positions.len().min(mesh.normals.len());

        for &index in &mesh.indices {
            if index as usize >= vertex_count {
                return Err(VisibilityError::MalformedMesh {
                    mesh: model_id,
                    index,
                    vertex_count,
                });
            }

            vertices.push(PackedVertex {
                position: mesh.positions[index as usize],
                model_id: model_id as u32,
                normal: mesh.normals[index as usize],
                _pad: 0,
            });
        }

        transforms.push(instance.world_from_local.into());
    }

    log::debug!(
        "[pack_meshes] packed {} meshes into {} triangles",
        instances.len(),
        vertices.len() / 3
    );

    Ok(PackedGeometry {
        vertices,
        transforms,
    })
}

/// Upload packed geometry into storage buffers sized exactly to the data.
pub fn upload_geometry(device: &wgpu::Device, packed: &PackedGeometry) -> GeometryBuffers {
    let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("Packed Vertex Buffer"),
        contents: bytemuck::cast_slice(&packed.vertices),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
    });

    let transform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("Model Transform Buffer"),
        contents: bytemuck::cast_slice(&packed.transforms),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
    });

    GeometryBuffers {
        vertex_buffer,
        transform_buffer,
        triangle_count: packed.triangle_count(),
    }
}
