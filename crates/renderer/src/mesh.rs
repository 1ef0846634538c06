//! Unit cube geometry kept resident for draw callbacks.

use std::sync::Arc;

use glam::Vec3;

use frameflow_rhi::buffer::BufferUsage;
use frameflow_rhi::device::Device;

use crate::arena::GrowableBuffer;
use crate::error::RenderResult;

/// Corners of a cube spanning `[-0.5, 0.5]` on every axis.
pub const CUBE_VERTICES: [Vec3; 8] = [
    Vec3::new(-0.5, -0.5, -0.5),
    Vec3::new(0.5, -0.5, -0.5),
    Vec3::new(0.5, 0.5, -0.5),
    Vec3::new(-0.5, 0.5, -0.5),
    Vec3::new(-0.5, -0.5, 0.5),
    Vec3::new(0.5, -0.5, 0.5),
    Vec3::new(0.5, 0.5, 0.5),
    Vec3::new(-0.5, 0.5, 0.5),
];

/// Two counter-clockwise triangles per face, seen from outside.
pub const CUBE_INDICES: [u16; 36] = [
    4, 5, 6, 6, 7, 4, // +z
    1, 0, 3, 3, 2, 1, // -z
    5, 1, 2, 2, 6, 5, // +x
    0, 4, 7, 7, 3, 0, // -x
    7, 6, 2, 2, 3, 7, // +y
    0, 1, 5, 5, 4, 0, // -y
];

/// Vertex and index buffers of the cube.
pub struct CubeMesh {
    pub(crate) vertices: GrowableBuffer<Vec3>,
    pub(crate) indices: GrowableBuffer<u16>,
}

impl CubeMesh {
    /// Creates empty buffers; the renderer uploads the cube through the
    /// deferred queue.
    pub fn new(device: Arc<Device>) -> RenderResult<Self> {
        Ok(Self {
            vertices: GrowableBuffer::new(device.clone(), BufferUsage::Vertex)?,
            indices: GrowableBuffer::new(device, BufferUsage::Index)?,
        })
    }

    pub fn vertex_buffer(&self) -> ash::vk::Buffer {
        self.vertices.handle()
    }

    pub fn index_buffer(&self) -> ash::vk::Buffer {
        self.indices.handle()
    }

    pub fn index_count(&self) -> u32 {
        CUBE_INDICES.len() as u32
    }
}
