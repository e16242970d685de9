//! Per-instance transforms and colors

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::{
    BackendResult, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend,
    VertexAttribute, VertexBufferLayout, VertexFormat, VertexStepMode,
};

/// First shader location used by instance attributes
pub const INSTANCE_LOCATION: u32 = 3;

/// Per-instance transform (locations 3..=6) and color (location 7)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub model: [[f32; 4]; 4],
    pub color: [f32; 4],
}

impl Default for InstanceData {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Vec4::ONE)
    }
}

impl InstanceData {
    pub fn new(model: Mat4, color: Vec4) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            color: color.to_array(),
        }
    }

    pub fn layout() -> VertexBufferLayout {
        let column = |i: u32| VertexAttribute {
            location: INSTANCE_LOCATION + i,
            format: VertexFormat::Float32x4,
            offset: 16 * i as u64,
        };
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Instance,
            attributes: vec![column(0), column(1), column(2), column(3), column(4)],
        }
    }
}

/// Uploaded instance data with its instance count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceBuffer {
    pub buffer: BufferHandle,
    pub count: u32,
    capacity: u32,
}

impl InstanceBuffer {
    pub fn upload(
        backend: &mut dyn GraphicsBackend,
        instances: &[InstanceData],
    ) -> BackendResult<Self> {
        let data: &[u8] = bytemuck::cast_slice(instances);
        let buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Instances".to_string()),
                size: data.len().max(std::mem::size_of::<InstanceData>()) as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
            },
            data,
        )?;
        Ok(Self {
            buffer,
            count: instances.len() as u32,
            capacity: instances.len().max(1) as u32,
        })
    }

    /// Overwrite the instance data in place, within the original capacity
    pub fn update(&mut self, backend: &mut dyn GraphicsBackend, instances: &[InstanceData]) -> bool {
        if instances.len() as u32 > self.capacity {
            log::warn!(
                "Instance update of {} exceeds buffer capacity {}",
                instances.len(),
                self.capacity
            );
            return false;
        }
        backend.write_buffer(self.buffer, 0, bytemuck::cast_slice(instances));
        self.count = instances.len() as u32;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_covers_matrix_and_color() {
        let layout = InstanceData::layout();
        assert_eq!(layout.array_stride, 80);
        let locations: Vec<u32> = layout.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![3, 4, 5, 6, 7]);
        assert_eq!(layout.attributes[4].offset, 64);
    }
}
