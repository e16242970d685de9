//! Mesh data structures, generation and upload

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::backend::{
    BackendResult, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, IndexFormat,
    PrimitiveTopology, VertexAttribute, VertexBufferLayout, VertexFormat, VertexStepMode,
};

/// Standard vertex with position, normal and base color
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 4],
}

impl Vertex {
    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Vertex,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x3,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Float32x4,
                    offset: 24,
                },
            ],
        }
    }
}

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    /// Calculate triangle count
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Get vertex data as bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Get index data as bytes
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        Self::cube_with_color([1.0, 1.0, 1.0, 1.0])
    }

    /// Unit cube with every vertex set to `color`
    pub fn cube_with_color(color: [f32; 4]) -> Self {
        let mut mesh = Mesh::new("cube");

        let faces = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (-Vec3::Z, -Vec3::X, Vec3::Y),
            (Vec3::X, -Vec3::Z, Vec3::Y),
            (-Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, -Vec3::Z),
            (-Vec3::Y, Vec3::X, Vec3::Z),
        ];

        for (normal, right, up) in faces {
            let base = mesh.vertices.len() as u32;
            let center = normal * 0.5;
            for (u, v) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
                let position = center + right * u + up * v;
                mesh.vertices.push(Vertex {
                    position: position.to_array(),
                    normal: normal.to_array(),
                    color,
                });
            }
            // Two counter-clockwise triangles per face
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// Upload vertex and index data
    pub fn upload(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<MeshBuffers> {
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} vertices", self.name)),
                size: self.vertex_bytes().len() as u64,
                usage: BufferUsage::VERTEX,
            },
            self.vertex_bytes(),
        )?;

        let (index_buffer, count) = if self.indices.is_empty() {
            (None, self.vertices.len() as u32)
        } else {
            let buffer = backend.create_buffer_init(
                &BufferDescriptor {
                    label: Some(format!("{} indices", self.name)),
                    size: self.index_bytes().len() as u64,
                    usage: BufferUsage::INDEX,
                },
                self.index_bytes(),
            )?;
            (
                Some((buffer, IndexFormat::Uint32)),
                self.indices.len() as u32,
            )
        };

        log::debug!(
            "Uploaded mesh '{}' ({} vertices, {} triangles)",
            self.name,
            self.vertices.len(),
            self.triangle_count()
        );

        Ok(MeshBuffers {
            vertex_buffer,
            index_buffer,
            topology: PrimitiveTopology::TriangleList,
            count,
        })
    }
}

/// GPU-resident base mesh of a geometry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBuffers {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: Option<(BufferHandle, IndexFormat)>,
    pub topology: PrimitiveTopology,
    /// Index count when indexed, vertex count otherwise
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    #[test]
    fn test_cube() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert_eq!(cube.triangle_count(), 12);
        assert_eq!(std::mem::size_of::<Vertex>(), 40);
    }

    #[test]
    fn test_cube_faces_wind_outward() {
        let cube = Mesh::cube();
        for tri in cube.indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(cube.vertices[i as usize].position));
            let normal = Vec3::from(cube.vertices[tri[0] as usize].normal);
            assert!((b - a).cross(c - a).dot(normal) > 0.0);
        }
    }

    #[test]
    fn test_upload() {
        let mut backend = SoftwareBackend::new(1, 1);
        let buffers = Mesh::cube().upload(&mut backend).unwrap();
        assert_eq!(buffers.count, 36);
        assert!(buffers.index_buffer.is_some());
    }
}
