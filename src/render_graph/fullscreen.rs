//! Full-screen triangle used by screen-space passes

use crate::backend::{
    BackendResult, BufferDescriptor, BufferUsage, GraphicsBackend, PrimitiveTopology,
    VertexArrayDescriptor, VertexArrayHandle, VertexAttribute, VertexBufferBinding,
    VertexBufferLayout, VertexFormat, VertexStepMode,
};

/// One oversized triangle covering the whole viewport
const VERTICES: [[f32; 2]; 3] = [[-1.0, -1.0], [3.0, -1.0], [-1.0, 3.0]];

/// Vertex array holding [`VERTICES`] at location 0
#[derive(Debug, Clone, Copy)]
pub struct FullscreenTriangle {
    vertex_array: VertexArrayHandle,
}

impl FullscreenTriangle {
    pub fn create(backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        let data: &[u8] = bytemuck::cast_slice(&VERTICES);
        let buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Fullscreen Triangle".to_string()),
                size: data.len() as u64,
                usage: BufferUsage::VERTEX,
            },
            data,
        )?;
        let vertex_array = backend.create_vertex_array(&VertexArrayDescriptor {
            label: Some("Fullscreen Triangle".to_string()),
            buffers: vec![VertexBufferBinding {
                buffer,
                layout: VertexBufferLayout {
                    array_stride: 8,
                    step_mode: VertexStepMode::Vertex,
                    attributes: vec![VertexAttribute {
                        location: 0,
                        format: VertexFormat::Float32x2,
                        offset: 0,
                    }],
                },
            }],
            index_buffer: None,
        })?;
        Ok(Self { vertex_array })
    }

    pub fn draw(&self, backend: &mut dyn GraphicsBackend) {
        backend.bind_vertex_array(Some(self.vertex_array));
        backend.draw(PrimitiveTopology::TriangleList, 0..3, 1);
    }
}

/// WGSL vertex stage shared by full-screen programs
pub const FULLSCREEN_VERTEX: &str = r#"
struct FullscreenOutput {
    @builtin(position) position: vec4<f32>,
}

@vertex
fn vs_main(@location(0) corner: vec2<f32>) -> FullscreenOutput {
    var out: FullscreenOutput;
    out.position = vec4<f32>(corner, 0.0, 1.0);
    return out;
}
"#;
