//! Point light pass
//!
//! Each light is a camera-facing quad spanning its radius, instanced once per
//! light from a vertex buffer and blended additively so overlapping lights
//! sum. Fragments outside the radius or over empty G-buffer texels are
//! discarded.

use std::any::Any;

use glam::Vec2;

use crate::backend::*;
use crate::render_graph::{CameraConsumer, DirtyRegister, JitterConsumer, PassCore, RenderPass};
use crate::scene::{CameraMatrices, PointLight, PointLightData};

use super::{light_defines, LightBlock, LightDirty, VariantKey};

const SAMPLERS: &[&str] = &["u_position", "u_normal"];

/// Billboard corners, drawn as a triangle strip
const QUAD: [[f32; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]];

fn light_layout() -> VertexBufferLayout {
    VertexBufferLayout {
        array_stride: std::mem::size_of::<PointLightData>() as u64,
        step_mode: VertexStepMode::Instance,
        attributes: vec![
            VertexAttribute {
                location: 1,
                format: VertexFormat::Float32x4,
                offset: 0,
            },
            VertexAttribute {
                location: 2,
                format: VertexFormat::Float32x4,
                offset: 16,
            },
        ],
    }
}

/// Additive point light pass
pub struct PointLightPass {
    core: PassCore,
    dirty: DirtyRegister<LightDirty>,
    block: LightBlock<PointLightData>,
    data: Vec<PointLightData>,
    textures: [Option<TextureHandle>; 2],
    camera: CameraMatrices,
    ndc_offset: Vec2,
    quad: Option<BufferHandle>,
    vertex_array: Option<VertexArrayHandle>,
    variant: Option<VariantKey>,
}

impl PointLightPass {
    pub fn new() -> Self {
        Self {
            core: PassCore::default(),
            dirty: DirtyRegister::new(),
            block: LightBlock::new("Point Lights", BufferUsage::VERTEX),
            data: Vec::new(),
            textures: [None; 2],
            camera: CameraMatrices::default(),
            ndc_offset: Vec2::ZERO,
            quad: None,
            vertex_array: None,
            variant: None,
        }
    }

    pub fn program_descriptor(count: usize) -> ProgramDescriptor {
        ProgramDescriptor {
            label: "Point Light".to_string(),
            kind: ProgramKind::PointLight,
            source: POINT_LIGHT_SHADER.to_string(),
            defines: light_defines(count),
            uniforms: vec![
                UniformDecl::new("u_position", UniformType::Sampler),
                UniformDecl::new("u_normal", UniformType::Sampler),
                UniformDecl::new("u_viewProjection", UniformType::Mat4),
                UniformDecl::new("u_viewInverse", UniformType::Mat4),
                UniformDecl::new("u_ndcOffset", UniformType::Vec2),
            ],
            uniform_block: false,
        }
    }

    /// Replace the lights. A different count recompiles at the next `prepare()`.
    pub fn set_lights(&mut self, lights: &[PointLight]) {
        self.data = lights.iter().map(PointLight::to_gpu_data).collect();
        if self.variant.map(|v| v.count) != Some(self.data.len()) {
            self.dirty.set(LightDirty::PROGRAM);
        } else {
            // Back to the compiled count, so an earlier request is void
            self.dirty.unset(LightDirty::PROGRAM);
            self.dirty.set(LightDirty::DATA);
        }
    }

    /// World position and world normal G-buffer textures
    pub fn set_textures(&mut self, position: Option<TextureHandle>, normal: Option<TextureHandle>) {
        let textures = [position, normal];
        if self.textures != textures {
            self.textures = textures;
            self.dirty.set(LightDirty::TEXTURES);
        }
    }

    /// Write raw records into the instance buffer without recompiling.
    /// Rejected when the length differs from the compiled count.
    pub fn upload(&mut self, backend: &mut dyn GraphicsBackend, data: &[PointLightData]) -> bool {
        self.block.upload(backend, data)
    }

    pub fn light_count(&self) -> usize {
        self.data.len()
    }

    pub fn variant(&self) -> Option<VariantKey> {
        self.variant
    }

    fn rebuild_vertex_array(&mut self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        if let Some(old) = self.vertex_array.take() {
            backend.destroy_vertex_array(old);
        }
        let quad = match self.quad {
            Some(quad) => quad,
            None => {
                let data: &[u8] = bytemuck::cast_slice(&QUAD);
                let quad = backend.create_buffer_init(
                    &BufferDescriptor {
                        label: Some("Point Light Quad".to_string()),
                        size: data.len() as u64,
                        usage: BufferUsage::VERTEX,
                    },
                    data,
                )?;
                self.quad = Some(quad);
                quad
            }
        };
        let Some(lights) = self.block.buffer() else {
            return Err(BackendError::InvalidHandle("point light buffer".to_string()));
        };
        self.vertex_array = Some(backend.create_vertex_array(&VertexArrayDescriptor {
            label: Some("Point Lights".to_string()),
            buffers: vec![
                VertexBufferBinding {
                    buffer: quad,
                    layout: VertexBufferLayout {
                        array_stride: 8,
                        step_mode: VertexStepMode::Vertex,
                        attributes: vec![VertexAttribute {
                            location: 0,
                            format: VertexFormat::Float32x2,
                            offset: 0,
                        }],
                    },
                },
                VertexBufferBinding {
                    buffer: lights,
                    layout: light_layout(),
                },
            ],
            index_buffer: None,
        })?);
        Ok(())
    }

    fn recompile(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        let count = self.data.len();
        self.variant = Some(VariantKey {
            kind: ProgramKind::PointLight,
            count,
        });
        if !self.core.compile(backend, &Self::program_descriptor(count)) {
            return false;
        }
        let allocated = self
            .block
            .allocate(backend, count)
            .and_then(|_| self.rebuild_vertex_array(backend));
        if let Err(e) = allocated {
            log::error!("Point Light: failed to allocate light buffer: {}", e);
            return false;
        }
        self.core.bind_units(backend, SAMPLERS);
        // Camera state lives in the program, so a fresh one needs it again
        self.dirty.set(
            LightDirty::VIEW_PROJECTION | LightDirty::VIEW_INVERSE | LightDirty::NDC_OFFSET,
        );
        log::debug!("Point Light: compiled for {} lights", count);
        true
    }

    fn upload_uniforms(&mut self, backend: &mut dyn GraphicsBackend) {
        let Some(program) = self.core.program else {
            return;
        };
        if self.dirty.get(LightDirty::UNITS) {
            self.core.bind_units(backend, SAMPLERS);
        }
        if self.dirty.get(LightDirty::VIEW_PROJECTION) {
            backend.set_uniform(program, "u_viewProjection", self.camera.view_projection.into());
        }
        if self.dirty.get(LightDirty::VIEW_INVERSE) {
            backend.set_uniform(program, "u_viewInverse", self.camera.view_inverse.into());
        }
        if self.dirty.get(LightDirty::NDC_OFFSET) {
            backend.set_uniform(program, "u_ndcOffset", self.ndc_offset.into());
        }
    }
}

impl Default for PointLightPass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for PointLightPass {
    fn name(&self) -> &str {
        "Point Light"
    }

    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        let compiled = self.recompile(backend);
        self.dirty.set_all();
        self.dirty.unset(LightDirty::PROGRAM);
        compiled
    }

    fn prepare(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if self.dirty.get(LightDirty::PROGRAM) {
            if self.recompile(backend) {
                self.block.upload(backend, &self.data);
            }
        } else if self.dirty.get(LightDirty::DATA) {
            self.block.upload(backend, &self.data);
        }
        self.upload_uniforms(backend);
        self.dirty.consume()
    }

    fn core(&self) -> &PassCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PassCore {
        &mut self.core
    }

    fn setup(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if self.vertex_array.is_none() || !self.core.bind(backend) {
            // The merge pass still reads the target, so leave no stale light in it
            if let Some(target) = self.core.target {
                backend.bind_framebuffer(target);
                backend.clear(Some([0.0; 4]), None);
            }
            return false;
        }
        backend.set_blend(Some(BlendState::additive()));
        PassCore::bind_textures(backend, &self.textures);
        true
    }

    fn draw_body(&mut self, backend: &mut dyn GraphicsBackend) {
        let count = self.block.count().unwrap_or(0) as u32;
        if count == 0 {
            return;
        }
        backend.bind_vertex_array(self.vertex_array);
        backend.draw(PrimitiveTopology::TriangleStrip, 0..4, count);
    }

    fn teardown(&mut self, backend: &mut dyn GraphicsBackend) {
        backend.set_blend(None);
        backend.bind_vertex_array(None);
    }

    fn as_camera_consumer(&mut self) -> Option<&mut dyn CameraConsumer> {
        Some(self)
    }

    fn as_jitter_consumer(&mut self) -> Option<&mut dyn JitterConsumer> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl CameraConsumer for PointLightPass {
    fn set_camera(&mut self, camera: &CameraMatrices) {
        if camera.view_projection != self.camera.view_projection {
            self.dirty.set(LightDirty::VIEW_PROJECTION);
        }
        if camera.view_inverse != self.camera.view_inverse {
            self.dirty.set(LightDirty::VIEW_INVERSE);
        }
        self.camera = *camera;
    }
}

impl JitterConsumer for PointLightPass {
    fn set_ndc_offset(&mut self, offset: Vec2) {
        if offset != self.ndc_offset {
            self.ndc_offset = offset;
            self.dirty.set(LightDirty::NDC_OFFSET);
        }
    }
}

/// Point light program
pub const POINT_LIGHT_SHADER: &str = r#"
const DATA_SIZE: u32 = 1u;
const ENABLED: bool = true;

struct Uniforms {
    u_viewProjection: mat4x4<f32>,
    u_viewInverse: mat4x4<f32>,
    u_ndcOffset: vec2<f32>,
}

@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(1) @binding(0) var u_position: texture_2d<f32>;
@group(1) @binding(1) var u_normal: texture_2d<f32>;

struct VertexInput {
    @location(0) corner: vec2<f32>,
    // xyz = position, w = radius
    @location(1) light: vec4<f32>,
    // rgb = color, a = intensity
    @location(2) color: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) light: vec4<f32>,
    @location(1) color: vec4<f32>,
}

fn safe_normalize(v: vec3<f32>) -> vec3<f32> {
    let len = length(v);
    if (len > 0.0) {
        return v / len;
    }
    return vec3<f32>(0.0);
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    let right = uniforms.u_viewInverse[0].xyz;
    let up = uniforms.u_viewInverse[1].xyz;
    let world = input.light.xyz + (right * input.corner.x + up * input.corner.y) * input.light.w;

    var clip = uniforms.u_viewProjection * vec4<f32>(world, 1.0);
    clip = vec4<f32>(clip.xy + uniforms.u_ndcOffset * clip.w, clip.zw);

    var out: VertexOutput;
    out.clip_position = clip;
    out.light = input.light;
    out.color = input.color;
    return out;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    if (!ENABLED) {
        discard;
    }
    let pixel = vec2<i32>(input.clip_position.xy);
    let position = textureLoad(u_position, pixel, 0);
    if (position.a <= 0.0) {
        discard;
    }
    let to_light = input.light.xyz - position.xyz;
    let dist = length(to_light);
    if (dist >= input.light.w) {
        discard;
    }
    let normal = safe_normalize(textureLoad(u_normal, pixel, 0).xyz);
    var direction = normal;
    if (dist > 0.0) {
        direction = to_light / dist;
    }
    let falloff = 1.0 - dist / input.light.w;
    let diffuse = max(dot(normal, direction), 0.0);
    return vec4<f32>(input.color.rgb * input.color.a * falloff * falloff * diffuse, 1.0);
}
"#;
