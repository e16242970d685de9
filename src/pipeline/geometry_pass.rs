//! Geometry pass
//!
//! Rasterizes every geometry entry into the G-buffer:
//! - 0: albedo (base color after the color mode is applied)
//! - 1: world-space position, alpha 1 where covered
//! - 2: world-space normal
//! - 3: view-space position
//! - 4: view-space normal
//!
//! Uniform uploads between draw calls are the bottleneck here, so the pass
//! remembers the last `u_instanced`, `u_colorMode` and `u_model` it bound and
//! skips uploads that would not change anything.

use std::any::Any;

use glam::{Mat4, Vec2};

use crate::backend::*;
use crate::render_graph::{CameraConsumer, DirtyRegister, JitterConsumer, PassCore, RenderPass};
use crate::resources::{InstanceBuffer, InstanceData, Vertex};
use crate::scene::{CameraMatrices, ColorMode, Geometry};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GeometryDirty: u32 {
        const VIEW = 1 << 0;
        const PROJECTION = 1 << 1;
        const NDC_OFFSET = 1 << 2;
        const GEOMETRY = 1 << 3;
    }
}

/// A geometry entry plus its lazily created vertex array
#[derive(Debug)]
struct Entry {
    geometry: Geometry,
    vertex_array: Option<VertexArrayHandle>,
}

/// Per-draw uniforms as last uploaded
#[derive(Debug, Default, Clone, Copy)]
struct BoundState {
    instanced: Option<bool>,
    color_mode: Option<ColorMode>,
    model: Option<Mat4>,
}

/// Deferred geometry pass
pub struct GeometryPass {
    core: PassCore,
    dirty: DirtyRegister<GeometryDirty>,
    camera: CameraMatrices,
    ndc_offset: Vec2,
    entries: Vec<Entry>,
    /// Identity transform and white color, bound for non-instanced entries
    default_instance: Option<InstanceBuffer>,
    bound: BoundState,
}

impl GeometryPass {
    pub fn new() -> Self {
        Self {
            core: PassCore::default(),
            dirty: DirtyRegister::new(),
            camera: CameraMatrices::default(),
            ndc_offset: Vec2::ZERO,
            entries: Vec::new(),
            default_instance: None,
            bound: BoundState::default(),
        }
    }

    pub fn program_descriptor() -> ProgramDescriptor {
        ProgramDescriptor {
            label: "Geometry".to_string(),
            kind: ProgramKind::Geometry,
            source: GEOMETRY_SHADER.to_string(),
            defines: Vec::new(),
            uniforms: vec![
                UniformDecl::new("u_model", UniformType::Mat4),
                UniformDecl::new("u_view", UniformType::Mat4),
                UniformDecl::new("u_projection", UniformType::Mat4),
                UniformDecl::new("u_ndcOffset", UniformType::Vec2),
                UniformDecl::new("u_instanced", UniformType::Int),
                UniformDecl::new("u_colorMode", UniformType::Int),
            ],
            uniform_block: false,
        }
    }

    /// Replace the drawn geometry. Cached vertex arrays are released.
    pub fn set_geometry(&mut self, backend: &mut dyn GraphicsBackend, geometry: &[Geometry]) {
        for entry in self.entries.drain(..) {
            if let Some(vertex_array) = entry.vertex_array {
                backend.destroy_vertex_array(vertex_array);
            }
        }
        self.entries = geometry
            .iter()
            .map(|geometry| Entry {
                geometry: *geometry,
                vertex_array: None,
            })
            .collect();
        self.dirty.set(GeometryDirty::GEOMETRY);
        log::debug!("GeometryPass: {} geometry entries", self.entries.len());
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn ndc_offset(&self) -> Vec2 {
        self.ndc_offset
    }

    fn vertex_array(
        backend: &mut dyn GraphicsBackend,
        geometry: &Geometry,
        default_instance: InstanceBuffer,
    ) -> BackendResult<VertexArrayHandle> {
        let instances = geometry.instances.unwrap_or(default_instance);
        backend.create_vertex_array(&VertexArrayDescriptor {
            label: Some("Geometry".to_string()),
            buffers: vec![
                VertexBufferBinding {
                    buffer: geometry.mesh.vertex_buffer,
                    layout: Vertex::layout(),
                },
                VertexBufferBinding {
                    buffer: instances.buffer,
                    layout: InstanceData::layout(),
                },
            ],
            index_buffer: geometry.mesh.index_buffer,
        })
    }

    fn draw_entry(&mut self, backend: &mut dyn GraphicsBackend, program: ProgramHandle, index: usize) {
        let Some(default_instance) = self.default_instance else {
            return;
        };
        let entry = &mut self.entries[index];
        let vertex_array = match entry.vertex_array {
            Some(vertex_array) => vertex_array,
            None => match Self::vertex_array(backend, &entry.geometry, default_instance) {
                Ok(vertex_array) => {
                    entry.vertex_array = Some(vertex_array);
                    vertex_array
                }
                Err(e) => {
                    log::warn!("GeometryPass: skipping entry {}: {}", index, e);
                    return;
                }
            },
        };
        let geometry = entry.geometry;
        backend.bind_vertex_array(Some(vertex_array));

        let instanced = geometry.is_instanced();
        if self.bound.instanced != Some(instanced) {
            backend.set_uniform(program, "u_instanced", UniformValue::Int(instanced as i32));
            self.bound.instanced = Some(instanced);
        }

        let color_mode = geometry.effective_color_mode();
        if self.bound.color_mode != Some(color_mode) {
            backend.set_uniform(program, "u_colorMode", UniformValue::Int(color_mode.as_uniform()));
            self.bound.color_mode = Some(color_mode);
        }

        let model = geometry.model_matrix();
        if self.bound.model != Some(model) {
            backend.set_uniform(program, "u_model", model.into());
            self.bound.model = Some(model);
        }

        let mesh = geometry.mesh;
        let instances = geometry.instance_count();
        if instances == 0 {
            return;
        }
        if mesh.index_buffer.is_some() {
            backend.draw_indexed(mesh.topology, 0..mesh.count, instances);
        } else {
            backend.draw(mesh.topology, 0..mesh.count, instances);
        }
    }
}

impl Default for GeometryPass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for GeometryPass {
    fn name(&self) -> &str {
        "Geometry Pass"
    }

    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if self.default_instance.is_none() {
            match InstanceBuffer::upload(backend, &[InstanceData::default()]) {
                Ok(buffer) => self.default_instance = Some(buffer),
                Err(e) => {
                    log::error!("GeometryPass: failed to create default instance: {}", e);
                    return false;
                }
            }
        }
        let compiled = self.core.compile(backend, &Self::program_descriptor());
        self.bound = BoundState::default();
        self.dirty.set_all();
        compiled
    }

    fn prepare(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if let Some(program) = self.core.program {
            if self.dirty.get(GeometryDirty::VIEW) {
                backend.set_uniform(program, "u_view", self.camera.view.into());
            }
            if self.dirty.get(GeometryDirty::PROJECTION) {
                backend.set_uniform(program, "u_projection", self.camera.projection.into());
            }
            if self.dirty.get(GeometryDirty::NDC_OFFSET) {
                backend.set_uniform(program, "u_ndcOffset", self.ndc_offset.into());
            }
        }
        self.dirty.consume()
    }

    fn core(&self) -> &PassCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PassCore {
        &mut self.core
    }

    fn setup(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if !self.core.bind(backend) {
            return false;
        }
        backend.set_blend(None);
        backend.set_depth_test(true);
        true
    }

    fn draw_body(&mut self, backend: &mut dyn GraphicsBackend) {
        let Some(program) = self.core.program else {
            return;
        };
        for index in 0..self.entries.len() {
            self.draw_entry(backend, program, index);
        }
        log::trace!("GeometryPass: drew {} entries", self.entries.len());
    }

    fn teardown(&mut self, backend: &mut dyn GraphicsBackend) {
        backend.set_depth_test(false);
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

impl CameraConsumer for GeometryPass {
    fn set_camera(&mut self, camera: &CameraMatrices) {
        if camera.view != self.camera.view {
            self.dirty.set(GeometryDirty::VIEW);
        }
        if camera.projection != self.camera.projection {
            self.dirty.set(GeometryDirty::PROJECTION);
        }
        self.camera = *camera;
    }
}

impl JitterConsumer for GeometryPass {
    fn set_ndc_offset(&mut self, offset: Vec2) {
        if offset != self.ndc_offset {
            self.ndc_offset = offset;
            self.dirty.set(GeometryDirty::NDC_OFFSET);
        }
    }
}

/// G-buffer program
pub const GEOMETRY_SHADER: &str = r#"
struct Uniforms {
    u_model: mat4x4<f32>,
    u_view: mat4x4<f32>,
    u_projection: mat4x4<f32>,
    u_ndcOffset: vec2<f32>,
    u_instanced: i32,
    u_colorMode: i32,
}

@group(0) @binding(0) var<uniform> uniforms: Uniforms;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) color: vec4<f32>,
    @location(3) model_0: vec4<f32>,
    @location(4) model_1: vec4<f32>,
    @location(5) model_2: vec4<f32>,
    @location(6) model_3: vec4<f32>,
    @location(7) instance_color: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec4<f32>,
    @location(1) world_normal: vec3<f32>,
    @location(2) view_position: vec4<f32>,
    @location(3) view_normal: vec3<f32>,
    @location(4) color: vec4<f32>,
}

struct GBufferOutput {
    @location(0) albedo: vec4<f32>,
    @location(1) world_position: vec4<f32>,
    @location(2) world_normal: vec4<f32>,
    @location(3) view_position: vec4<f32>,
    @location(4) view_normal: vec4<f32>,
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
    var instance_matrix = mat4x4<f32>(
        vec4<f32>(1.0, 0.0, 0.0, 0.0),
        vec4<f32>(0.0, 1.0, 0.0, 0.0),
        vec4<f32>(0.0, 0.0, 1.0, 0.0),
        vec4<f32>(0.0, 0.0, 0.0, 1.0),
    );
    if (uniforms.u_instanced != 0) {
        instance_matrix = mat4x4<f32>(input.model_0, input.model_1, input.model_2, input.model_3);
    }
    let model = uniforms.u_model * instance_matrix;

    let world = model * vec4<f32>(input.position, 1.0);
    let world_normal = safe_normalize((model * vec4<f32>(input.normal, 0.0)).xyz);
    let view_position = uniforms.u_view * world;
    let view_normal = safe_normalize((uniforms.u_view * vec4<f32>(world_normal, 0.0)).xyz);

    var clip = uniforms.u_projection * view_position;
    clip = vec4<f32>(clip.xy + uniforms.u_ndcOffset * clip.w, clip.zw);

    var color = input.color;
    switch uniforms.u_colorMode {
        case 1: {
            color = input.instance_color;
        }
        case 2: {
            color = input.color + input.instance_color;
        }
        case 3: {
            color = input.color * input.instance_color;
        }
        default: {}
    }

    var out: VertexOutput;
    out.clip_position = clip;
    out.world_position = world;
    out.world_normal = world_normal;
    out.view_position = view_position;
    out.view_normal = view_normal;
    out.color = color;
    return out;
}

@fragment
fn fs_main(input: VertexOutput) -> GBufferOutput {
    var out: GBufferOutput;
    out.albedo = input.color;
    out.world_position = vec4<f32>(input.world_position.xyz, 1.0);
    out.world_normal = vec4<f32>(safe_normalize(input.world_normal), 1.0);
    out.view_position = vec4<f32>(input.view_position.xyz, 1.0);
    out.view_normal = vec4<f32>(safe_normalize(input.view_normal), 1.0);
    return out;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::resources::Mesh;

    fn target(backend: &mut SoftwareBackend) -> crate::resources::Framebuffer {
        crate::resources::Framebuffer::new(
            backend,
            "Geometry",
            &crate::renderer::GEOMETRY_ATTACHMENTS,
            Some(TextureFormat::Depth32Float),
            (8, 8),
        )
        .unwrap()
    }

    #[test]
    fn test_initialize_marks_everything_dirty() {
        let mut backend = SoftwareBackend::new(8, 8);
        let mut pass = GeometryPass::new();
        assert!(pass.initialize(&mut backend));
        assert!(pass.prepare(&mut backend));
        assert!(!pass.prepare(&mut backend));
        assert_eq!(backend.stats().uniform_uploads("u_view"), 1);
        assert_eq!(backend.stats().uniform_uploads("u_projection"), 1);
    }

    #[test]
    fn test_identical_models_upload_once() {
        let mut backend = SoftwareBackend::new(8, 8);
        let fb = target(&mut backend);
        let mesh = Mesh::cube().upload(&mut backend).unwrap();
        let model = Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -3.0));
        let entry = Geometry::new(mesh).with_model(model);

        let mut pass = GeometryPass::new();
        assert!(pass.initialize(&mut backend));
        pass.set_target(fb.handle(), fb.size());
        pass.set_geometry(&mut backend, &[entry, entry]);
        pass.prepare(&mut backend);

        backend.reset_stats();
        pass.draw(&mut backend);
        assert_eq!(backend.stats().uniform_uploads("u_model"), 1);
        assert_eq!(backend.stats().uniform_uploads("u_instanced"), 1);
        assert_eq!(backend.stats().uniform_uploads("u_colorMode"), 1);
        assert_eq!(backend.stats().draw_calls, 2);

        // State survives into the next frame
        backend.reset_stats();
        pass.draw(&mut backend);
        assert_eq!(backend.stats().uniform_uploads("u_model"), 0);
    }

    #[test]
    fn test_model_change_is_uploaded() {
        let mut backend = SoftwareBackend::new(8, 8);
        let fb = target(&mut backend);
        let mesh = Mesh::cube().upload(&mut backend).unwrap();
        let a = Geometry::new(mesh);
        let b = Geometry::new(mesh).with_model(Mat4::from_scale(glam::Vec3::splat(2.0)));

        let mut pass = GeometryPass::new();
        pass.initialize(&mut backend);
        pass.set_target(fb.handle(), fb.size());
        pass.set_geometry(&mut backend, &[a, b, a]);
        backend.reset_stats();
        pass.draw(&mut backend);
        assert_eq!(backend.stats().uniform_uploads("u_model"), 3);
    }

    #[test]
    fn test_jitter_only_dirties_on_change() {
        let mut backend = SoftwareBackend::new(8, 8);
        let mut pass = GeometryPass::new();
        pass.initialize(&mut backend);
        pass.prepare(&mut backend);

        pass.set_ndc_offset(Vec2::ZERO);
        assert!(!pass.prepare(&mut backend));
        pass.set_ndc_offset(Vec2::new(0.01, -0.01));
        assert!(pass.prepare(&mut backend));
        assert_eq!(pass.ndc_offset(), Vec2::new(0.01, -0.01));
    }

    #[test]
    fn test_compile_failure_leaves_pass_inert() {
        let mut backend = SoftwareBackend::new(8, 8);
        backend.fail_compilation(ProgramKind::Geometry);
        let mut pass = GeometryPass::new();
        assert!(!pass.initialize(&mut backend));
        assert!(!pass.is_ready());
        pass.set_target(FramebufferHandle::CANVAS, (8, 8));
        pass.draw(&mut backend);
        assert_eq!(backend.stats().draw_calls, 0);
    }
}
