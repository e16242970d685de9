//! Ambient and directional light passes
//!
//! Both draw one full-screen triangle that reads the G-buffer and a uniform
//! block of lights, replacing the contents of their own attachment.

use std::any::Any;

use bytemuck::Pod;

use crate::backend::*;
use crate::render_graph::{DirtyRegister, FullscreenTriangle, PassCore, RenderPass, FULLSCREEN_VERTEX};
use crate::scene::{AmbientLight, AmbientLightData, DirectionalLight, DirectionalLightData};

use super::{light_defines, LightBlock, LightDirty, VariantKey};

/// A light type shaded by a full-screen program
pub trait LightKind: 'static {
    type Light;
    type Data: Pod + std::fmt::Debug;

    const NAME: &'static str;
    const PROGRAM: ProgramKind;
    const FRAGMENT: &'static str;
    /// Sampler uniforms, bound to units in order
    const SAMPLERS: &'static [&'static str];

    fn data(light: &Self::Light) -> Self::Data;
}

#[derive(Debug, Clone, Copy)]
pub struct Ambient;

impl LightKind for Ambient {
    type Light = AmbientLight;
    type Data = AmbientLightData;

    const NAME: &'static str = "Ambient Light";
    const PROGRAM: ProgramKind = ProgramKind::AmbientLight;
    const FRAGMENT: &'static str = AMBIENT_LIGHT_SHADER;
    const SAMPLERS: &'static [&'static str] = &["u_position"];

    fn data(light: &AmbientLight) -> AmbientLightData {
        light.to_gpu_data()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Directional;

impl LightKind for Directional {
    type Light = DirectionalLight;
    type Data = DirectionalLightData;

    const NAME: &'static str = "Directional Light";
    const PROGRAM: ProgramKind = ProgramKind::DirectionalLight;
    const FRAGMENT: &'static str = DIRECTIONAL_LIGHT_SHADER;
    const SAMPLERS: &'static [&'static str] = &["u_position", "u_normal"];

    fn data(light: &DirectionalLight) -> DirectionalLightData {
        light.to_gpu_data()
    }
}

pub type AmbientLightPass = FullscreenLightPass<Ambient>;
pub type DirectionalLightPass = FullscreenLightPass<Directional>;

/// Full-screen light pass over a uniform block of `K::Data`
pub struct FullscreenLightPass<K: LightKind> {
    core: PassCore,
    dirty: DirtyRegister<LightDirty>,
    block: LightBlock<K::Data>,
    data: Vec<K::Data>,
    textures: Vec<Option<TextureHandle>>,
    triangle: Option<FullscreenTriangle>,
    variant: Option<VariantKey>,
}

impl<K: LightKind> FullscreenLightPass<K> {
    pub fn new() -> Self {
        Self {
            core: PassCore::default(),
            dirty: DirtyRegister::new(),
            block: LightBlock::new(K::NAME, BufferUsage::UNIFORM),
            data: Vec::new(),
            textures: vec![None; K::SAMPLERS.len()],
            triangle: None,
            variant: None,
        }
    }

    pub fn program_descriptor(count: usize) -> ProgramDescriptor {
        ProgramDescriptor {
            label: K::NAME.to_string(),
            kind: K::PROGRAM,
            source: format!("{}{}", FULLSCREEN_VERTEX, K::FRAGMENT),
            defines: light_defines(count),
            uniforms: K::SAMPLERS
                .iter()
                .map(|name| UniformDecl::new(name, UniformType::Sampler))
                .collect(),
            uniform_block: true,
        }
    }

    /// Replace the lights. A different count recompiles at the next `prepare()`.
    pub fn set_lights(&mut self, lights: &[K::Light]) {
        self.data = lights.iter().map(K::data).collect();
        if self.variant.map(|v| v.count) != Some(self.data.len()) {
            self.dirty.set(LightDirty::PROGRAM);
        } else {
            // Back to the compiled count, so an earlier request is void
            self.dirty.unset(LightDirty::PROGRAM);
            self.dirty.set(LightDirty::DATA);
        }
    }

    /// G-buffer textures, one per entry of `K::SAMPLERS`
    pub fn set_textures(&mut self, textures: &[Option<TextureHandle>]) {
        if self.textures.as_slice() != textures {
            self.textures = textures.to_vec();
            self.textures.resize(K::SAMPLERS.len(), None);
            self.dirty.set(LightDirty::TEXTURES);
        }
    }

    /// Write raw records into the current block without recompiling.
    /// Rejected when the length differs from the compiled count.
    pub fn upload(&mut self, backend: &mut dyn GraphicsBackend, data: &[K::Data]) -> bool {
        self.block.upload(backend, data)
    }

    pub fn light_count(&self) -> usize {
        self.data.len()
    }

    pub fn variant(&self) -> Option<VariantKey> {
        self.variant
    }

    fn recompile(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        let count = self.data.len();
        self.variant = Some(VariantKey {
            kind: K::PROGRAM,
            count,
        });
        if !self.core.compile(backend, &Self::program_descriptor(count)) {
            return false;
        }
        if let Err(e) = self.block.allocate(backend, count) {
            log::error!("{}: failed to allocate light block: {}", K::NAME, e);
            return false;
        }
        self.core.bind_units(backend, K::SAMPLERS);
        log::debug!("{}: compiled for {} lights", K::NAME, count);
        true
    }
}

impl<K: LightKind> Default for FullscreenLightPass<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: LightKind> RenderPass for FullscreenLightPass<K> {
    fn name(&self) -> &str {
        K::NAME
    }

    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if self.triangle.is_none() {
            match FullscreenTriangle::create(backend) {
                Ok(triangle) => self.triangle = Some(triangle),
                Err(e) => {
                    log::error!("{}: {}", K::NAME, e);
                    return false;
                }
            }
        }
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
        } else {
            if self.dirty.get(LightDirty::UNITS) {
                self.core.bind_units(backend, K::SAMPLERS);
            }
            if self.dirty.get(LightDirty::DATA) {
                self.block.upload(backend, &self.data);
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
        if self.triangle.is_none() || !self.core.bind(backend) {
            // An inert pass contributes no light to the merge
            if let Some(target) = self.core.target {
                backend.bind_framebuffer(target);
                backend.clear(Some([0.0; 4]), None);
            }
            return false;
        }
        backend.set_blend(None);
        PassCore::bind_textures(backend, &self.textures);
        backend.bind_uniform_block(self.block.buffer());
        true
    }

    fn draw_body(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(triangle) = &self.triangle {
            triangle.draw(backend);
        }
    }

    fn teardown(&mut self, backend: &mut dyn GraphicsBackend) {
        backend.bind_uniform_block(None);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Ambient light program. Each record is `color.rgb * color.a`.
pub const AMBIENT_LIGHT_SHADER: &str = r#"
const DATA_SIZE: u32 = 1u;
const ENABLED: bool = true;

struct AmbientLight {
    color: vec4<f32>,
}

struct LightBlock {
    lights: array<AmbientLight, DATA_SIZE>,
}

@group(1) @binding(0) var u_position: texture_2d<f32>;
@group(2) @binding(0) var<uniform> block: LightBlock;

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(frag_coord.xy);
    let position = textureLoad(u_position, pixel, 0);
    var sum = vec3<f32>(0.0);
    if (ENABLED && position.a > 0.0) {
        for (var i = 0u; i < DATA_SIZE; i = i + 1u) {
            let light = block.lights[i];
            sum = sum + light.color.rgb * light.color.a;
        }
    }
    return vec4<f32>(sum, 1.0);
}
"#;

/// Directional light program: Lambert term per light
pub const DIRECTIONAL_LIGHT_SHADER: &str = r#"
const DATA_SIZE: u32 = 1u;
const ENABLED: bool = true;

struct DirectionalLight {
    direction: vec4<f32>,
    color: vec4<f32>,
}

struct LightBlock {
    lights: array<DirectionalLight, DATA_SIZE>,
}

@group(1) @binding(0) var u_position: texture_2d<f32>;
@group(1) @binding(1) var u_normal: texture_2d<f32>;
@group(2) @binding(0) var<uniform> block: LightBlock;

fn safe_normalize(v: vec3<f32>) -> vec3<f32> {
    let len = length(v);
    if (len > 0.0) {
        return v / len;
    }
    return vec3<f32>(0.0);
}

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(frag_coord.xy);
    let position = textureLoad(u_position, pixel, 0);
    let normal = safe_normalize(textureLoad(u_normal, pixel, 0).xyz);
    var sum = vec3<f32>(0.0);
    if (ENABLED && position.a > 0.0) {
        for (var i = 0u; i < DATA_SIZE; i = i + 1u) {
            let light = block.lights[i];
            let to_light = -safe_normalize(light.direction.xyz);
            sum = sum + max(dot(normal, to_light), 0.0) * light.color.rgb * light.color.a;
        }
    }
    return vec4<f32>(sum, 1.0);
}
"#;
