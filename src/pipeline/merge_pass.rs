//! Light merge pass
//!
//! Combines the ambient, directional and point light attachments with the
//! albedo buffer: `clamp(albedo.rgb * (ambient + directional + point), 0, 1)`
//! where the G-buffer is covered, the background color elsewhere.

use std::any::Any;

use crate::backend::*;
use crate::render_graph::{DirtyRegister, FullscreenTriangle, PassCore, RenderPass, FULLSCREEN_VERTEX};

const SAMPLERS: &[&str] = &["u_ambient", "u_directional", "u_point", "u_color"];

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MergeDirty: u32 {
        const UNITS = 1 << 0;
        const TEXTURES = 1 << 1;
        const BACKGROUND = 1 << 2;
    }
}

/// Input textures of the merge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeInputs {
    pub ambient: Option<TextureHandle>,
    pub directional: Option<TextureHandle>,
    pub point: Option<TextureHandle>,
    pub albedo: Option<TextureHandle>,
}

impl MergeInputs {
    fn units(&self) -> [Option<TextureHandle>; 4] {
        [self.ambient, self.directional, self.point, self.albedo]
    }
}

pub struct LightMergePass {
    core: PassCore,
    dirty: DirtyRegister<MergeDirty>,
    inputs: MergeInputs,
    background: [f32; 4],
    triangle: Option<FullscreenTriangle>,
}

impl LightMergePass {
    pub fn new(background: [f32; 4]) -> Self {
        Self {
            core: PassCore::default(),
            dirty: DirtyRegister::new(),
            inputs: MergeInputs::default(),
            background,
            triangle: None,
        }
    }

    pub fn program_descriptor() -> ProgramDescriptor {
        let mut uniforms: Vec<UniformDecl> = SAMPLERS
            .iter()
            .map(|name| UniformDecl::new(name, UniformType::Sampler))
            .collect();
        uniforms.push(UniformDecl::new("u_background", UniformType::Vec4));
        ProgramDescriptor {
            label: "Light Merge".to_string(),
            kind: ProgramKind::LightMerge,
            source: format!("{}{}", FULLSCREEN_VERTEX, LIGHT_MERGE_SHADER),
            defines: Vec::new(),
            uniforms,
            uniform_block: false,
        }
    }

    pub fn set_inputs(&mut self, inputs: MergeInputs) {
        if inputs != self.inputs {
            self.inputs = inputs;
            self.dirty.set(MergeDirty::TEXTURES);
        }
    }

    pub fn set_background(&mut self, background: [f32; 4]) {
        if background != self.background {
            self.background = background;
            self.dirty.set(MergeDirty::BACKGROUND);
        }
    }
}

impl RenderPass for LightMergePass {
    fn name(&self) -> &str {
        "Light Merge"
    }

    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if self.triangle.is_none() {
            match FullscreenTriangle::create(backend) {
                Ok(triangle) => self.triangle = Some(triangle),
                Err(e) => {
                    log::error!("Light Merge: {}", e);
                    return false;
                }
            }
        }
        let compiled = self.core.compile(backend, &Self::program_descriptor());
        self.dirty.set_all();
        compiled
    }

    fn prepare(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if let Some(program) = self.core.program {
            if self.dirty.get(MergeDirty::UNITS) {
                self.core.bind_units(backend, SAMPLERS);
            }
            if self.dirty.get(MergeDirty::BACKGROUND) {
                backend.set_uniform(program, "u_background", UniformValue::Vec4(self.background));
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
            return false;
        }
        backend.set_blend(None);
        PassCore::bind_textures(backend, &self.inputs.units());
        true
    }

    fn draw_body(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(triangle) = &self.triangle {
            triangle.draw(backend);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub const LIGHT_MERGE_SHADER: &str = r#"
struct Uniforms {
    u_background: vec4<f32>,
}

@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(1) @binding(0) var u_ambient: texture_2d<f32>;
@group(1) @binding(1) var u_directional: texture_2d<f32>;
@group(1) @binding(2) var u_point: texture_2d<f32>;
@group(1) @binding(3) var u_color: texture_2d<f32>;

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(frag_coord.xy);
    let albedo = textureLoad(u_color, pixel, 0);
    if (albedo.a <= 0.0) {
        return uniforms.u_background;
    }
    let light = textureLoad(u_ambient, pixel, 0).rgb
        + textureLoad(u_directional, pixel, 0).rgb
        + textureLoad(u_point, pixel, 0).rgb;
    return vec4<f32>(clamp(albedo.rgb * light, vec3<f32>(0.0), vec3<f32>(1.0)), 1.0);
}
"#;
