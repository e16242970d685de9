//! TAA accumulation pass
//!
//! Blends the merged frame into the accumulation buffer with alpha
//! `1 / (frame + 1)`, which keeps the buffer equal to the running mean of
//! every sample since the last reset. The orchestrator enables alpha blending
//! around the draw through the pass hooks.

use std::any::Any;

use crate::backend::*;
use crate::render_graph::{DirtyRegister, FullscreenTriangle, PassCore, RenderPass, FULLSCREEN_VERTEX};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccumulateDirty: u32 {
        const UNITS = 1 << 0;
        const SOURCE = 1 << 1;
        const ALPHA = 1 << 2;
    }
}

/// Blend weight of sub-frame `frame`
pub fn accumulation_alpha(frame: u32) -> f32 {
    1.0 / (frame as f32 + 1.0)
}

pub struct AccumulatePass {
    core: PassCore,
    dirty: DirtyRegister<AccumulateDirty>,
    source: Option<TextureHandle>,
    frame: u32,
    holding: bool,
    triangle: Option<FullscreenTriangle>,
}

impl AccumulatePass {
    pub fn new() -> Self {
        Self {
            core: PassCore::default(),
            dirty: DirtyRegister::new(),
            source: None,
            frame: 0,
            holding: false,
            triangle: None,
        }
    }

    pub fn program_descriptor() -> ProgramDescriptor {
        ProgramDescriptor {
            label: "Accumulate".to_string(),
            kind: ProgramKind::Accumulate,
            source: format!("{}{}", FULLSCREEN_VERTEX, ACCUMULATE_SHADER),
            defines: Vec::new(),
            uniforms: vec![
                UniformDecl::new("u_merged", UniformType::Sampler),
                UniformDecl::new("u_alpha", UniformType::Float),
            ],
            uniform_block: false,
        }
    }

    /// Merged frame to accumulate
    pub fn set_source(&mut self, source: Option<TextureHandle>) {
        if source != self.source {
            self.source = source;
            self.dirty.set(AccumulateDirty::SOURCE);
        }
    }

    /// Current TAA sub-frame index
    pub fn set_frame(&mut self, frame: u32) {
        if frame != self.frame {
            self.frame = frame;
            self.dirty.set(AccumulateDirty::ALPHA);
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// While holding, draws leave the accumulation buffer untouched
    pub fn set_holding(&mut self, holding: bool) {
        self.holding = holding;
    }

    pub fn is_holding(&self) -> bool {
        self.holding
    }
}

impl Default for AccumulatePass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for AccumulatePass {
    fn name(&self) -> &str {
        "Accumulate"
    }

    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if self.triangle.is_none() {
            match FullscreenTriangle::create(backend) {
                Ok(triangle) => self.triangle = Some(triangle),
                Err(e) => {
                    log::error!("Accumulate: {}", e);
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
            if self.dirty.get(AccumulateDirty::UNITS) {
                self.core.bind_units(backend, &["u_merged"]);
            }
            if self.dirty.get(AccumulateDirty::ALPHA) {
                let alpha = accumulation_alpha(self.frame);
                log::trace!("Accumulate: frame {} alpha {}", self.frame, alpha);
                backend.set_uniform(program, "u_alpha", UniformValue::Float(alpha));
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
        if self.holding || self.triangle.is_none() || !self.core.bind(backend) {
            return false;
        }
        backend.bind_texture(0, self.source);
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

pub const ACCUMULATE_SHADER: &str = r#"
struct Uniforms {
    u_alpha: f32,
}

@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(1) @binding(0) var u_merged: texture_2d<f32>;

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let merged = textureLoad(u_merged, vec2<i32>(frag_coord.xy), 0);
    return vec4<f32>(merged.rgb, uniforms.u_alpha);
}
"#;
