//! Blit pass: copies one attachment to the canvas
//!
//! The source texel is picked by nearest lookup scaled from the canvas
//! resolution to the render resolution, so a reduced resolution scale still
//! fills the canvas.

use std::any::Any;

use glam::Vec2;

use crate::backend::*;
use crate::render_graph::{DirtyRegister, FullscreenTriangle, PassCore, RenderPass, FULLSCREEN_VERTEX};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlitDirty: u32 {
        const UNITS = 1 << 0;
        const SOURCE = 1 << 1;
        const SCALE = 1 << 2;
    }
}

pub struct BlitPass {
    core: PassCore,
    dirty: DirtyRegister<BlitDirty>,
    source: Option<TextureHandle>,
    source_size: (u32, u32),
    triangle: Option<FullscreenTriangle>,
}

impl BlitPass {
    pub fn new() -> Self {
        Self {
            core: PassCore::default(),
            dirty: DirtyRegister::new(),
            source: None,
            source_size: (1, 1),
            triangle: None,
        }
    }

    pub fn program_descriptor() -> ProgramDescriptor {
        ProgramDescriptor {
            label: "Blit".to_string(),
            kind: ProgramKind::Blit,
            source: format!("{}{}", FULLSCREEN_VERTEX, BLIT_SHADER),
            defines: Vec::new(),
            uniforms: vec![
                UniformDecl::new("u_source", UniformType::Sampler),
                UniformDecl::new("u_sourceScale", UniformType::Vec2),
            ],
            uniform_block: false,
        }
    }

    /// Texture shown on the canvas and its size
    pub fn set_source(&mut self, source: Option<TextureHandle>, size: (u32, u32)) {
        if source != self.source {
            self.source = source;
            self.dirty.set(BlitDirty::SOURCE);
        }
        if size != self.source_size {
            self.source_size = size;
            self.dirty.set(BlitDirty::SCALE);
        }
    }

    pub fn source(&self) -> Option<TextureHandle> {
        self.source
    }

    /// Source texels per canvas pixel
    pub fn source_scale(&self) -> Vec2 {
        let (width, height) = self.core.size;
        Vec2::new(
            self.source_size.0 as f32 / width.max(1) as f32,
            self.source_size.1 as f32 / height.max(1) as f32,
        )
    }
}

impl Default for BlitPass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for BlitPass {
    fn name(&self) -> &str {
        "Blit"
    }

    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if self.triangle.is_none() {
            match FullscreenTriangle::create(backend) {
                Ok(triangle) => self.triangle = Some(triangle),
                Err(e) => {
                    log::error!("Blit: {}", e);
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
            if self.dirty.get(BlitDirty::UNITS) {
                self.core.bind_units(backend, &["u_source"]);
            }
            if self.dirty.get(BlitDirty::SCALE) {
                backend.set_uniform(program, "u_sourceScale", self.source_scale().into());
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

    fn set_target(&mut self, target: FramebufferHandle, size: (u32, u32)) {
        if size != self.core.size {
            self.dirty.set(BlitDirty::SCALE);
        }
        self.core.target = Some(target);
        self.core.size = size;
    }

    fn setup(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if self.triangle.is_none() || !self.core.bind(backend) {
            return false;
        }
        backend.set_blend(None);
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

pub const BLIT_SHADER: &str = r#"
struct Uniforms {
    u_sourceScale: vec2<f32>,
}

@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(1) @binding(0) var u_source: texture_2d<f32>;

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let texel = vec2<i32>(floor(frag_coord.xy * uniforms.u_sourceScale));
    let color = textureLoad(u_source, texel, 0);
    return vec4<f32>(color.rgb, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    #[test]
    fn test_scale_follows_sizes() {
        let mut pass = BlitPass::new();
        pass.set_target(FramebufferHandle::CANVAS, (100, 50));
        pass.set_source(None, (50, 50));
        assert_eq!(pass.source_scale(), Vec2::new(0.5, 1.0));
    }

    #[test]
    fn test_copies_to_canvas() {
        let mut backend = SoftwareBackend::new(4, 4);
        let source = backend
            .create_texture(&TextureDescriptor {
                width: 2,
                height: 2,
                format: TextureFormat::Rgba16Float,
                ..Default::default()
            })
            .unwrap();
        let source_fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                color_attachments: vec![(0, source)],
                depth_attachment: None,
            })
            .unwrap();
        backend.bind_framebuffer(source_fb);
        backend.clear(Some([0.0, 1.0, 0.0, 0.5]), None);

        let mut pass = BlitPass::new();
        assert!(pass.initialize(&mut backend));
        pass.set_target(FramebufferHandle::CANVAS, (4, 4));
        pass.set_source(Some(source), (2, 2));
        assert!(pass.prepare(&mut backend));
        pass.draw(&mut backend);

        let pixels = backend
            .read_pixels(FramebufferHandle::CANVAS, 0, (0, 0, 4, 4))
            .unwrap();
        assert!(pixels.iter().all(|p| *p == [0.0, 1.0, 0.0, 1.0]));
        assert!(!pass.prepare(&mut backend));
    }
}
