//! Renderer: owns the framebuffers, the pass pipeline, the camera binding and
//! the TAA state, and drives the per-frame `prepare` / `draw` cycle.
//!
//! A host calls
//!
//! ```ignore
//! if renderer.prepare(time) {
//!     renderer.draw(time);
//! }
//! ```
//!
//! once per animation frame. `prepare` returns `false` once the image has
//! converged and nothing changed, so an idle scene costs no GPU work.

use crate::backend::{
    BackendResult, BlendState, FramebufferHandle, GraphicsBackend, TextureFormat, TextureHandle,
};
use crate::pipeline::{
    AccumulatePass, AmbientLightPass, BlitPass, DirectionalLightPass, GeometryPass, LightMergePass,
    MergeInputs, PointLightPass,
};
use crate::render_graph::{DirtyRegister, RenderPass};
use crate::resources::{AttachmentSpec, Framebuffer};
use crate::scene::{Camera, Scene, SceneChange};
use crate::taa::{TaaConfig, TaaState};

/// G-buffer layout written by the geometry pass
pub const GEOMETRY_ATTACHMENTS: [AttachmentSpec; 5] = [
    AttachmentSpec::new(0, "Albedo", TextureFormat::Rgba8Unorm),
    AttachmentSpec::new(1, "World Position", TextureFormat::Rgba16Float),
    AttachmentSpec::new(2, "World Normal", TextureFormat::Rgba16Float),
    AttachmentSpec::new(3, "View Position", TextureFormat::Rgba16Float),
    AttachmentSpec::new(4, "View Normal", TextureFormat::Rgba16Float),
];

const AMBIENT_ATTACHMENTS: [AttachmentSpec; 1] =
    [AttachmentSpec::new(0, "Ambient", TextureFormat::Rgba16Float)];
const DIRECTIONAL_ATTACHMENTS: [AttachmentSpec; 1] =
    [AttachmentSpec::new(0, "Directional", TextureFormat::Rgba16Float)];
const POINT_ATTACHMENTS: [AttachmentSpec; 1] =
    [AttachmentSpec::new(0, "Point", TextureFormat::Rgba16Float)];
const MERGE_ATTACHMENTS: [AttachmentSpec; 1] =
    [AttachmentSpec::new(0, "Merged", TextureFormat::Rgba16Float)];
const ACCUMULATION_ATTACHMENTS: [AttachmentSpec; 1] =
    [AttachmentSpec::new(0, "Accumulated", TextureFormat::Rgba16Float)];

/// Debug view shown on the canvas until `set_output` picks another
pub const DEFAULT_OUTPUT: &str = "Accumulated";

const WORLD_POSITION: u32 = 1;
const WORLD_NORMAL: u32 = 2;

/// Renderer settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RendererConfig {
    /// Color of pixels the geometry does not cover
    pub clear_color: [f32; 4],
    /// Render resolution relative to the canvas
    pub resolution_scale: f32,
    pub taa: TaaConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.1, 0.1, 0.15, 1.0],
            resolution_scale: 1.0,
            taa: TaaConfig::default(),
        }
    }
}

impl RendererConfig {
    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    pub fn with_resolution_scale(mut self, scale: f32) -> Self {
        self.resolution_scale = scale;
        self
    }

    pub fn with_taa(mut self, taa: TaaConfig) -> Self {
        self.taa = taa;
        self
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RendererDirty: u32 {
        const SIZE = 1 << 0;
        const CAMERA = 1 << 1;
        const SCENE = 1 << 2;
        const TAA_ENABLED = 1 << 3;
        const TAA_FRAME_COUNT = 1 << 4;
        const TAA_HALTON = 1 << 5;
        const TAA_FRAME = 1 << 6;
        const OUTPUT = 1 << 7;
        const BACKGROUND = 1 << 8;
    }
}

impl RendererDirty {
    const TAA_SETTINGS: Self = Self::TAA_ENABLED
        .union(Self::TAA_FRAME_COUNT)
        .union(Self::TAA_HALTON);
}

/// Internal framebuffers, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetId {
    Geometry,
    Ambient,
    Directional,
    Point,
    Merge,
    Accumulation,
}

impl TargetId {
    pub const ALL: [TargetId; 6] = [
        TargetId::Geometry,
        TargetId::Ambient,
        TargetId::Directional,
        TargetId::Point,
        TargetId::Merge,
        TargetId::Accumulation,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TargetId::Geometry => "Geometry",
            TargetId::Ambient => "Ambient Light",
            TargetId::Directional => "Directional Light",
            TargetId::Point => "Point Light",
            TargetId::Merge => "Light Merge",
            TargetId::Accumulation => "Accumulation",
        }
    }

    pub fn attachments(self) -> &'static [AttachmentSpec] {
        match self {
            TargetId::Geometry => &GEOMETRY_ATTACHMENTS,
            TargetId::Ambient => &AMBIENT_ATTACHMENTS,
            TargetId::Directional => &DIRECTIONAL_ATTACHMENTS,
            TargetId::Point => &POINT_ATTACHMENTS,
            TargetId::Merge => &MERGE_ATTACHMENTS,
            TargetId::Accumulation => &ACCUMULATION_ATTACHMENTS,
        }
    }

    fn depth(self) -> Option<TextureFormat> {
        match self {
            TargetId::Geometry => Some(TextureFormat::Depth32Float),
            _ => None,
        }
    }
}

/// Every framebuffer the renderer owns. All share the render resolution.
#[derive(Debug)]
pub struct RenderTargets {
    framebuffers: Vec<Framebuffer>,
}

impl RenderTargets {
    pub fn new(backend: &mut dyn GraphicsBackend, size: (u32, u32)) -> BackendResult<Self> {
        let framebuffers = TargetId::ALL
            .iter()
            .map(|id| Framebuffer::new(backend, id.label(), id.attachments(), id.depth(), size))
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(Self { framebuffers })
    }

    pub fn get(&self, id: TargetId) -> &Framebuffer {
        &self.framebuffers[id as usize]
    }

    pub fn handle(&self, id: TargetId) -> FramebufferHandle {
        self.get(id).handle()
    }

    pub fn texture(&self, id: TargetId, slot: u32) -> Option<TextureHandle> {
        self.get(id).texture(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Framebuffer> {
        self.framebuffers.iter()
    }

    /// Resize every framebuffer together
    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, size: (u32, u32)) {
        for framebuffer in &mut self.framebuffers {
            framebuffer.resize(backend, size.0, size.1);
        }
    }
}

/// One selectable canvas output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugView {
    pub name: &'static str,
    pub target: TargetId,
    pub attachment: u32,
    /// `None` until the renderer is initialized
    pub texture: Option<TextureHandle>,
}

/// Render resolution for a client size, device pixel ratio and scale,
/// floored and clamped to at least one pixel
pub fn render_resolution(client: (u32, u32), dpr: f64, scale: f32) -> (u32, u32) {
    let scaled = |v: u32| ((v as f64 * dpr * scale as f64).floor() as u32).max(1);
    (scaled(client.0), scaled(client.1))
}

fn pass_mut<T: RenderPass>(passes: &mut [Box<dyn RenderPass>]) -> Option<&mut T> {
    passes
        .iter_mut()
        .find_map(|pass| pass.as_any_mut().downcast_mut::<T>())
}

/// Deferred renderer
pub struct Renderer {
    backend: Box<dyn GraphicsBackend>,
    config: RendererConfig,
    camera: Camera,
    camera_timestamp: Option<u64>,
    scene: Scene,
    pending_scene: SceneChange,
    targets: Option<RenderTargets>,
    passes: Vec<Box<dyn RenderPass>>,
    taa: TaaState,
    dirty: DirtyRegister<RendererDirty>,
    client_size: (u32, u32),
    dpr: f64,
    render_size: (u32, u32),
    output: usize,
}

impl Renderer {
    pub fn new(backend: Box<dyn GraphicsBackend>, config: RendererConfig) -> Self {
        let client_size = backend.canvas_size();
        let render_size = render_resolution(client_size, 1.0, config.resolution_scale);
        let output = Self::view_layout()
            .position(|(name, _, _)| name == DEFAULT_OUTPUT)
            .unwrap_or(0);
        let passes: Vec<Box<dyn RenderPass>> = vec![
            Box::new(GeometryPass::new()),
            Box::new(AmbientLightPass::new()),
            Box::new(DirectionalLightPass::new()),
            Box::new(PointLightPass::new()),
            Box::new(LightMergePass::new(config.clear_color)),
            Box::new(AccumulatePass::new()),
            Box::new(BlitPass::new()),
        ];
        Self {
            backend,
            config,
            camera: Camera::default(),
            camera_timestamp: None,
            scene: Scene::default(),
            pending_scene: SceneChange::NONE,
            targets: None,
            passes,
            taa: TaaState::new(config.taa),
            dirty: DirtyRegister::new(),
            client_size,
            dpr: 1.0,
            render_size,
            output,
        }
    }

    /// Check backend features, create the framebuffers and compile every pass.
    ///
    /// Returns `false` when the backend lacks float render targets or enough
    /// color attachments; the renderer then stays inert. A pass that fails to
    /// compile is logged and simply draws nothing.
    pub fn initialize(&mut self) -> bool {
        let caps = self.backend.capabilities();
        if !caps.float_render_targets {
            log::error!("Renderer: backend '{}' has no float render targets", self.backend.name());
            return false;
        }
        if (caps.max_color_attachments as usize) < GEOMETRY_ATTACHMENTS.len() {
            log::error!(
                "Renderer: backend '{}' supports {} color attachments, {} required",
                self.backend.name(),
                caps.max_color_attachments,
                GEOMETRY_ATTACHMENTS.len()
            );
            return false;
        }

        let targets = match RenderTargets::new(self.backend.as_mut(), self.render_size) {
            Ok(targets) => targets,
            Err(e) => {
                log::error!("Renderer: failed to create framebuffers: {}", e);
                return false;
            }
        };

        for pass in &mut self.passes {
            if !pass.initialize(self.backend.as_mut()) {
                log::warn!("Renderer: pass '{}' failed to initialize", pass.name());
            }
        }

        self.bind_textures(&targets);
        self.install_hooks();
        self.targets = Some(targets);

        self.pending_scene = SceneChange::FULL;
        self.camera_timestamp = None;
        self.dirty.set_all();
        log::info!(
            "Renderer initialized on '{}' at {}x{}",
            self.backend.name(),
            self.render_size.0,
            self.render_size.1
        );
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.targets.is_some()
    }

    fn bind_textures(&mut self, targets: &RenderTargets) {
        let position = targets.texture(TargetId::Geometry, WORLD_POSITION);
        let normal = targets.texture(TargetId::Geometry, WORLD_NORMAL);
        if let Some(pass) = pass_mut::<AmbientLightPass>(&mut self.passes) {
            pass.set_textures(&[position]);
        }
        if let Some(pass) = pass_mut::<DirectionalLightPass>(&mut self.passes) {
            pass.set_textures(&[position, normal]);
        }
        if let Some(pass) = pass_mut::<PointLightPass>(&mut self.passes) {
            pass.set_textures(position, normal);
        }
        if let Some(pass) = pass_mut::<LightMergePass>(&mut self.passes) {
            pass.set_inputs(MergeInputs {
                ambient: targets.texture(TargetId::Ambient, 0),
                directional: targets.texture(TargetId::Directional, 0),
                point: targets.texture(TargetId::Point, 0),
                albedo: targets.texture(TargetId::Geometry, 0),
            });
        }
        if let Some(pass) = pass_mut::<AccumulatePass>(&mut self.passes) {
            pass.set_source(targets.texture(TargetId::Merge, 0));
        }
    }

    fn install_hooks(&mut self) {
        if let Some(pass) = pass_mut::<GeometryPass>(&mut self.passes) {
            pass.hooks_mut().pre_draw = Some(Box::new(|backend: &mut dyn GraphicsBackend| {
                backend.clear(Some([0.0; 4]), Some(1.0))
            }));
        }
        if let Some(pass) = pass_mut::<PointLightPass>(&mut self.passes) {
            pass.hooks_mut().pre_draw = Some(Box::new(|backend: &mut dyn GraphicsBackend| {
                backend.clear(Some([0.0; 4]), None)
            }));
        }
        if let Some(pass) = pass_mut::<AccumulatePass>(&mut self.passes) {
            let hooks = pass.hooks_mut();
            hooks.pre_draw = Some(Box::new(|backend: &mut dyn GraphicsBackend| {
                backend.set_blend(Some(BlendState::alpha_blending()))
            }));
            hooks.post_draw = Some(Box::new(|backend: &mut dyn GraphicsBackend| {
                backend.set_blend(None)
            }));
        }
    }

    /// Bring every pass up to date for the frame at `time` (milliseconds).
    /// Returns whether anything changed and the frame should be drawn.
    pub fn prepare(&mut self, time: f64) -> bool {
        let Some(targets) = self.targets.as_mut() else {
            return false;
        };
        let backend = self.backend.as_mut();

        // Scene delta
        let change = std::mem::replace(&mut self.pending_scene, SceneChange::NONE)
            | self.scene.update(time);
        if !change.is_empty() {
            let content = &self.scene.content;
            if change.contains(SceneChange::GEOMETRY) {
                if let Some(pass) = pass_mut::<GeometryPass>(&mut self.passes) {
                    pass.set_geometry(backend, &content.geometry);
                }
            }
            if change.contains(SceneChange::AMBIENT) {
                if let Some(pass) = pass_mut::<AmbientLightPass>(&mut self.passes) {
                    pass.set_lights(&content.ambient);
                }
            }
            if change.contains(SceneChange::DIRECTIONAL) {
                if let Some(pass) = pass_mut::<DirectionalLightPass>(&mut self.passes) {
                    pass.set_lights(&content.directional);
                }
            }
            if change.contains(SceneChange::POINT) {
                if let Some(pass) = pass_mut::<PointLightPass>(&mut self.passes) {
                    pass.set_lights(&content.point);
                }
            }
            log::trace!("Renderer: scene change {:?}", change);
            self.dirty.set(RendererDirty::SCENE);
        }

        // Resize every target before any pass prepares
        let size = self.render_size;
        if self.dirty.get(RendererDirty::SIZE) {
            targets.resize(backend, size);
            let canvas = backend.canvas_size();
            for (pass, id) in self.passes.iter_mut().zip(TargetId::ALL) {
                pass.set_target(targets.handle(id), size);
            }
            if let Some(pass) = pass_mut::<BlitPass>(&mut self.passes) {
                pass.set_target(FramebufferHandle::CANVAS, canvas);
            }
            self.camera.set_aspect(size.0 as f32 / size.1 as f32);
            log::debug!(
                "Renderer: render size {}x{}, canvas {}x{}",
                size.0,
                size.1,
                canvas.0,
                canvas.1
            );
        }

        if self.dirty.get_any(RendererDirty::SIZE | RendererDirty::OUTPUT) {
            let texture = self
                .debug_view(self.output)
                .and_then(|view| view.texture);
            if let Some(pass) = pass_mut::<BlitPass>(&mut self.passes) {
                pass.set_source(texture, size);
            }
        }

        let camera_moved = self.camera_timestamp != Some(self.camera.timestamp());
        if camera_moved {
            self.dirty.set(RendererDirty::CAMERA);
        }

        let taa_changed = self.dirty.get_any(RendererDirty::TAA_SETTINGS);
        if taa_changed && self.taa.enabled() {
            self.taa.regenerate();
        }

        let content_changed = self.dirty.get_any(
            RendererDirty::CAMERA
                | RendererDirty::SCENE
                | RendererDirty::SIZE
                | RendererDirty::BACKGROUND,
        );
        if taa_changed || content_changed {
            self.taa.reset();
            if let Some(targets) = self.targets.as_ref() {
                targets
                    .get(TargetId::Accumulation)
                    .clear(self.backend.as_mut(), [0.0; 4]);
            }
            self.dirty.set(RendererDirty::TAA_FRAME);
            log::debug!("Renderer: TAA reset");
        }

        if self.dirty.get(RendererDirty::TAA_FRAME) {
            let offset = self.taa.ndc_offset(size);
            for pass in &mut self.passes {
                if let Some(consumer) = pass.as_jitter_consumer() {
                    consumer.set_ndc_offset(offset);
                }
            }
            if let Some(pass) = pass_mut::<AccumulatePass>(&mut self.passes) {
                pass.set_frame(self.taa.frame());
            }
        }

        // Once converged the accumulation buffer holds every sample
        let converged = self.taa.is_converged();
        if let Some(pass) = pass_mut::<AccumulatePass>(&mut self.passes) {
            pass.set_holding(converged);
        }

        if camera_moved {
            let matrices = self.camera.matrices();
            for pass in &mut self.passes {
                if let Some(consumer) = pass.as_camera_consumer() {
                    consumer.set_camera(&matrices);
                }
            }
            self.camera_timestamp = Some(self.camera.timestamp());
        }

        let mut redraw = self.dirty.any();
        for pass in &mut self.passes {
            redraw |= pass.prepare(self.backend.as_mut());
        }
        self.dirty.reset();
        redraw
    }

    /// Draw every pass in pipeline order, then step TAA
    pub fn draw(&mut self, time: f64) {
        if self.targets.is_none() {
            return;
        }
        log::trace!("Renderer: draw at {:.1} ms, TAA frame {}", time, self.taa.frame());
        if let Err(e) = self.backend.begin_frame() {
            log::error!("Renderer: failed to begin frame: {}", e);
            return;
        }
        for pass in &mut self.passes {
            pass.draw(self.backend.as_mut());
        }
        if let Err(e) = self.backend.end_frame() {
            log::error!("Renderer: failed to end frame: {}", e);
        }
        if self.taa.advance() {
            self.dirty.set(RendererDirty::TAA_FRAME);
        }
    }

    /// New client size in CSS-like units and the device pixel ratio.
    /// The canvas follows immediately, the framebuffers at the next `prepare()`.
    pub fn resize(&mut self, client_width: u32, client_height: u32, device_pixel_ratio: f64) {
        self.client_size = (client_width, client_height);
        self.dpr = device_pixel_ratio;
        let canvas = render_resolution(self.client_size, self.dpr, 1.0);
        if canvas != self.backend.canvas_size() {
            self.backend.resize_canvas(canvas.0, canvas.1);
            self.dirty.set(RendererDirty::SIZE);
        }
        self.update_render_size();
    }

    pub fn set_resolution_scale(&mut self, scale: f32) {
        self.config.resolution_scale = scale;
        self.update_render_size();
    }

    fn update_render_size(&mut self) {
        let size = render_resolution(self.client_size, self.dpr, self.config.resolution_scale);
        if size != self.render_size {
            self.render_size = size;
            self.dirty.set(RendererDirty::SIZE);
        }
    }

    pub fn render_size(&self) -> (u32, u32) {
        self.render_size
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Replace the scene. Everything is re-applied at the next `prepare()`.
    pub fn set_scene(&mut self, scene: Scene) {
        self.scene = scene;
        self.pending_scene = SceneChange::FULL;
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Mutable scene access. Report what changed with [`Renderer::mark_scene_changed`].
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn mark_scene_changed(&mut self, change: SceneChange) {
        self.pending_scene |= change;
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn set_camera(&mut self, mut camera: Camera) {
        camera.set_aspect(self.render_size.0 as f32 / self.render_size.1 as f32);
        self.camera = camera;
        self.camera_timestamp = None;
    }

    pub fn set_taa_enabled(&mut self, enabled: bool) {
        if self.taa.set_enabled(enabled) {
            self.dirty.set(RendererDirty::TAA_ENABLED);
        }
    }

    pub fn set_taa_frame_count(&mut self, frame_count: u32) {
        if self.taa.set_frame_count(frame_count) {
            self.dirty.set(RendererDirty::TAA_FRAME_COUNT);
        }
    }

    pub fn set_taa_halton_bases(&mut self, x: u32, y: u32) {
        if self.taa.set_halton_bases((x, y)) {
            self.dirty.set(RendererDirty::TAA_HALTON);
        }
    }

    pub fn taa(&self) -> &TaaState {
        &self.taa
    }

    /// Background of uncovered pixels. A new color restarts TAA.
    pub fn set_clear_color(&mut self, clear_color: [f32; 4]) {
        if clear_color == self.config.clear_color {
            return;
        }
        self.config.clear_color = clear_color;
        if let Some(pass) = pass_mut::<LightMergePass>(&mut self.passes) {
            pass.set_background(clear_color);
        }
        self.dirty.set(RendererDirty::BACKGROUND);
    }

    fn view_layout() -> impl Iterator<Item = (&'static str, TargetId, u32)> {
        TargetId::ALL.into_iter().flat_map(|id| {
            id.attachments()
                .iter()
                .map(move |spec| (spec.name, id, spec.slot))
        })
    }

    fn debug_view(&self, index: usize) -> Option<DebugView> {
        let (name, target, attachment) = Self::view_layout().nth(index)?;
        Some(DebugView {
            name,
            target,
            attachment,
            texture: self
                .targets
                .as_ref()
                .and_then(|targets| targets.texture(target, attachment)),
        })
    }

    /// Every color attachment of every internal framebuffer
    pub fn debug_views(&self) -> Vec<DebugView> {
        (0..Self::view_layout().count())
            .filter_map(|index| self.debug_view(index))
            .collect()
    }

    /// Show debug view `index` on the canvas. Returns `false` for an unknown index.
    pub fn set_output(&mut self, index: usize) -> bool {
        if index >= Self::view_layout().count() {
            log::warn!("Renderer: no debug view {}", index);
            return false;
        }
        if index != self.output {
            self.output = index;
            self.dirty.set(RendererDirty::OUTPUT);
        }
        true
    }

    pub fn output(&self) -> usize {
        self.output
    }

    pub fn targets(&self) -> Option<&RenderTargets> {
        self.targets.as_ref()
    }

    pub fn passes(&self) -> impl Iterator<Item = &dyn RenderPass> {
        self.passes.iter().map(|pass| pass.as_ref())
    }

    /// Typed access to one pass of the pipeline
    pub fn pass_mut<T: RenderPass>(&mut self) -> Option<&mut T> {
        pass_mut(&mut self.passes)
    }

    pub fn backend(&self) -> &dyn GraphicsBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn GraphicsBackend {
        self.backend.as_mut()
    }

    /// Read the canvas back as an 8-bit RGBA image
    pub fn capture(&mut self) -> BackendResult<image::RgbaImage> {
        let (width, height) = self.backend.canvas_size();
        let pixels = self
            .backend
            .read_pixels(FramebufferHandle::CANVAS, 0, (0, 0, width, height))?;
        let mut image = image::RgbaImage::new(width, height);
        for (dst, src) in image.pixels_mut().zip(pixels) {
            *dst = image::Rgba(src.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8));
        }
        Ok(image)
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.backend.name())
            .field("render_size", &self.render_size)
            .field("initialized", &self.targets.is_some())
            .field("taa_frame", &self.taa.frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    fn renderer(width: u32, height: u32) -> Renderer {
        Renderer::new(
            Box::new(SoftwareBackend::new(width, height)),
            RendererConfig::default(),
        )
    }

    #[test]
    fn test_render_resolution() {
        assert_eq!(render_resolution((100, 50), 2.0, 0.5), (100, 50));
        assert_eq!(render_resolution((33, 33), 1.5, 1.0), (49, 49));
        assert_eq!(render_resolution((0, 10), 1.0, 1.0), (1, 10));
        assert_eq!(render_resolution((10, 10), 1.0, 0.01), (1, 1));
    }

    #[test]
    fn test_uninitialized_is_inert() {
        let mut renderer = renderer(8, 8);
        assert!(!renderer.prepare(0.0));
        renderer.draw(0.0);
        assert_eq!(renderer.backend().stats().draw_calls, 0);
    }

    #[test]
    fn test_missing_float_targets_aborts() {
        let backend = SoftwareBackend::new(8, 8).with_capabilities(crate::backend::BackendCapabilities {
            float_render_targets: false,
            ..Default::default()
        });
        let mut renderer = Renderer::new(Box::new(backend), RendererConfig::default());
        assert!(!renderer.initialize());
        assert!(!renderer.is_initialized());
        assert!(!renderer.prepare(0.0));
    }

    #[test]
    fn test_too_few_attachments_aborts() {
        let backend = SoftwareBackend::new(8, 8).with_capabilities(crate::backend::BackendCapabilities {
            max_color_attachments: 4,
            ..Default::default()
        });
        let mut renderer = Renderer::new(Box::new(backend), RendererConfig::default());
        assert!(!renderer.initialize());
    }

    #[test]
    fn test_debug_views() {
        let mut renderer = renderer(8, 8);
        let views = renderer.debug_views();
        assert_eq!(views.len(), 10);
        assert!(views.iter().all(|view| view.texture.is_none()));
        assert_eq!(views[renderer.output()].name, DEFAULT_OUTPUT);

        assert!(renderer.initialize());
        let views = renderer.debug_views();
        assert!(views.iter().all(|view| view.texture.is_some()));
        assert_eq!(views[0].name, "Albedo");
        assert_eq!(views[4].attachment, 4);
        assert_eq!(views[5].target, TargetId::Ambient);

        assert!(renderer.set_output(0));
        assert!(!renderer.set_output(views.len()));
        assert_eq!(renderer.output(), 0);
    }

    #[test]
    fn test_taa_setters_flag_only_changes() {
        let mut renderer = renderer(8, 8);
        renderer.set_taa_enabled(true);
        renderer.set_taa_halton_bases(2, 3);
        assert!(!renderer.dirty.any());
        renderer.set_taa_frame_count(0);
        assert!(renderer.dirty.get(RendererDirty::TAA_FRAME_COUNT));
        assert_eq!(renderer.taa().frame_count(), 1);
    }
}
