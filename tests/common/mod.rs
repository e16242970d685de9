//! Common utilities for renderer integration tests.
//!
//! Tests are parameterized over [`Backend`] with `rstest`. The software
//! backend always runs; the wgpu backend needs a GPU and only runs when
//! `DEFERRED_RENDERER_GPU_TESTS=1` is set.

use deferred_renderer::backend::{FramebufferHandle, GraphicsBackend};
use deferred_renderer::renderer::TargetId;
use deferred_renderer::resources::Mesh;
use deferred_renderer::scene::{Camera, DirectionalLight, Geometry, Scene, SceneContent};
use deferred_renderer::{Renderer, RendererConfig, SoftwareBackend};
use glam::Vec3;

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Backends the integration tests run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// CPU reference rasterizer.
    Software,
    /// wgpu, headless.
    Wgpu,
}

impl Backend {
    /// Check if this backend can run in the current environment.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Software => true,
            #[cfg(feature = "wgpu-backend")]
            Backend::Wgpu => std::env::var("DEFERRED_RENDERER_GPU_TESTS").is_ok_and(|v| v == "1"),
            #[cfg(not(feature = "wgpu-backend"))]
            Backend::Wgpu => false,
        }
    }

    /// Create the backend with a `width` x `height` canvas.
    ///
    /// Returns `None` if the backend is not available.
    pub fn create(self, width: u32, height: u32) -> Option<Box<dyn GraphicsBackend>> {
        if !self.is_available() {
            return None;
        }
        match self {
            Backend::Software => Some(Box::new(SoftwareBackend::new(width, height))),
            #[cfg(feature = "wgpu-backend")]
            Backend::Wgpu => match deferred_renderer::WgpuBackend::headless(width, height) {
                Ok(backend) => Some(Box::new(backend)),
                Err(e) => {
                    eprintln!("wgpu backend unavailable: {}", e);
                    None
                }
            },
            #[cfg(not(feature = "wgpu-backend"))]
            Backend::Wgpu => None,
        }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Initialized renderer on `backend`, or `None` when the backend is unavailable.
pub fn renderer(backend: Backend, width: u32, height: u32) -> Option<Renderer> {
    init_logging();
    let backend = backend.create(width, height)?;
    let mut renderer = Renderer::new(backend, RendererConfig::default());
    assert!(renderer.initialize(), "renderer failed to initialize");
    Some(renderer)
}

/// One unit cube at the origin under a white directional light, seen from
/// slightly above and to the side.
pub fn cube_scene(renderer: &mut Renderer) {
    let cube = Mesh::cube()
        .upload(renderer.backend_mut())
        .expect("cube upload");
    renderer.set_scene(Scene::new(SceneContent {
        geometry: vec![Geometry::new(cube)],
        ambient: Vec::new(),
        directional: vec![DirectionalLight::new(
            Vec3::new(-2.0, -5.0, -1.0),
            Vec3::ONE,
            1.0,
        )],
        point: Vec::new(),
    }));
    renderer.set_camera(Camera::new(Vec3::new(2.0, 2.0, 3.0), Vec3::ZERO));
}

/// Run prepare/draw until the renderer goes idle or `limit` frames were drawn.
/// Returns the number of drawn frames.
pub fn run_until_idle(renderer: &mut Renderer, limit: u32) -> u32 {
    let mut frames = 0;
    while frames < limit {
        let time = frames as f64 * 16.0;
        if !renderer.prepare(time) {
            break;
        }
        renderer.draw(time);
        frames += 1;
    }
    frames
}

/// Canvas pixel at (`x`, `y`), rows counted from the top.
pub fn canvas_pixel(renderer: &mut Renderer, x: u32, y: u32) -> [f32; 4] {
    let pixels = renderer
        .backend_mut()
        .read_pixels(FramebufferHandle::CANVAS, 0, (x, y, 1, 1))
        .expect("canvas readback");
    pixels[0]
}

/// Every pixel of attachment 0 of an internal framebuffer.
pub fn target_pixels(renderer: &mut Renderer, id: TargetId) -> Vec<[f32; 4]> {
    let targets = renderer.targets().expect("renderer is initialized");
    let handle = targets.handle(id);
    let (width, height) = targets.get(id).size();
    renderer
        .backend_mut()
        .read_pixels(handle, 0, (0, 0, width, height))
        .expect("target readback")
}

/// Compare RGB within `tolerance`.
pub fn rgb_close(actual: [f32; 4], expected: [f32; 4], tolerance: f32) -> bool {
    actual
        .iter()
        .zip(expected.iter())
        .take(3)
        .all(|(a, e)| (a - e).abs() <= tolerance)
}
