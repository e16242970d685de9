//! Scene management
//!
//! A scene is a snapshot of drawable geometry and light lists, plus an
//! optional per-frame update callback that reports what changed as a
//! [`SceneChange`] bitmask.

mod camera;
mod geometry;
mod light;

pub use camera::*;
pub use geometry::*;
pub use light::*;

use glam::{Mat4, Vec3, Vec4};

use crate::backend::{BackendResult, GraphicsBackend};
use crate::resources::{InstanceBuffer, InstanceData, Mesh};

bitflags::bitflags! {
    /// Which scene collections differ from the previous frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SceneChange: u32 {
        const GEOMETRY = 1 << 0;
        const AMBIENT = 1 << 1;
        const DIRECTIONAL = 1 << 2;
        const POINT = 1 << 3;
        const FULL = Self::GEOMETRY.bits()
            | Self::AMBIENT.bits()
            | Self::DIRECTIONAL.bits()
            | Self::POINT.bits();
    }
}

impl SceneChange {
    pub const NONE: Self = Self::empty();
}

/// Everything the renderer draws
#[derive(Debug, Clone, Default)]
pub struct SceneContent {
    pub geometry: Vec<Geometry>,
    pub ambient: Vec<AmbientLight>,
    pub directional: Vec<DirectionalLight>,
    pub point: Vec<PointLight>,
}

/// Per-frame scene update, called with the frame time in milliseconds
pub type SceneUpdate = Box<dyn FnMut(&mut SceneContent, f64) -> SceneChange>;

/// The scene containing all renderable content
#[derive(Default)]
pub struct Scene {
    pub content: SceneContent,
    update: Option<SceneUpdate>,
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("content", &self.content)
            .field("update", &self.update.is_some())
            .finish()
    }
}

impl Scene {
    pub fn new(content: SceneContent) -> Self {
        Self {
            content,
            update: None,
        }
    }

    pub fn with_update(
        mut self,
        update: impl FnMut(&mut SceneContent, f64) -> SceneChange + 'static,
    ) -> Self {
        self.update = Some(Box::new(update));
        self
    }

    /// Run the update callback, if any
    pub fn update(&mut self, time: f64) -> SceneChange {
        match self.update.as_mut() {
            Some(update) => update(&mut self.content, time),
            None => SceneChange::NONE,
        }
    }

    /// An `extent` x `extent` grid of instanced cubes on the XZ plane, lit by
    /// a dim ambient light and a white directional light.
    pub fn debug_grid(backend: &mut dyn GraphicsBackend, extent: u32) -> BackendResult<Self> {
        let cube = Mesh::cube().upload(backend)?;
        let extent = extent.max(1);
        let half = (extent as f32 - 1.0) * 0.5;

        let mut instances = Vec::with_capacity((extent * extent) as usize);
        for z in 0..extent {
            for x in 0..extent {
                let position = Vec3::new(x as f32 - half, 0.0, z as f32 - half) * 1.5;
                let u = x as f32 / extent as f32;
                let v = z as f32 / extent as f32;
                instances.push(InstanceData::new(
                    Mat4::from_translation(position) * Mat4::from_scale(Vec3::splat(0.75)),
                    Vec4::new(0.4 + 0.6 * u, 0.5, 0.4 + 0.6 * v, 1.0),
                ));
            }
        }
        let instances = InstanceBuffer::upload(backend, &instances)?;

        let content = SceneContent {
            geometry: vec![Geometry::new(cube)
                .with_instances(instances)
                .with_color_mode(ColorMode::Multiplicative)],
            ambient: vec![AmbientLight::new(Vec3::ONE, 0.1)],
            directional: vec![DirectionalLight::new(
                Vec3::new(-2.0, -5.0, -1.0),
                Vec3::ONE,
                1.0,
            )],
            point: Vec::new(),
        };
        log::debug!("Built debug grid scene with {} instances", extent * extent);
        Ok(Self::new(content))
    }
}
