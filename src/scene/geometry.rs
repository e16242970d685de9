//! Drawable geometry entries

use glam::Mat4;

use crate::resources::{InstanceBuffer, MeshBuffers};

/// How the base vertex color and the per-instance color combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorMode {
    #[default]
    BaseOnly,
    InstanceOnly,
    Additive,
    Multiplicative,
}

impl ColorMode {
    /// Value of the `u_colorMode` uniform
    pub fn as_uniform(self) -> i32 {
        match self {
            ColorMode::BaseOnly => 0,
            ColorMode::InstanceOnly => 1,
            ColorMode::Additive => 2,
            ColorMode::Multiplicative => 3,
        }
    }
}

/// One drawable: a base mesh, optionally instanced, with an optional model matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub mesh: MeshBuffers,
    pub instances: Option<InstanceBuffer>,
    /// Identity when absent
    pub model: Option<Mat4>,
    pub color_mode: ColorMode,
}

impl Geometry {
    pub fn new(mesh: MeshBuffers) -> Self {
        Self {
            mesh,
            instances: None,
            model: None,
            color_mode: ColorMode::BaseOnly,
        }
    }

    pub fn with_instances(mut self, instances: InstanceBuffer) -> Self {
        self.instances = Some(instances);
        self
    }

    pub fn with_model(mut self, model: Mat4) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_color_mode(mut self, color_mode: ColorMode) -> Self {
        self.color_mode = color_mode;
        self
    }

    pub fn is_instanced(&self) -> bool {
        self.instances.is_some()
    }

    pub fn model_matrix(&self) -> Mat4 {
        self.model.unwrap_or(Mat4::IDENTITY)
    }

    /// Color mode actually drawn; non-instanced entries have no instance color
    pub fn effective_color_mode(&self) -> ColorMode {
        if self.is_instanced() {
            self.color_mode
        } else {
            ColorMode::BaseOnly
        }
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.map_or(1, |instances| instances.count)
    }
}
