//! Camera system

use glam::{Mat4, Vec3};

/// Camera projection type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        height: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::perspective(65.0, 1.0, 0.125, 32.0)
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn orthographic(height: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Orthographic {
            height,
            aspect,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                height,
                aspect,
                near,
                far,
            } => {
                let half_h = height / 2.0;
                let half_w = half_h * aspect;
                Mat4::orthographic_rh(-half_w, half_w, -half_h, half_h, near, far)
            }
        }
    }

    pub fn aspect(&self) -> f32 {
        match *self {
            Projection::Perspective { aspect, .. } | Projection::Orthographic { aspect, .. } => {
                aspect
            }
        }
    }

    pub fn set_aspect(&mut self, value: f32) {
        match self {
            Projection::Perspective { aspect, .. } | Projection::Orthographic { aspect, .. } => {
                *aspect = value
            }
        }
    }
}

/// Camera for viewing the scene.
///
/// Every mutation advances [`Camera::timestamp`], which the renderer compares
/// against the last value it consumed to detect motion.
#[derive(Debug, Clone)]
pub struct Camera {
    position: Vec3,
    target: Vec3,
    up: Vec3,
    projection: Projection,
    timestamp: u64,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 1.0), Vec3::ZERO)
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            up: Vec3::Y,
            projection: Projection::default(),
            timestamp: 1,
        }
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    fn touch(&mut self) {
        self.timestamp += 1;
    }

    /// Monotonically increasing change counter
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn target(&self) -> Vec3 {
        self.target
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.target = target;
        self.touch();
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.touch();
    }

    pub fn set_up(&mut self, up: Vec3) {
        self.up = up;
        self.touch();
    }

    pub fn set_projection(&mut self, projection: Projection) {
        self.projection = projection;
        self.touch();
    }

    /// Update aspect ratio. Only an actual change counts as motion.
    pub fn set_aspect(&mut self, aspect: f32) {
        if self.projection.aspect() != aspect {
            self.projection.set_aspect(aspect);
            self.touch();
        }
    }

    pub fn aspect(&self) -> f32 {
        self.projection.aspect()
    }

    /// Get the view matrix
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Get the projection matrix
    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }

    /// View, projection, their product and the three inverses
    pub fn matrices(&self) -> CameraMatrices {
        CameraMatrices::new(self.view_matrix(), self.projection_matrix())
    }
}

/// Matrices pushed to camera-consuming passes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub view_inverse: Mat4,
    pub projection_inverse: Mat4,
    pub view_projection_inverse: Mat4,
}

impl CameraMatrices {
    pub fn new(view: Mat4, projection: Mat4) -> Self {
        let view_projection = projection * view;
        Self {
            view,
            projection,
            view_projection,
            view_inverse: view.inverse(),
            projection_inverse: projection.inverse(),
            view_projection_inverse: view_projection.inverse(),
        }
    }
}

impl Default for CameraMatrices {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Mat4::IDENTITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutations_advance_timestamp() {
        let mut camera = Camera::default();
        let start = camera.timestamp();
        camera.set_position(Vec3::new(0.0, 1.0, 3.0));
        assert!(camera.timestamp() > start);

        let after_move = camera.timestamp();
        camera.look_at(Vec3::X);
        assert!(camera.timestamp() > after_move);
    }

    #[test]
    fn test_same_aspect_is_not_motion() {
        let mut camera = Camera::default();
        camera.set_aspect(2.0);
        let stamp = camera.timestamp();
        camera.set_aspect(2.0);
        assert_eq!(camera.timestamp(), stamp);
        assert_eq!(camera.aspect(), 2.0);
    }

    #[test]
    fn test_matrices_are_consistent() {
        let camera = Camera::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO);
        let m = camera.matrices();
        assert!(m
            .view_projection
            .abs_diff_eq(m.projection * m.view, 1e-5));
        assert!((m.view * m.view_inverse).abs_diff_eq(Mat4::IDENTITY, 1e-4));
        assert!((m.view_projection * m.view_projection_inverse).abs_diff_eq(Mat4::IDENTITY, 1e-3));
        assert!(m
            .view_inverse
            .w_axis
            .truncate()
            .abs_diff_eq(camera.position(), 1e-4));
    }
}
