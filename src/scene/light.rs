//! Light types for the scene

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Uniform light applied to every covered pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientLight {
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for AmbientLight {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            intensity: 0.1,
        }
    }
}

impl AmbientLight {
    pub fn new(color: Vec3, intensity: f32) -> Self {
        Self { color, intensity }
    }

    /// Convert to GPU data format
    pub fn to_gpu_data(&self) -> AmbientLightData {
        AmbientLightData {
            color: self.color.extend(self.intensity).to_array(),
        }
    }
}

/// Directional light (like the sun)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-2.0, -5.0, -1.0).normalize(),
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: direction.normalize_or_zero(),
            color,
            intensity,
        }
    }

    /// Convert to GPU data format
    pub fn to_gpu_data(&self) -> DirectionalLightData {
        DirectionalLightData {
            direction: self.direction.extend(0.0).to_array(),
            color: self.color.extend(self.intensity).to_array(),
        }
    }
}

/// Point light with a finite radius of influence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub radius: f32,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            radius: 1.0,
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

impl PointLight {
    pub fn new(position: Vec3, radius: f32, color: Vec3, intensity: f32) -> Self {
        Self {
            position,
            radius,
            color,
            intensity,
        }
    }

    /// Convert to GPU data format
    pub fn to_gpu_data(&self) -> PointLightData {
        PointLightData {
            position: self.position.extend(self.radius).to_array(),
            color: self.color.extend(self.intensity).to_array(),
        }
    }
}

/// xyz = color, w = intensity
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AmbientLightData {
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DirectionalLightData {
    /// xyz = direction the light travels
    pub direction: [f32; 4],
    /// xyz = color, w = intensity
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PointLightData {
    /// xyz = position, w = radius
    pub position: [f32; 4],
    /// xyz = color, w = intensity
    pub color: [f32; 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_layouts() {
        assert_eq!(std::mem::size_of::<AmbientLightData>(), 16);
        assert_eq!(std::mem::size_of::<DirectionalLightData>(), 32);
        assert_eq!(std::mem::size_of::<PointLightData>(), 32);
    }

    #[test]
    fn test_directional_is_normalized() {
        let light = DirectionalLight::new(Vec3::new(-2.0, -5.0, -1.0), Vec3::ONE, 1.0);
        assert!((light.direction.length() - 1.0).abs() < 1e-6);
        let data = light.to_gpu_data();
        assert_eq!(data.color, [1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_point_packs_radius_and_intensity() {
        let light = PointLight::new(Vec3::new(1.0, 2.0, 3.0), 4.0, Vec3::X, 5.0);
        let data = light.to_gpu_data();
        assert_eq!(data.position, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(data.color, [1.0, 0.0, 0.0, 5.0]);
    }
}
