//! CPU implementations of the pipeline programs.
//!
//! Each [`ProgramKind`] mirrors the WGSL program of the same pass; keep the two
//! in step when either changes.

use std::collections::HashMap;

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

use crate::backend::traits::TextureHandle;
use crate::backend::types::{ProgramKind, UniformValue};

use super::raster::{ClipVertex, Varyings};
use super::{SoftProgram, SoftTexture};

/// Maximum number of fragment outputs (G-buffer attachments)
pub(crate) const MAX_OUTPUTS: usize = 5;

pub(crate) type Outputs = [Option<Vec4>; MAX_OUTPUTS];

/// Vertex attributes by shader location
pub(crate) type VertexInputs = [Vec4; 8];

/// Read-only view of everything a program can access while it runs
pub(crate) struct ShaderEnv<'a> {
    pub program: &'a SoftProgram,
    pub textures: &'a HashMap<u64, SoftTexture>,
    pub units: &'a HashMap<u32, TextureHandle>,
    pub block: Option<&'a [u8]>,
}

impl ShaderEnv<'_> {
    fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.program.uniforms.get(name).copied()
    }

    fn int(&self, name: &str) -> i32 {
        match self.uniform(name) {
            Some(UniformValue::Int(v)) => v,
            _ => 0,
        }
    }

    fn float(&self, name: &str) -> f32 {
        match self.uniform(name) {
            Some(UniformValue::Float(v)) => v,
            _ => 0.0,
        }
    }

    fn vec2(&self, name: &str) -> Vec4 {
        match self.uniform(name) {
            Some(UniformValue::Vec2([x, y])) => Vec4::new(x, y, 0.0, 0.0),
            _ => Vec4::ZERO,
        }
    }

    fn vec4(&self, name: &str) -> Vec4 {
        match self.uniform(name) {
            Some(UniformValue::Vec4(v)) => Vec4::from_array(v),
            _ => Vec4::ZERO,
        }
    }

    fn mat4(&self, name: &str) -> Mat4 {
        match self.uniform(name) {
            Some(UniformValue::Mat4(m)) => Mat4::from_cols_array(&m),
            _ => Mat4::ZERO,
        }
    }

    /// Texel fetch through a sampler uniform; out-of-range reads return zero
    fn texel(&self, sampler: &str, x: i64, y: i64) -> Vec4 {
        let unit = self.int(sampler) as u32;
        let Some(texture) = self
            .units
            .get(&unit)
            .and_then(|handle| self.textures.get(&handle.0))
        else {
            return Vec4::ZERO;
        };
        texture.load(x, y)
    }

    /// `index`-th vec4 of the bound uniform block
    fn block_vec4(&self, index: usize) -> Vec4 {
        let Some(block) = self.block else {
            return Vec4::ZERO;
        };
        let start = index * 16;
        match block.get(start..start + 16) {
            Some(bytes) => Vec4::from_array(bytemuck::pod_read_unaligned::<[f32; 4]>(bytes)),
            None => Vec4::ZERO,
        }
    }

    fn light_count(&self) -> usize {
        if self.program.enabled {
            self.program.data_size as usize
        } else {
            0
        }
    }
}

fn normalize_or_zero(v: Vec3) -> Vec3 {
    v.try_normalize().unwrap_or(Vec3::ZERO)
}

/// Vertex stage
pub(crate) fn vertex(kind: ProgramKind, env: &ShaderEnv, input: &VertexInputs) -> ClipVertex {
    match kind {
        ProgramKind::Geometry => geometry_vertex(env, input),
        ProgramKind::PointLight => point_light_vertex(env, input),
        ProgramKind::AmbientLight
        | ProgramKind::DirectionalLight
        | ProgramKind::LightMerge
        | ProgramKind::Accumulate
        | ProgramKind::Blit => ClipVertex::new(Vec4::new(input[0].x, input[0].y, 0.0, 1.0)),
    }
}

/// Fragment stage; `None` discards the fragment
pub(crate) fn fragment(
    kind: ProgramKind,
    env: &ShaderEnv,
    x: u32,
    y: u32,
    varyings: &Varyings,
) -> Option<Outputs> {
    let (x, y) = (x as i64, y as i64);
    let mut out: Outputs = [None; MAX_OUTPUTS];
    match kind {
        ProgramKind::Geometry => {
            out[0] = Some(varyings[4]);
            out[1] = Some(varyings[0].xyz().extend(1.0));
            out[2] = Some(normalize_or_zero(varyings[1].xyz()).extend(1.0));
            out[3] = Some(varyings[2].xyz().extend(1.0));
            out[4] = Some(normalize_or_zero(varyings[3].xyz()).extend(1.0));
        }
        ProgramKind::AmbientLight => {
            let position = env.texel("u_position", x, y);
            let mut sum = Vec3::ZERO;
            if position.w > 0.0 {
                for i in 0..env.light_count() {
                    let color = env.block_vec4(i);
                    sum += color.xyz() * color.w;
                }
            }
            out[0] = Some(sum.extend(1.0));
        }
        ProgramKind::DirectionalLight => {
            let position = env.texel("u_position", x, y);
            let normal = normalize_or_zero(env.texel("u_normal", x, y).xyz());
            let mut sum = Vec3::ZERO;
            if position.w > 0.0 {
                for i in 0..env.light_count() {
                    let direction = env.block_vec4(i * 2).xyz();
                    let color = env.block_vec4(i * 2 + 1);
                    let to_light = -normalize_or_zero(direction);
                    sum += normal.dot(to_light).max(0.0) * color.xyz() * color.w;
                }
            }
            out[0] = Some(sum.extend(1.0));
        }
        ProgramKind::PointLight => {
            if !env.program.enabled {
                return None;
            }
            let position = env.texel("u_position", x, y);
            if position.w <= 0.0 {
                return None;
            }
            let light = varyings[0];
            let color = varyings[1];
            let to_light = light.xyz() - position.xyz();
            let distance = to_light.length();
            if distance >= light.w {
                return None;
            }
            let normal = normalize_or_zero(env.texel("u_normal", x, y).xyz());
            let direction = if distance > 0.0 {
                to_light / distance
            } else {
                normal
            };
            let falloff = 1.0 - distance / light.w;
            let diffuse = normal.dot(direction).max(0.0);
            out[0] = Some((color.xyz() * color.w * falloff * falloff * diffuse).extend(1.0));
        }
        ProgramKind::LightMerge => {
            let albedo = env.texel("u_color", x, y);
            if albedo.w <= 0.0 {
                out[0] = Some(env.vec4("u_background"));
            } else {
                let light = env.texel("u_ambient", x, y).xyz()
                    + env.texel("u_directional", x, y).xyz()
                    + env.texel("u_point", x, y).xyz();
                let shaded = (albedo.xyz() * light).clamp(Vec3::ZERO, Vec3::ONE);
                out[0] = Some(shaded.extend(1.0));
            }
        }
        ProgramKind::Accumulate => {
            let merged = env.texel("u_merged", x, y);
            out[0] = Some(merged.xyz().extend(env.float("u_alpha")));
        }
        ProgramKind::Blit => {
            let scale = env.vec2("u_sourceScale");
            let sx = ((x as f32 + 0.5) * scale.x).floor() as i64;
            let sy = ((y as f32 + 0.5) * scale.y).floor() as i64;
            out[0] = Some(env.texel("u_source", sx, sy).xyz().extend(1.0));
        }
    }
    Some(out)
}

fn geometry_vertex(env: &ShaderEnv, input: &VertexInputs) -> ClipVertex {
    let instanced = env.int("u_instanced") != 0;
    let instance = if instanced {
        Mat4::from_cols(input[3], input[4], input[5], input[6])
    } else {
        Mat4::IDENTITY
    };
    let model = env.mat4("u_model") * instance;
    let view = env.mat4("u_view");

    let world = model * input[0].xyz().extend(1.0);
    let world_normal = normalize_or_zero((model * input[1].xyz().extend(0.0)).xyz());
    let view_position = view * world;
    let view_normal = normalize_or_zero((view * world_normal.extend(0.0)).xyz());

    let mut clip = env.mat4("u_projection") * view_position;
    let offset = env.vec2("u_ndcOffset");
    clip.x += offset.x * clip.w;
    clip.y += offset.y * clip.w;

    let base = input[2];
    let tint = input[7];
    let color = match env.int("u_colorMode") {
        1 => tint,
        2 => base + tint,
        3 => base * tint,
        _ => base,
    };

    let mut out = ClipVertex::new(clip);
    out.varyings = [
        world,
        world_normal.extend(0.0),
        view_position,
        view_normal.extend(0.0),
        color,
    ];
    out
}

fn point_light_vertex(env: &ShaderEnv, input: &VertexInputs) -> ClipVertex {
    let corner = input[0];
    let light = input[1];
    let view_inverse = env.mat4("u_viewInverse");
    let right = view_inverse.x_axis.xyz();
    let up = view_inverse.y_axis.xyz();
    let world = light.xyz() + (right * corner.x + up * corner.y) * light.w;

    let mut clip = env.mat4("u_viewProjection") * world.extend(1.0);
    let offset = env.vec2("u_ndcOffset");
    clip.x += offset.x * clip.w;
    clip.y += offset.y * clip.w;

    let mut out = ClipVertex::new(clip);
    out.varyings[0] = light;
    out.varyings[1] = input[2];
    out
}
