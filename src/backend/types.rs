//! Common types shared between backends

use std::collections::HashMap;

use bitflags::bitflags;

use crate::backend::traits::{BufferHandle, TextureHandle};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    /// Formats whose stored values are clamped to `[0, 1]` and quantized to 8 bits.
    pub fn is_unorm8(&self) -> bool {
        matches!(
            self,
            TextureFormat::Rgba8Unorm
                | TextureFormat::Rgba8UnormSrgb
                | TextureFormat::Bgra8Unorm
                | TextureFormat::Bgra8UnormSrgb
        )
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// Texture usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const COPY_DST = 1 << 6;
    }
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::RENDER_ATTACHMENT,
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Sint32,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Sint32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Vertex buffer layout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexStepMode {
    Vertex,
    Instance,
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Blend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend component state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl Default for BlendComponent {
    fn default() -> Self {
        Self {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            operation: BlendOperation::Add,
        }
    }
}

/// Blend state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    /// `SRC_ALPHA`, `ONE_MINUS_SRC_ALPHA` on color.
    pub fn alpha_blending() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::SrcAlpha,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
        }
    }

    pub fn additive() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::One,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent::default(),
        }
    }
}

/// Value written to a named program uniform
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec2([f32; 2]),
    Vec4([f32; 4]),
    Mat4([f32; 16]),
}

impl UniformValue {
    pub fn uniform_type(&self) -> UniformType {
        match self {
            UniformValue::Int(_) => UniformType::Int,
            UniformValue::Float(_) => UniformType::Float,
            UniformValue::Vec2(_) => UniformType::Vec2,
            UniformValue::Vec4(_) => UniformType::Vec4,
            UniformValue::Mat4(_) => UniformType::Mat4,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            UniformValue::Int(v) => v.to_ne_bytes().to_vec(),
            UniformValue::Float(v) => v.to_ne_bytes().to_vec(),
            UniformValue::Vec2(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::Vec4(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::Mat4(v) => bytemuck::cast_slice(v).to_vec(),
        }
    }
}

impl From<glam::Mat4> for UniformValue {
    fn from(m: glam::Mat4) -> Self {
        UniformValue::Mat4(m.to_cols_array())
    }
}

impl From<glam::Vec2> for UniformValue {
    fn from(v: glam::Vec2) -> Self {
        UniformValue::Vec2(v.to_array())
    }
}

impl From<glam::Vec4> for UniformValue {
    fn from(v: glam::Vec4) -> Self {
        UniformValue::Vec4(v.to_array())
    }
}

/// Declared type of a program uniform.
///
/// `Sampler` uniforms hold a texture unit; every other type lives in the
/// program's uniform struct, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    Int,
    Float,
    Vec2,
    Vec4,
    Mat4,
    Sampler,
}

impl UniformType {
    /// (alignment, size) under WGSL uniform address space rules
    pub fn align_size(&self) -> (u64, u64) {
        match self {
            UniformType::Int | UniformType::Float => (4, 4),
            UniformType::Vec2 => (8, 8),
            UniformType::Vec4 => (16, 16),
            UniformType::Mat4 => (16, 64),
            UniformType::Sampler => (0, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniformDecl {
    pub name: String,
    pub ty: UniformType,
}

impl UniformDecl {
    pub fn new(name: &str, ty: UniformType) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}

/// Byte layout of a program's uniform struct
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UniformLayout {
    pub offsets: HashMap<String, (u64, UniformType)>,
    /// Texture binding index per sampler uniform name
    pub samplers: HashMap<String, u32>,
    pub size: u64,
}

impl UniformLayout {
    pub fn new(decls: &[UniformDecl]) -> Self {
        let mut layout = Self::default();
        let mut offset = 0u64;
        let mut max_align = 16u64;
        for decl in decls {
            if decl.ty == UniformType::Sampler {
                let binding = layout.samplers.len() as u32;
                layout.samplers.insert(decl.name.clone(), binding);
                continue;
            }
            let (align, size) = decl.ty.align_size();
            max_align = max_align.max(align);
            offset = offset.div_ceil(align) * align;
            layout.offsets.insert(decl.name.clone(), (offset, decl.ty));
            offset += size;
        }
        layout.size = offset.div_ceil(max_align) * max_align;
        layout
    }
}

/// Fixed set of programs the pipeline knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Geometry,
    AmbientLight,
    DirectionalLight,
    PointLight,
    LightMerge,
    Accumulate,
    Blit,
}

/// Description of a program to compile
#[derive(Debug, Clone)]
pub struct ProgramDescriptor {
    pub label: String,
    pub kind: ProgramKind,
    /// WGSL source with `vs_main` / `fs_main` entry points
    pub source: String,
    /// `const NAME: T = value;` lines rewritten before compilation
    pub defines: Vec<(String, String)>,
    pub uniforms: Vec<UniformDecl>,
    /// Whether the program reads a uniform block at group 2
    pub uniform_block: bool,
}

impl ProgramDescriptor {
    pub fn define(&self, name: &str) -> Option<&str> {
        self.defines
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Source text with every define applied
    pub fn processed_source(&self) -> String {
        let mut source = self.source.clone();
        for (key, value) in &self.defines {
            source = replace_define(&source, key, value);
        }
        source
    }
}

/// Rewrites the value of `const KEY: T = ...;` declarations.
pub fn replace_define(source: &str, key: &str, value: &str) -> String {
    let prefix = format!("const {}:", key);
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with(&prefix) {
            if let (Some(eq), Some(semi)) = (line.find('='), line.rfind(';')) {
                if eq < semi {
                    out.push_str(&line[..=eq]);
                    out.push(' ');
                    out.push_str(value);
                    out.push_str(&line[semi..]);
                    out.push('\n');
                    continue;
                }
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Framebuffer descriptor: `(slot, texture)` pairs plus optional depth
#[derive(Debug, Clone)]
pub struct FramebufferDescriptor {
    pub label: Option<String>,
    pub color_attachments: Vec<(u32, TextureHandle)>,
    pub depth_attachment: Option<TextureHandle>,
}

/// One vertex buffer bound into a vertex array
#[derive(Debug, Clone)]
pub struct VertexBufferBinding {
    pub buffer: BufferHandle,
    pub layout: VertexBufferLayout,
}

/// Vertex array descriptor
#[derive(Debug, Clone)]
pub struct VertexArrayDescriptor {
    pub label: Option<String>,
    pub buffers: Vec<VertexBufferBinding>,
    pub index_buffer: Option<(BufferHandle, IndexFormat)>,
}

/// Features the renderer requires from a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub float_render_targets: bool,
    pub max_color_attachments: u32,
    pub max_texture_dimension: u32,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            float_render_targets: true,
            max_color_attachments: 8,
            max_texture_dimension: 8192,
        }
    }
}

/// Call counters, used to observe redundant state changes
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    pub uniform_uploads: HashMap<String, usize>,
    pub program_compilations: usize,
    pub buffer_writes: usize,
    pub draw_calls: usize,
    pub clears: usize,
}

impl BackendStats {
    pub fn uniform_uploads(&self, name: &str) -> usize {
        self.uniform_uploads.get(name).copied().unwrap_or(0)
    }

    pub(crate) fn record_uniform(&mut self, name: &str) {
        *self.uniform_uploads.entry(name.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_define() {
        let source = "const DATA_SIZE: u32 = 1u;\nconst ENABLED: bool = true;\nfn main() {}\n";
        let out = replace_define(source, "DATA_SIZE", "4u");
        assert!(out.contains("const DATA_SIZE: u32 = 4u;"));
        assert!(out.contains("const ENABLED: bool = true;"));

        let out = replace_define(&out, "ENABLED", "false");
        assert!(out.contains("const ENABLED: bool = false;"));
        assert!(out.contains("fn main() {}"));
    }

    #[test]
    fn test_replace_define_leaves_unknown_keys() {
        let source = "const DATA_SIZE_MAX: u32 = 8u;\n";
        assert_eq!(replace_define(source, "DATA_SIZE", "2u"), source);
    }

    #[test]
    fn test_usage_flags() {
        let usage = BufferUsage::VERTEX | BufferUsage::COPY_DST;
        assert!(usage.contains(BufferUsage::VERTEX));
        assert!(!usage.contains(BufferUsage::INDEX));
        assert!(!usage.contains(BufferUsage::VERTEX | BufferUsage::UNIFORM));

        let desc = TextureDescriptor::default();
        assert!(desc.usage.contains(TextureUsage::RENDER_ATTACHMENT));
        assert!(!desc.usage.contains(TextureUsage::COPY_DST));
    }

    #[test]
    fn test_uniform_layout() {
        let layout = UniformLayout::new(&[
            UniformDecl::new("u_model", UniformType::Mat4),
            UniformDecl::new("u_ndcOffset", UniformType::Vec2),
            UniformDecl::new("u_instanced", UniformType::Int),
            UniformDecl::new("u_albedo", UniformType::Sampler),
            UniformDecl::new("u_colorMode", UniformType::Int),
            UniformDecl::new("u_tint", UniformType::Vec4),
        ]);
        assert_eq!(layout.offsets["u_model"].0, 0);
        assert_eq!(layout.offsets["u_ndcOffset"].0, 64);
        assert_eq!(layout.offsets["u_instanced"].0, 72);
        assert_eq!(layout.offsets["u_colorMode"].0, 76);
        assert_eq!(layout.offsets["u_tint"].0, 80);
        assert_eq!(layout.size, 96);
        assert_eq!(layout.samplers["u_albedo"], 0);
    }

    #[test]
    fn test_empty_uniform_layout() {
        let layout = UniformLayout::new(&[UniformDecl::new("u_position", UniformType::Sampler)]);
        assert_eq!(layout.size, 0);
        assert_eq!(layout.samplers.len(), 1);
    }
}
