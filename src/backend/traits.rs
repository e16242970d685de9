//! Core backend abstraction traits
//!
//! These traits define the immediate-mode interface that the software and wgpu
//! backends implement. State set through the trait (bound framebuffer, program,
//! textures, blend) persists until changed, the way a GL context behaves.

use std::any::Any;
use std::ops::Range;

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("Failed to compile program {label}: {message}")]
    ShaderCompilationFailed { label: String, message: String },
    #[error("Failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Failed to read back pixels: {0}")]
    ReadbackFailed(String),
    #[error("Surface error: {0}")]
    SurfaceError(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

impl FramebufferHandle {
    /// The default framebuffer presented to the screen
    pub const CANVAS: Self = Self(0);
}

/// Handle to a compiled program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub(crate) u64);

/// Handle to a vertex array binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexArrayHandle(pub(crate) u64);

/// Main graphics backend trait
pub trait GraphicsBackend {
    /// Human-readable backend name
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities;

    fn stats(&self) -> &BackendStats;

    fn reset_stats(&mut self);

    /// Begin a new frame
    fn begin_frame(&mut self) -> BackendResult<()>;

    /// End and present the frame
    fn end_frame(&mut self) -> BackendResult<()>;

    /// Size of the default framebuffer
    fn canvas_size(&self) -> (u32, u32);

    fn resize_canvas(&mut self, width: u32, height: u32);

    // Resource creation

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Create a buffer with initial data
    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8])
        -> BackendResult<BufferHandle>;

    /// Write data to a buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Reallocate a texture's storage. The handle stays valid and keeps its bindings.
    fn resize_texture(&mut self, texture: TextureHandle, width: u32, height: u32);

    fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor)
        -> BackendResult<FramebufferHandle>;

    /// Compile a program. Failures come back as `ShaderCompilationFailed`.
    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle>;

    fn destroy_program(&mut self, program: ProgramHandle);

    fn create_vertex_array(&mut self, desc: &VertexArrayDescriptor)
        -> BackendResult<VertexArrayHandle>;

    fn destroy_vertex_array(&mut self, vertex_array: VertexArrayHandle);

    // State

    fn bind_framebuffer(&mut self, framebuffer: FramebufferHandle);

    fn set_viewport(&mut self, width: u32, height: u32);

    /// `None` disables blending
    fn set_blend(&mut self, blend: Option<BlendState>);

    fn set_depth_test(&mut self, enabled: bool);

    fn use_program(&mut self, program: Option<ProgramHandle>);

    /// Upload one named uniform of `program`
    fn set_uniform(&mut self, program: ProgramHandle, name: &str, value: UniformValue);

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>);

    fn bind_uniform_block(&mut self, buffer: Option<BufferHandle>);

    fn bind_vertex_array(&mut self, vertex_array: Option<VertexArrayHandle>);

    // Commands

    /// Clear every attachment of the bound framebuffer
    fn clear(&mut self, color: Option<[f32; 4]>, depth: Option<f32>);

    /// Draw primitives
    fn draw(&mut self, topology: PrimitiveTopology, vertices: Range<u32>, instances: u32);

    /// Draw indexed primitives
    fn draw_indexed(&mut self, topology: PrimitiveTopology, indices: Range<u32>, instances: u32);

    /// Read a rectangle of one color attachment, rows top to bottom
    fn read_pixels(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: u32,
        rect: (u32, u32, u32, u32),
    ) -> BackendResult<Vec<[f32; 4]>>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
