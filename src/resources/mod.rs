//! Resource management
//!
//! Framebuffers, meshes and instance buffers owned by the renderer or the scene.

mod framebuffer;
mod instance;
mod mesh;

pub use framebuffer::*;
pub use instance::*;
pub use mesh::*;
