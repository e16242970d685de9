//! Deferred Renderer - a real-time deferred-shading renderer with temporal anti-aliasing
//!
//! The renderer rasterizes scene geometry into a G-buffer, evaluates ambient,
//! directional and point lights in separate passes, merges them, and blends
//! Halton-jittered sub-frames into a converging history buffer.
//!
//! Two backends implement the immediate-mode [`backend::GraphicsBackend`] contract:
//! - **Software**: deterministic CPU rasterizer, always available
//! - **wgpu**: GPU backend behind the `wgpu-backend` feature (headless or windowed)
//!
//! # Features
//! - Dirty-flag driven passes that only re-upload state that changed
//! - Light passes that recompile when the light count crosses their capacity
//! - Progressive TAA that idles once the image has converged
//! - Debug views of every intermediate attachment

pub mod backend;
pub mod pipeline;
pub mod render_graph;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod taa;

#[cfg(feature = "wgpu-backend")]
pub mod window;

pub use backend::software::SoftwareBackend;
pub use renderer::{Renderer, RendererConfig};
pub use scene::{Camera, Scene};
pub use taa::TaaConfig;

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuBackend;
#[cfg(feature = "wgpu-backend")]
pub use window::Window;
