//! Deferred rendering pipeline
//!
//! The fixed pass sequence driven by the renderer:
//! 1. Geometry - rasterizes the scene into the G-buffer
//! 2. Ambient, directional and point light passes - one attachment each
//! 3. Light merge - albedo times summed light
//! 4. Accumulate - TAA running average
//! 5. Blit - selected attachment to the canvas

pub mod accumulate_pass;
pub mod blit_pass;
pub mod geometry_pass;
pub mod light;
pub mod merge_pass;

pub use accumulate_pass::AccumulatePass;
pub use blit_pass::BlitPass;
pub use geometry_pass::GeometryPass;
pub use light::{AmbientLightPass, DirectionalLightPass, PointLightPass};
pub use merge_pass::{LightMergePass, MergeInputs};
