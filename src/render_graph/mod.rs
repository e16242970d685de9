//! Render graph orchestration primitives
//!
//! The pass contract, dirty tracking and the full-screen triangle shared by
//! screen-space passes. The renderer wires these into a fixed pipeline.

pub mod dirty;
pub mod fullscreen;
pub mod pass;

pub use dirty::*;
pub use fullscreen::*;
pub use pass::*;
