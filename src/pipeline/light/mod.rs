//! Light shading passes
//!
//! Each light type renders into its own attachment. The light count is
//! compiled into the program as `DATA_SIZE` (at least 1) together with an
//! `ENABLED` flag that is false when there are no lights. A count change
//! recompiles the program lazily at the next `prepare()`; the same count only
//! rewrites the light data.

mod block;
mod fullscreen;
mod point;

pub use block::*;
pub use fullscreen::*;
pub use point::*;

use crate::backend::ProgramKind;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LightDirty: u32 {
        /// Light count differs from the compiled variant
        const PROGRAM = 1 << 0;
        const DATA = 1 << 1;
        const UNITS = 1 << 2;
        const TEXTURES = 1 << 3;
        const VIEW_PROJECTION = 1 << 4;
        const VIEW_INVERSE = 1 << 5;
        const NDC_OFFSET = 1 << 6;
    }
}

/// Identifies one compiled specialization of a light program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub kind: ProgramKind,
    pub count: usize,
}

/// `DATA_SIZE` and `ENABLED` defines for `count` lights
pub fn light_defines(count: usize) -> Vec<(String, String)> {
    vec![
        ("DATA_SIZE".to_string(), format!("{}u", count.max(1))),
        ("ENABLED".to_string(), (count > 0).to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_defines() {
        assert_eq!(
            light_defines(0),
            vec![
                ("DATA_SIZE".to_string(), "1u".to_string()),
                ("ENABLED".to_string(), "false".to_string()),
            ]
        );
        assert_eq!(light_defines(7)[0].1, "7u");
        assert_eq!(light_defines(7)[1].1, "true");
    }
}
