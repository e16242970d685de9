//! Temporal anti-aliasing state
//!
//! Sub-pixel jitter comes from a 2-D Halton sequence. Each sub-frame is
//! rendered with its jitter and blended into a running mean; after
//! `frame_count` samples the image has converged and rendering goes idle
//! until something resets the sequence.

use glam::Vec2;

/// TAA settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaaConfig {
    pub enabled: bool,
    /// Number of samples accumulated before going idle
    pub frame_count: u32,
    /// Coprime Halton bases for the x and y jitter
    pub halton_bases: (u32, u32),
}

impl Default for TaaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_count: 64,
            halton_bases: (2, 3),
        }
    }
}

/// First `count` elements of the Halton sequence in `base`, after skipping
/// `skip` elements. Bases below 2 produce zeros.
pub fn halton1d(base: u32, count: usize, skip: usize) -> Vec<f32> {
    if base < 2 {
        return vec![0.0; count];
    }
    let base = base as u64;
    let mut values = Vec::with_capacity(count);
    let mut numerator: u64 = 0;
    let mut denominator: u64 = 1;
    for i in 0..count + skip {
        let diff = denominator - numerator;
        if diff == 1 {
            numerator = 1;
            denominator *= base;
        } else {
            let mut ratio = denominator / base;
            while diff <= ratio {
                ratio /= base;
            }
            numerator = (base + 1) * ratio - diff;
        }
        if i >= skip {
            values.push((numerator as f64 / denominator as f64) as f32);
        }
    }
    values
}

/// Two Halton sequences zipped into points of the unit square
pub fn halton2d(base_x: u32, base_y: u32, count: usize, skip: usize) -> Vec<Vec2> {
    halton1d(base_x, count, skip)
        .into_iter()
        .zip(halton1d(base_y, count, skip))
        .map(|(x, y)| Vec2::new(x, y))
        .collect()
}

/// Sub-frame counter and jitter sequence
#[derive(Debug, Clone)]
pub struct TaaState {
    config: TaaConfig,
    frame: u32,
    jitter: Vec<Vec2>,
}

impl TaaState {
    pub fn new(config: TaaConfig) -> Self {
        let mut state = Self {
            config,
            frame: 0,
            jitter: Vec::new(),
        };
        state.regenerate();
        state
    }

    pub fn config(&self) -> &TaaConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn frame_count(&self) -> u32 {
        self.config.frame_count
    }

    pub fn jitter(&self) -> &[Vec2] {
        &self.jitter
    }

    /// Returns whether the value changed
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        let changed = self.config.enabled != enabled;
        self.config.enabled = enabled;
        changed
    }

    /// Returns whether the value changed. At least one sample is kept.
    pub fn set_frame_count(&mut self, frame_count: u32) -> bool {
        let frame_count = frame_count.max(1);
        let changed = self.config.frame_count != frame_count;
        self.config.frame_count = frame_count;
        changed
    }

    /// Returns whether the value changed
    pub fn set_halton_bases(&mut self, bases: (u32, u32)) -> bool {
        let changed = self.config.halton_bases != bases;
        self.config.halton_bases = bases;
        changed
    }

    /// Rebuild the jitter sequence from the current bases and count
    pub fn regenerate(&mut self) {
        let (x, y) = self.config.halton_bases;
        self.jitter = halton2d(x, y, self.config.frame_count.max(1) as usize, 0);
        log::debug!(
            "TAA: generated {} jitter samples with bases ({}, {})",
            self.jitter.len(),
            x,
            y
        );
    }

    /// Restart accumulation
    pub fn reset(&mut self) {
        self.frame = 0;
    }

    /// NDC offset of the current sub-frame for a target of `size` pixels.
    /// The first sub-frame, and every frame with TAA disabled, is unjittered.
    pub fn ndc_offset(&self, size: (u32, u32)) -> Vec2 {
        if !self.config.enabled || self.frame == 0 || self.jitter.is_empty() {
            return Vec2::ZERO;
        }
        let sample = self.jitter[self.frame as usize % self.jitter.len()];
        let size = Vec2::new(size.0.max(1) as f32, size.1.max(1) as f32);
        (sample - Vec2::splat(0.5)) * 2.0 / size
    }

    /// Move to the next sub-frame after a draw. Returns whether more
    /// sub-frames remain to be rendered.
    pub fn advance(&mut self) -> bool {
        if !self.config.enabled || self.frame >= self.config.frame_count {
            return false;
        }
        self.frame += 1;
        self.frame < self.config.frame_count
    }

    pub fn is_converged(&self) -> bool {
        self.config.enabled && self.frame >= self.config.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halton_base_2() {
        assert_eq!(
            halton1d(2, 7, 0),
            vec![0.5, 0.25, 0.75, 0.125, 0.625, 0.375, 0.875]
        );
    }

    #[test]
    fn test_halton_base_3() {
        let values = halton1d(3, 4, 0);
        let expected = [1.0 / 3.0, 2.0 / 3.0, 1.0 / 9.0, 4.0 / 9.0];
        for (value, expected) in values.iter().zip(expected) {
            assert!((value - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_halton_skip() {
        assert_eq!(halton1d(2, 3, 2), vec![0.75, 0.125, 0.625]);
    }

    #[test]
    fn test_halton_degenerate_base() {
        assert_eq!(halton1d(1, 3, 0), vec![0.0; 3]);
        assert_eq!(halton1d(0, 0, 0), Vec::<f32>::new());
    }

    #[test]
    fn test_halton2d_is_deterministic() {
        let a = halton2d(2, 3, 64, 0);
        let b = halton2d(2, 3, 64, 0);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.iter().all(|p| p.x > 0.0 && p.x < 1.0 && p.y > 0.0 && p.y < 1.0));
    }

    #[test]
    fn test_first_frame_is_unjittered() {
        let mut taa = TaaState::new(TaaConfig::default());
        assert_eq!(taa.ndc_offset((64, 64)), Vec2::ZERO);
        taa.advance();
        // Second sample of (2, 3) is (0.25, 2/3)
        let offset = taa.ndc_offset((64, 64));
        assert!((offset.x - (-0.5 / 64.0)).abs() < 1e-6);
        assert!((offset.y - ((2.0 / 3.0 - 0.5) * 2.0 / 64.0)).abs() < 1e-6);
    }

    #[test]
    fn test_advance_stops_at_count() {
        let mut taa = TaaState::new(TaaConfig {
            frame_count: 3,
            ..Default::default()
        });
        assert!(taa.advance());
        assert!(taa.advance());
        assert!(!taa.advance());
        assert_eq!(taa.frame(), 3);
        assert!(taa.is_converged());
        assert!(!taa.advance());
        assert_eq!(taa.frame(), 3);
    }

    #[test]
    fn test_disabled_never_advances() {
        let mut taa = TaaState::new(TaaConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!taa.advance());
        assert_eq!(taa.frame(), 0);
        assert_eq!(taa.ndc_offset((8, 8)), Vec2::ZERO);
    }

    #[test]
    fn test_setters_report_changes() {
        let mut taa = TaaState::new(TaaConfig::default());
        assert!(!taa.set_enabled(true));
        assert!(taa.set_frame_count(16));
        assert!(!taa.set_frame_count(16));
        assert!(taa.set_halton_bases((3, 5)));
        taa.regenerate();
        assert_eq!(taa.jitter().len(), 16);
    }
}
