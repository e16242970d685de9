//! Triangle setup and scan conversion for the software backend.

use glam::{Vec2, Vec4};

use crate::backend::types::PrimitiveTopology;

/// Number of interpolated vec4 varyings carried per vertex
pub(crate) const MAX_VARYINGS: usize = 5;

pub(crate) type Varyings = [Vec4; MAX_VARYINGS];

/// Output of the vertex stage
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClipVertex {
    pub position: Vec4,
    pub varyings: Varyings,
}

impl ClipVertex {
    pub fn new(position: Vec4) -> Self {
        Self {
            position,
            varyings: [Vec4::ZERO; MAX_VARYINGS],
        }
    }
}

/// A fragment produced by [`rasterize_triangle`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fragment {
    pub x: u32,
    pub y: u32,
    pub depth: f32,
    pub varyings: Varyings,
}

/// Vertex index triples for `count` vertices assembled with `topology`
pub(crate) fn assemble(topology: PrimitiveTopology, count: usize) -> Vec<[usize; 3]> {
    match topology {
        PrimitiveTopology::TriangleList => (0..count / 3).map(|t| [t * 3, t * 3 + 1, t * 3 + 2]).collect(),
        PrimitiveTopology::TriangleStrip => {
            if count < 3 {
                return Vec::new();
            }
            (0..count - 2)
                .map(|i| if i % 2 == 0 { [i, i + 1, i + 2] } else { [i + 1, i, i + 2] })
                .collect()
        }
    }
}

fn edge(a: Vec2, b: Vec2, c: Vec2) -> f32 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Scan-converts one triangle over a `width` x `height` viewport.
///
/// Pixel centers sit at `+0.5`, row 0 is the top of the target. Varyings are
/// interpolated perspective-correctly; depth is the post-divide `z`, and
/// fragments outside `[0, 1]` depth are clipped. Triangles with a vertex
/// behind the eye are dropped.
pub(crate) fn rasterize_triangle(
    triangle: [&ClipVertex; 3],
    width: u32,
    height: u32,
    mut emit: impl FnMut(Fragment),
) {
    if triangle.iter().any(|v| v.position.w <= 1e-6) {
        log::trace!("SoftwareBackend: dropping triangle crossing the near plane");
        return;
    }

    let inv_w = triangle.map(|v| 1.0 / v.position.w);
    let screen = [0, 1, 2].map(|i| {
        let ndc = triangle[i].position * inv_w[i];
        Vec2::new(
            (ndc.x * 0.5 + 0.5) * width as f32,
            (0.5 - ndc.y * 0.5) * height as f32,
        )
    });
    let depth = [0, 1, 2].map(|i| triangle[i].position.z * inv_w[i]);

    let area = edge(screen[0], screen[1], screen[2]);
    if area.abs() < f32::EPSILON {
        return;
    }

    let min = screen[0].min(screen[1]).min(screen[2]);
    let max = screen[0].max(screen[1]).max(screen[2]);
    let x0 = min.x.floor().max(0.0) as u32;
    let y0 = min.y.floor().max(0.0) as u32;
    let x1 = (max.x.ceil().max(0.0) as u32).min(width);
    let y1 = (max.y.ceil().max(0.0) as u32).min(height);

    for y in y0..y1 {
        for x in x0..x1 {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let b0 = edge(screen[1], screen[2], p) / area;
            let b1 = edge(screen[2], screen[0], p) / area;
            let b2 = edge(screen[0], screen[1], p) / area;
            if b0 < 0.0 || b1 < 0.0 || b2 < 0.0 {
                continue;
            }

            let z = b0 * depth[0] + b1 * depth[1] + b2 * depth[2];
            if !(0.0..=1.0).contains(&z) {
                continue;
            }

            let w0 = b0 * inv_w[0];
            let w1 = b1 * inv_w[1];
            let w2 = b2 * inv_w[2];
            let denom = w0 + w1 + w2;
            let mut varyings = [Vec4::ZERO; MAX_VARYINGS];
            for (i, slot) in varyings.iter_mut().enumerate() {
                *slot = (triangle[0].varyings[i] * w0
                    + triangle[1].varyings[i] * w1
                    + triangle[2].varyings[i] * w2)
                    / denom;
            }

            emit(Fragment {
                x,
                y,
                depth: z,
                varyings,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fullscreen() -> [ClipVertex; 3] {
        [
            ClipVertex::new(Vec4::new(-1.0, -1.0, 0.0, 1.0)),
            ClipVertex::new(Vec4::new(3.0, -1.0, 0.0, 1.0)),
            ClipVertex::new(Vec4::new(-1.0, 3.0, 0.0, 1.0)),
        ]
    }

    #[test]
    fn test_fullscreen_triangle_covers_every_pixel() {
        let tri = fullscreen();
        let mut count = 0;
        rasterize_triangle([&tri[0], &tri[1], &tri[2]], 8, 4, |_| count += 1);
        assert_eq!(count, 32);
    }

    #[test]
    fn test_top_row_is_positive_y() {
        // Triangle covering only the upper half of NDC space
        let tri = [
            ClipVertex::new(Vec4::new(-1.0, 0.0, 0.0, 1.0)),
            ClipVertex::new(Vec4::new(3.0, 0.0, 0.0, 1.0)),
            ClipVertex::new(Vec4::new(-1.0, 4.0, 0.0, 1.0)),
        ];
        let mut rows = Vec::new();
        rasterize_triangle([&tri[0], &tri[1], &tri[2]], 4, 4, |f| rows.push(f.y));
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|&y| y < 2));
    }

    #[test]
    fn test_behind_eye_is_dropped() {
        let mut tri = fullscreen();
        tri[1].position.w = -1.0;
        let mut count = 0;
        rasterize_triangle([&tri[0], &tri[1], &tri[2]], 4, 4, |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_strip_assembly() {
        assert_eq!(
            assemble(PrimitiveTopology::TriangleStrip, 4),
            vec![[0, 1, 2], [2, 1, 3]]
        );
        assert_eq!(assemble(PrimitiveTopology::TriangleList, 7).len(), 2);
        assert!(assemble(PrimitiveTopology::TriangleStrip, 2).is_empty());
    }
}
