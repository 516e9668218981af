use image::GrayImage;
use nalgebra::Vector2;

use crate::img::bilinear_sample_luma;

/// Patches with less intensity variance than this carry no texture to
/// correlate against.
const MIN_VARIANCE: f32 = 1e-3;

/// Square template of side `2 * radius + 1`, stored zero-mean.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    radius: usize,
    values: Vec<f32>,
    /// Sqrt of the sum of squared zero-mean values.
    energy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchMatch {
    pub position: Vector2<f32>,
    /// Normalized cross-correlation in [-1, 1].
    pub score: f32,
}

impl Patch {
    /// Samples the template centred on `center`; `None` when the window
    /// leaves the image or is textureless.
    pub fn extract(image: &GrayImage, center: Vector2<f32>, radius: usize) -> Option<Self> {
        if !window_inside(image, center, radius as f32) {
            return None;
        }
        let side = radius * 2 + 1;
        let r = radius as f32;
        let mut values = Vec::with_capacity(side * side);
        for dy in 0..side {
            for dx in 0..side {
                values.push(bilinear_sample_luma(
                    image,
                    center.x - r + dx as f32,
                    center.y - r + dy as f32,
                ));
            }
        }
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let mut energy = 0.0f32;
        for v in values.iter_mut() {
            *v -= mean;
            energy += *v * *v;
        }
        if energy / n < MIN_VARIANCE {
            return None;
        }
        Some(Self {
            radius,
            values,
            energy: energy.sqrt(),
        })
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    pub fn side(&self) -> usize {
        self.radius * 2 + 1
    }

    /// Exhaustive NCC over integer offsets within `search_radius` of
    /// `center`, refined to sub-pixel precision with a parabola fit through
    /// the peak and its neighbours. `None` when no offset keeps the window
    /// inside the image.
    pub fn search(&self, image: &GrayImage, center: Vector2<f32>, search_radius: usize) -> Option<PatchMatch> {
        let side = self.side();
        let span = search_radius * 2 + 1;
        let region_side = span + side - 1;
        let origin = Vector2::new(
            center.x - (search_radius + self.radius) as f32,
            center.y - (search_radius + self.radius) as f32,
        );

        // Sample the whole search region once; offsets then index into it.
        let mut region = Vec::with_capacity(region_side * region_side);
        for y in 0..region_side {
            for x in 0..region_side {
                region.push(bilinear_sample_luma(image, origin.x + x as f32, origin.y + y as f32));
            }
        }

        let mut scores = vec![f32::NEG_INFINITY; span * span];
        let mut best: Option<(usize, usize, f32)> = None;
        for oy in 0..span {
            for ox in 0..span {
                let candidate = Vector2::new(
                    center.x + ox as f32 - search_radius as f32,
                    center.y + oy as f32 - search_radius as f32,
                );
                if !window_inside(image, candidate, self.radius as f32) {
                    continue;
                }
                let score = self.correlate(&region, region_side, ox, oy);
                scores[oy * span + ox] = score;
                if best.is_none_or(|(_, _, s)| score > s) {
                    best = Some((ox, oy, score));
                }
            }
        }

        let (ox, oy, score) = best?;
        let at = |x: usize, y: usize| scores[y * span + x];
        let sub_x = if ox > 0 && ox + 1 < span {
            parabola_peak(at(ox - 1, oy), score, at(ox + 1, oy))
        } else {
            0.0
        };
        let sub_y = if oy > 0 && oy + 1 < span {
            parabola_peak(at(ox, oy - 1), score, at(ox, oy + 1))
        } else {
            0.0
        };

        Some(PatchMatch {
            position: Vector2::new(
                center.x + ox as f32 - search_radius as f32 + sub_x,
                center.y + oy as f32 - search_radius as f32 + sub_y,
            ),
            score,
        })
    }

    fn correlate(&self, region: &[f32], region_side: usize, ox: usize, oy: usize) -> f32 {
        let side = self.side();
        let n = (side * side) as f32;
        let mut sum = 0.0f32;
        for y in 0..side {
            let row = &region[(oy + y) * region_side + ox..][..side];
            sum += row.iter().sum::<f32>();
        }
        let mean = sum / n;

        let mut cross = 0.0f32;
        let mut energy = 0.0f32;
        for y in 0..side {
            let row = &region[(oy + y) * region_side + ox..][..side];
            let template = &self.values[y * side..][..side];
            for (w, t) in row.iter().zip(template) {
                let w = w - mean;
                cross += w * t;
                energy += w * w;
            }
        }
        if energy / n < MIN_VARIANCE {
            return 0.0;
        }
        cross / (energy.sqrt() * self.energy)
    }
}

/// Vertex offset of the parabola through three equally spaced samples,
/// clamped to half a pixel.
fn parabola_peak(left: f32, center: f32, right: f32) -> f32 {
    if !left.is_finite() || !right.is_finite() {
        return 0.0;
    }
    let denom = left - 2.0 * center + right;
    if denom.abs() < f32::EPSILON {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}

fn window_inside(image: &GrayImage, center: Vector2<f32>, radius: f32) -> bool {
    center.x - radius >= 0.0
        && center.y - radius >= 0.0
        && center.x + radius <= image.width().saturating_sub(1) as f32
        && center.y + radius <= image.height().saturating_sub(1) as f32
}
