use image::GrayImage;

use crate::img::bilinear_sample_luma;

pub const DESCRIPTOR_BITS: usize = 256;
pub const DESCRIPTOR_WORDS: usize = DESCRIPTOR_BITS / 32;

const PATTERN_SEED: u64 = 0xDEAD_BEEF_CAFE_BABE;

#[derive(Clone, Copy, Debug)]
struct TestPair {
    p1: (f32, f32),
    p2: (f32, f32),
}

/// Rotated BRIEF: 256 intensity comparisons inside a disc around the
/// keypoint, with the sampling pattern rotated by the intensity-centroid
/// orientation. Bit `i` lives in word `i / 32`, position `i % 32`.
#[derive(Debug, Clone)]
pub struct BriefExtractor {
    patch_radius: f32,
    pattern: Vec<TestPair>,
}

impl BriefExtractor {
    pub fn new(patch_radius: usize) -> Self {
        let patch_radius = patch_radius.max(2) as f32;
        Self {
            patch_radius,
            pattern: generate_pattern(DESCRIPTOR_BITS, patch_radius),
        }
    }

    /// Pixels a keypoint must keep from the image border so every rotated
    /// sample stays inside the image.
    pub fn border(&self) -> u32 {
        (self.patch_radius * std::f32::consts::SQRT_2).ceil() as u32 + 1
    }

    pub fn orientation(&self, image: &GrayImage, cx: f32, cy: f32) -> f32 {
        let radius = self.patch_radius.round() as i32;
        let radius_sq = radius * radius;
        let mut m01 = 0.0f32;
        let mut m10 = 0.0f32;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy > radius_sq {
                    continue;
                }
                let intensity = bilinear_sample_luma(image, cx + dx as f32, cy + dy as f32);
                m10 += dx as f32 * intensity;
                m01 += dy as f32 * intensity;
            }
        }
        if m10.abs() < f32::EPSILON && m01.abs() < f32::EPSILON {
            0.0
        } else {
            m01.atan2(m10)
        }
    }

    pub fn describe(&self, image: &GrayImage, cx: f32, cy: f32, angle: f32) -> Vec<u32> {
        let (sin, cos) = angle.sin_cos();
        let rotate = |(px, py): (f32, f32)| (cos * px - sin * py + cx, sin * px + cos * py + cy);

        let mut words = vec![0u32; DESCRIPTOR_WORDS];
        for (i, pair) in self.pattern.iter().enumerate() {
            let (x1, y1) = rotate(pair.p1);
            let (x2, y2) = rotate(pair.p2);
            if bilinear_sample_luma(image, x1, y1) < bilinear_sample_luma(image, x2, y2) {
                words[i / 32] |= 1 << (i % 32);
            }
        }
        words
    }
}

fn generate_pattern(count: usize, radius: f32) -> Vec<TestPair> {
    let mut rng = XorShift64::new(PATTERN_SEED);
    let radius_sq = radius * radius;
    let mut point = || loop {
        let x = (rng.next_f32() * 2.0 - 1.0) * radius;
        let y = (rng.next_f32() * 2.0 - 1.0) * radius;
        if x * x + y * y <= radius_sq {
            return (x, y);
        }
    };
    (0..count)
        .map(|_| TestPair {
            p1: point(),
            p2: point(),
        })
        .collect()
}

/// Fixed-sequence generator so the sampling pattern, and with it every
/// descriptor in a compiled database, is identical across builds.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hd::hamming_distance;
    use image::Luma;

    fn blob_image(shift: u32) -> GrayImage {
        GrayImage::from_fn(96, 96, |x, y| {
            let xs = x as f32 - shift as f32;
            let v = 128.0 + 60.0 * (xs * 0.31).sin() * (y as f32 * 0.17).cos() + (xs * 0.9).sin() * 20.0;
            Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn pattern_is_stable() {
        let a = BriefExtractor::new(12);
        let b = BriefExtractor::new(12);
        let image = blob_image(0);
        assert_eq!(a.describe(&image, 48.0, 48.0, 0.3), b.describe(&image, 48.0, 48.0, 0.3));
    }

    #[test]
    fn translated_patch_gives_same_descriptor() {
        let extractor = BriefExtractor::new(12);
        let base = blob_image(0);
        let shifted = blob_image(5);
        let angle_a = extractor.orientation(&base, 40.0, 48.0);
        let angle_b = extractor.orientation(&shifted, 45.0, 48.0);
        let a = extractor.describe(&base, 40.0, 48.0, angle_a);
        let b = extractor.describe(&shifted, 45.0, 48.0, angle_b);
        assert_eq!(a.len(), DESCRIPTOR_WORDS);
        assert!(hamming_distance(&a, &b) <= 2);
    }
}
