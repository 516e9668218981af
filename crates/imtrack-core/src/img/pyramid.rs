use image::imageops::{FilterType, resize};
use imageproc::filter::gaussian_blur_f32;
use log::{debug, trace};

use super::GrayImage;
use crate::config::PyramidParams;

#[derive(Debug, Clone)]
pub struct ScaleLevel {
    pub index: usize,
    /// Level pixels = original pixels * scale.
    pub scale: f32,
    pub image: GrayImage,
}

#[derive(Debug, Clone)]
pub struct ScalePyramid {
    levels: Vec<ScaleLevel>,
}

impl ScalePyramid {
    pub fn levels(&self) -> &[ScaleLevel] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Geometric scale ladder `1, 2^-e, 2^-2e, ...` stopping before the shorter
/// side would drop below `min_dimension`. Always contains the full-size level.
pub fn scale_ladder(width: u32, height: u32, params: &PyramidParams) -> Vec<f32> {
    let shortest = width.min(height) as f32;
    let mut scales = vec![1.0f32];
    let step = params.step_exponent.max(f32::EPSILON);
    for i in 1.. {
        let scale = 2f32.powf(-(i as f32) * step);
        if (shortest * scale).floor() < params.min_dimension as f32 {
            break;
        }
        scales.push(scale);
    }
    scales
}

/// Noise-suppressing blur applied to full-resolution images before keypoint
/// detection, both when compiling targets and on live frames.
pub fn prefilter(image: &GrayImage, sigma: f32) -> GrayImage {
    if sigma > 0.0 {
        gaussian_blur_f32(image, sigma)
    } else {
        image.clone()
    }
}

/// Builds every level of the ladder by resampling the (blurred) base image,
/// so errors do not accumulate across levels.
pub fn build_scale_pyramid(base: &GrayImage, params: &PyramidParams) -> ScalePyramid {
    let scales = scale_ladder(base.width(), base.height(), params);
    debug!(
        target: "imtrack_core::img",
        "Building {}-level scale pyramid from {}x{} image",
        scales.len(),
        base.width(),
        base.height()
    );

    let levels = scales
        .into_iter()
        .enumerate()
        .map(|(index, scale)| {
            let image = if index == 0 {
                prefilter(base, params.blur_sigma)
            } else {
                // Anti-alias proportionally to the downsampling factor.
                let sigma = params.blur_sigma.max(0.5) / scale;
                let blurred = gaussian_blur_f32(base, sigma * 0.5);
                let width = ((base.width() as f32 * scale).round() as u32).max(1);
                let height = ((base.height() as f32 * scale).round() as u32).max(1);
                resize(&blurred, width, height, FilterType::Triangle)
            };
            trace!(
                target: "imtrack_core::img",
                "Level {index}: scale {scale:.4}, {}x{}",
                image.width(),
                image.height()
            );
            ScaleLevel {
                index,
                scale,
                image,
            }
        })
        .collect();

    ScalePyramid { levels }
}
