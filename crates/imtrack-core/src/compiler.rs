//! Offline compilation of reference images into a [`FeatureDatabase`].

use image::GrayImage;
use log::{debug, info};
use tracing::info_span;

use crate::config::{EngineConfig, PyramidParams};
use crate::db::{DatabaseLevel, FeatureDatabase, Keypoint, TargetDatabase};
use crate::detect::{DESCRIPTOR_BITS, DESCRIPTOR_WORDS, FeatureDetector};
use crate::error::CompileError;
use crate::hd::{HdEncoder, generate_basis};
use crate::img::{build_scale_pyramid, gray_from_raw, gray_from_rgba, scale_ladder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Luma8,
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Luma8 => 1,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// A raw reference image.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl TargetImage {
    pub fn luma(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
            format: PixelFormat::Luma8,
        }
    }

    pub fn rgba(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
            format: PixelFormat::Rgba8,
        }
    }

    pub fn from_gray(image: &GrayImage) -> Self {
        Self::luma(image.as_raw().clone(), image.width(), image.height())
    }

    fn to_gray(&self, index: usize) -> Result<GrayImage, CompileError> {
        if self.width == 0 || self.height == 0 {
            return Err(CompileError::EmptyImage {
                index,
                width: self.width,
                height: self.height,
            });
        }
        let expected = self.width as usize * self.height as usize * self.format.bytes_per_pixel();
        let mismatch = CompileError::BufferSizeMismatch {
            index,
            expected,
            actual: self.pixels.len(),
        };
        if self.pixels.len() != expected {
            return Err(mismatch);
        }
        let gray = match self.format {
            PixelFormat::Luma8 => gray_from_raw(self.pixels.clone(), self.width, self.height),
            PixelFormat::Rgba8 => gray_from_rgba(&self.pixels, self.width, self.height),
        };
        gray.ok_or(mismatch)
    }
}

#[derive(Debug)]
pub struct Compiler {
    pyramid: PyramidParams,
    detector: FeatureDetector,
    encoder: HdEncoder,
}

impl Compiler {
    pub fn new(config: &EngineConfig) -> Result<Self, CompileError> {
        config.validate()?;
        let basis = generate_basis(config.hd.seed, config.hd.dimensions, DESCRIPTOR_BITS);
        Ok(Self {
            pyramid: config.pyramid,
            detector: FeatureDetector::new(config.detector),
            encoder: HdEncoder::new(basis, config.hd.signature_bits),
        })
    }

    pub fn encoder(&self) -> &HdEncoder {
        &self.encoder
    }

    /// Shortest side a reference image must have.
    pub fn min_image_size(&self) -> u32 {
        self.detector.min_image_size().max(self.pyramid.min_dimension)
    }

    /// Compiles the targets in order. `progress` receives non-decreasing
    /// percentages, the last of which is exactly 100.
    pub fn compile<F>(&self, targets: &[TargetImage], mut progress: F) -> Result<FeatureDatabase, CompileError>
    where
        F: FnMut(f64),
    {
        if targets.is_empty() {
            return Err(CompileError::NoTargets);
        }

        // Validate and convert everything before any work is reported.
        let minimum = self.min_image_size();
        let images = targets
            .iter()
            .enumerate()
            .map(|(index, target)| {
                let image = target.to_gray(index)?;
                if image.width().min(image.height()) < minimum {
                    return Err(CompileError::ImageTooSmall {
                        index,
                        width: image.width(),
                        height: image.height(),
                        minimum,
                    });
                }
                Ok(image)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let total_levels: usize = images
            .iter()
            .map(|image| scale_ladder(image.width(), image.height(), &self.pyramid).len())
            .sum();
        let mut done_levels = 0usize;
        progress(0.0);

        let mut compiled = Vec::with_capacity(images.len());
        for (target_index, image) in images.iter().enumerate() {
            let _span = info_span!("compile_target", target_index).entered();
            let pyramid = build_scale_pyramid(image, &self.pyramid);
            let mut levels = Vec::with_capacity(pyramid.len());
            for level in pyramid.levels() {
                let keypoints: Vec<Keypoint> = self
                    .detector
                    .detect(&level.image)
                    .into_iter()
                    .map(|feature| Keypoint {
                        x: feature.x,
                        y: feature.y,
                        signature: self.encoder.signature(&feature.descriptor),
                        descriptor: feature.descriptor,
                    })
                    .collect();
                debug!(
                    target: "imtrack_core::compiler",
                    "Target {target_index} level {} (scale {:.3}): {} keypoints",
                    level.index,
                    level.scale,
                    keypoints.len()
                );
                levels.push(DatabaseLevel {
                    scale: level.scale,
                    keypoints,
                });

                done_levels += 1;
                progress((100.0 * done_levels as f64 / total_levels as f64).min(100.0));
            }

            let target = TargetDatabase {
                target_index,
                width: image.width(),
                height: image.height(),
                levels,
            };
            info!(
                target: "imtrack_core::compiler",
                "Compiled target {target_index} ({}x{}): {} levels, {} keypoints",
                target.width,
                target.height,
                target.levels.len(),
                target.keypoint_count()
            );
            compiled.push(target);
        }

        if done_levels != total_levels {
            progress(100.0);
        }

        Ok(FeatureDatabase {
            descriptor_words: DESCRIPTOR_WORDS,
            signature_words: self.encoder.signature_words(),
            hd_seed: self.encoder.basis().seed(),
            hd_dimensions: self.encoder.basis().dimensions(),
            targets: compiled,
        })
    }

    /// Compiles and serializes in one step.
    pub fn export<F>(&self, targets: &[TargetImage], progress: F) -> Result<Vec<u8>, CompileError>
    where
        F: FnMut(f64),
    {
        Ok(self.compile(targets, progress)?.to_bytes())
    }
}
