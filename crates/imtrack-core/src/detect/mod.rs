//! Keypoint detection and binary description shared by the offline compiler
//! and the per-frame detector, so both sides produce compatible descriptors.

pub mod brief;
pub mod fast;

use image::GrayImage;
use log::debug;
use tracing::debug_span;

use crate::config::DetectorParams;

pub use brief::{BriefExtractor, DESCRIPTOR_BITS, DESCRIPTOR_WORDS};
pub use fast::{Corner, detect_corners};

/// A detected keypoint with its descriptor, in the pixel space of the image
/// it was detected in.
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturePoint {
    pub x: f32,
    pub y: f32,
    /// Corner response; higher is more distinctive.
    pub score: f32,
    pub angle: f32,
    pub descriptor: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct FeatureDetector {
    params: DetectorParams,
    extractor: BriefExtractor,
}

impl FeatureDetector {
    pub fn new(params: DetectorParams) -> Self {
        Self {
            params,
            extractor: BriefExtractor::new(params.patch_radius),
        }
    }

    /// Smallest side length an image needs for any keypoint to be described.
    pub fn min_image_size(&self) -> u32 {
        self.extractor.border() * 2 + 1
    }

    /// Detects and describes keypoints, strongest first.
    pub fn detect(&self, image: &GrayImage) -> Vec<FeaturePoint> {
        let _span = debug_span!("detect_features").entered();

        let corners = detect_corners(
            image,
            self.params.fast_threshold,
            self.extractor.border(),
            self.params.cell_size,
            self.params.per_cell_cap,
            self.params.max_features,
        );

        let points: Vec<FeaturePoint> = corners
            .into_iter()
            .map(|corner| {
                let x = corner.x as f32;
                let y = corner.y as f32;
                let angle = self.extractor.orientation(image, x, y);
                FeaturePoint {
                    x,
                    y,
                    score: corner.score,
                    angle,
                    descriptor: self.extractor.describe(image, x, y, angle),
                }
            })
            .collect();

        debug!(
            target: "imtrack_core::detect",
            "Detected {} keypoints in {}x{} image",
            points.len(),
            image.width(),
            image.height()
        );
        points
    }
}
