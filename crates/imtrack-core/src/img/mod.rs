pub mod image_utils;
pub mod pyramid;

use std::sync::Arc;

pub use image::GrayImage;
pub use image_utils::{bilinear_sample_luma, gray_from_raw, gray_from_rgba};
pub use pyramid::{ScaleLevel, ScalePyramid, build_scale_pyramid, prefilter, scale_ladder};

/// One captured video frame, already converted to luma.
///
/// The pixel buffer is reference counted so detection for several targets
/// can borrow it concurrently; the runtime drops its handle as soon as the
/// frame has been processed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: u64,
    pub timestamp_seconds: f64,
    pub image: Arc<GrayImage>,
}

impl Frame {
    pub fn new(frame_id: u64, timestamp_seconds: f64, image: GrayImage) -> Self {
        Self {
            frame_id,
            timestamp_seconds,
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
