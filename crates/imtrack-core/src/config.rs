//! Engine-wide configuration.
//!
//! A single [`EngineConfig`] is built at startup and handed by reference to
//! the compiler, matcher and runtime. Nothing in the crate reads tuning
//! constants from global state.

use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hd::MAX_HD_DIMENSIONS;

pub const DEFAULT_HD_SEED: u64 = 0x5EED_1DEA_2024;

/// Hyperdimensional projection parameters shared by every target of a
/// database.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdParams {
    pub seed: u64,
    /// Number of basis hypervectors (bits in a projected hypervector).
    pub dimensions: usize,
    /// Bits kept in the compressed signature. Must divide `dimensions`.
    pub signature_bits: usize,
}

impl Default for HdParams {
    fn default() -> Self {
        Self {
            seed: DEFAULT_HD_SEED,
            dimensions: 1024,
            signature_bits: 128,
        }
    }
}

/// Scale ladder used when compiling a target image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidParams {
    /// Level `i` is scaled by `2^(-i * step_exponent)`.
    pub step_exponent: f32,
    /// Smallest side length (pixels) a level may have.
    pub min_dimension: u32,
    pub blur_sigma: f32,
}

impl Default for PyramidParams {
    fn default() -> Self {
        Self {
            step_exponent: 1.0 / 3.0,
            min_dimension: 100,
            blur_sigma: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    pub fast_threshold: f32,
    pub cell_size: usize,
    pub per_cell_cap: usize,
    pub max_features: usize,
    /// Radius of the rotated BRIEF sampling disc.
    pub patch_radius: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            fast_threshold: 20.0,
            cell_size: 32,
            per_cell_cap: 6,
            max_features: 800,
            patch_radius: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherParams {
    /// Restrict candidates to the query's LSH bucket. When false every
    /// keypoint of a level is a candidate.
    pub use_lsh: bool,
    /// Also probe buckets whose key differs from the query key in one bit.
    pub multi_probe: bool,
    pub bucket_bits: u32,
    pub bucket_capacity: usize,
    /// Absolute Hamming acceptance threshold (exclusive).
    pub max_hamming: u32,
    /// Best / second-best distance ratio threshold (exclusive).
    pub ratio_threshold: f32,
    pub max_query_points: usize,
}

impl Default for MatcherParams {
    fn default() -> Self {
        Self {
            use_lsh: true,
            multi_probe: true,
            bucket_bits: 12,
            bucket_capacity: 64,
            max_hamming: 64,
            ratio_threshold: 0.8,
            max_query_points: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseParams {
    pub ransac_iterations: usize,
    pub ransac_seed: u64,
    /// Reprojection error (pixels) under which a correspondence is an inlier.
    pub inlier_threshold_px: f64,
    /// Inliers required for a detection to count as successful.
    pub min_inliers: usize,
    /// Mean inlier reprojection error (pixels) above which a detection fails.
    pub max_reprojection_error: f64,
}

impl Default for PoseParams {
    fn default() -> Self {
        Self {
            ransac_iterations: 128,
            ransac_seed: 7,
            inlier_threshold_px: 4.0,
            min_inliers: 10,
            max_reprojection_error: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingParams {
    /// Consecutive successful detections needed to promote to tracking.
    pub warmup_tolerance: u32,
    /// Consecutive failed tracking frames tolerated before the target is lost.
    pub miss_tolerance: u32,
    pub template_radius: usize,
    pub search_radius: usize,
    /// Minimum normalized cross-correlation for a point update to be accepted.
    pub min_similarity: f32,
    /// Accepted points needed for a tracking frame to count as good.
    pub min_tracked_points: usize,
    pub max_tracked_points: usize,
    /// Weight of the newest frame in the per-point stability average.
    pub stability_rate: f32,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            warmup_tolerance: 3,
            miss_tolerance: 5,
            template_radius: 5,
            search_radius: 8,
            min_similarity: 0.7,
            min_tracked_points: 6,
            max_tracked_points: 60,
            stability_rate: 0.2,
        }
    }
}

/// One-Euro filter parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub min_cutoff: f64,
    pub beta: f64,
    pub d_cutoff: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            min_cutoff: 1.0,
            beta: 0.01,
            d_cutoff: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerParams {
    /// Run detection for scanning targets every `scan_interval` frames.
    pub scan_interval: u32,
    pub max_tracked_targets: usize,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            scan_interval: 1,
            max_tracked_targets: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub hd: HdParams,
    pub pyramid: PyramidParams,
    pub detector: DetectorParams,
    pub matcher: MatcherParams,
    pub pose: PoseParams,
    pub tracking: TrackingParams,
    pub filter: FilterParams,
    pub scheduler: SchedulerParams,
}

impl EngineConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(target: "imtrack_core::config", "Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let hd = &self.hd;
        if hd.dimensions == 0 || hd.dimensions > MAX_HD_DIMENSIONS {
            return Err(invalid(
                "hd.dimensions",
                format!("must be within 1..={MAX_HD_DIMENSIONS}"),
            ));
        }
        if hd.signature_bits == 0 || hd.signature_bits % 32 != 0 {
            return Err(invalid("hd.signature_bits", "must be a positive multiple of 32"));
        }
        if hd.dimensions % hd.signature_bits != 0 {
            return Err(invalid(
                "hd.signature_bits",
                format!("must divide hd.dimensions ({})", hd.dimensions),
            ));
        }

        let matcher = &self.matcher;
        if matcher.bucket_bits == 0 || matcher.bucket_bits > 32 {
            return Err(invalid("matcher.bucket_bits", "must be within 1..=32"));
        }
        if matcher.bucket_bits as usize > hd.signature_bits {
            return Err(invalid(
                "matcher.bucket_bits",
                "must not exceed hd.signature_bits",
            ));
        }
        if matcher.bucket_capacity == 0 {
            return Err(invalid("matcher.bucket_capacity", "must be positive"));
        }
        if !(matcher.ratio_threshold > 0.0 && matcher.ratio_threshold <= 1.0) {
            return Err(invalid("matcher.ratio_threshold", "must lie in (0, 1]"));
        }

        if !(self.pyramid.step_exponent > 0.0) {
            return Err(invalid("pyramid.step_exponent", "must be positive"));
        }
        if self.detector.cell_size == 0 || self.detector.patch_radius == 0 {
            return Err(invalid("detector", "cell_size and patch_radius must be positive"));
        }

        let tracking = &self.tracking;
        if tracking.warmup_tolerance == 0 {
            return Err(invalid("tracking.warmup_tolerance", "must be at least 1"));
        }
        if tracking.template_radius == 0 {
            return Err(invalid("tracking.template_radius", "must be positive"));
        }
        if !(0.0..=1.0).contains(&tracking.stability_rate) {
            return Err(invalid("tracking.stability_rate", "must lie in [0, 1]"));
        }

        if self.pose.min_inliers < 4 {
            return Err(invalid("pose.min_inliers", "must be at least 4"));
        }
        if self.scheduler.scan_interval == 0 {
            return Err(invalid("scheduler.scan_interval", "must be at least 1"));
        }
        if self.filter.min_cutoff <= 0.0 || self.filter.d_cutoff <= 0.0 {
            return Err(invalid("filter", "cutoff frequencies must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().expect("default config");
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "tracking:\n  warmup_tolerance: 5\nmatcher:\n  use_lsh: false\n";
        let config = EngineConfig::from_yaml_str(yaml).expect("parse");
        assert_eq!(config.tracking.warmup_tolerance, 5);
        assert!(!config.matcher.use_lsh);
        assert_eq!(config.tracking.miss_tolerance, TrackingParams::default().miss_tolerance);
        assert_eq!(config.hd, HdParams::default());
    }

    #[test]
    fn rejects_signature_not_dividing_dimensions() {
        let mut config = EngineConfig::default();
        config.hd.signature_bits = 96;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "hd.signature_bits", .. }));
    }

    #[test]
    fn rejects_oversized_basis() {
        let mut config = EngineConfig::default();
        config.hd.dimensions = MAX_HD_DIMENSIONS * 2;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "hd.dimensions", .. }));
    }

    #[test]
    fn rejects_zero_warmup() {
        let yaml = "tracking:\n  warmup_tolerance: 0\n";
        assert!(EngineConfig::from_yaml_str(yaml).is_err());
    }
}
