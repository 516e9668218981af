//! The two expensive per-frame stages behind traits, so the runtime can be
//! driven by scripted stand-ins in tests.

use imtrack_core::camera::CameraIntrinsics;
use imtrack_core::config::EngineConfig;
use imtrack_core::detect::FeatureDetector;
use imtrack_core::error::PoseError;
use imtrack_core::img::{Frame, prefilter};
use imtrack_core::matcher::{Matcher, SearchIndex};
use imtrack_core::pose::{PlanarObservation, Pose, PoseEstimator};
use imtrack_core::track::{PatchTracker, TrackStep, TrackedPoint};
use log::{debug, trace};
use rayon::prelude::*;
use tracing::debug_span;

/// A confirmed sighting of a target in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub pose: Pose,
    /// Inlier correspondences, used to seed tracked points.
    pub inliers: Vec<PlanarObservation>,
    pub mean_reprojection_error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectionFailure {
    NoCorrespondences,
    Pose(PoseError),
    /// A pose was found but missed the inlier or reprojection thresholds.
    Rejected { inliers: usize, mean_reprojection_error: f64 },
}

/// Outcome of running detection for one target in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionAttempt {
    pub target_index: usize,
    pub correspondences: usize,
    pub result: Result<Detection, DetectionFailure>,
}

impl DetectionAttempt {
    pub fn detection(&self) -> Option<&Detection> {
        self.result.as_ref().ok()
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub trait FrameDetector: Send + Sync {
    fn target_count(&self) -> usize;

    /// Runs detection for each of `targets` on `frame`. The result has one
    /// attempt per requested target, in the requested order.
    fn detect(&self, frame: &Frame, targets: &[usize]) -> Vec<DetectionAttempt>;
}

pub trait PointTracker: Send + Sync {
    /// Creates tracked points from a confirmed detection.
    fn seed(&self, frame: &Frame, inliers: &[PlanarObservation]) -> Vec<TrackedPoint>;

    /// Advances `points` into `frame`.
    fn step(&self, frame: &Frame, points: &mut [TrackedPoint]) -> TrackStep;
}

impl PointTracker for PatchTracker {
    fn seed(&self, frame: &Frame, inliers: &[PlanarObservation]) -> Vec<TrackedPoint> {
        PatchTracker::seed(self, &frame.image, inliers, frame.timestamp_seconds)
    }

    fn step(&self, frame: &Frame, points: &mut [TrackedPoint]) -> TrackStep {
        PatchTracker::step(self, &frame.image, points, frame.timestamp_seconds)
    }
}

/// Keypoint extraction, database matching and robust pose estimation.
/// Keypoints are extracted once per frame; targets are matched in parallel.
#[derive(Debug)]
pub struct FeatureDetection {
    index: SearchIndex,
    features: FeatureDetector,
    matcher: Matcher,
    estimator: PoseEstimator,
    camera: CameraIntrinsics,
    blur_sigma: f32,
}

impl FeatureDetection {
    pub fn new(index: SearchIndex, camera: CameraIntrinsics, config: &EngineConfig) -> Self {
        Self {
            index,
            features: FeatureDetector::new(config.detector),
            matcher: Matcher::new(config.matcher),
            estimator: PoseEstimator::new(config.pose),
            camera,
            blur_sigma: config.pyramid.blur_sigma,
        }
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }
}

impl FrameDetector for FeatureDetection {
    fn target_count(&self) -> usize {
        self.index.target_count()
    }

    fn detect(&self, frame: &Frame, targets: &[usize]) -> Vec<DetectionAttempt> {
        let _span = debug_span!("detect", frame_id = frame.frame_id).entered();
        if targets.is_empty() {
            return Vec::new();
        }

        // Same smoothing as the full-resolution level of a compiled target.
        let image = prefilter(&frame.image, self.blur_sigma);
        let features = self.features.detect(&image);
        let queries = self.matcher.prepare(&features, self.index.encoder());

        let attempts: Vec<DetectionAttempt> = targets
            .par_iter()
            .map(|&target_index| {
                let matches = self.matcher.match_target(&queries, &self.index, target_index);
                let correspondences = matches.len();
                if matches.is_empty() {
                    return DetectionAttempt {
                        target_index,
                        correspondences,
                        result: Err(DetectionFailure::NoCorrespondences),
                    };
                }

                let observations: Vec<PlanarObservation> = matches
                    .correspondences
                    .iter()
                    .map(|c| PlanarObservation {
                        world: c.world,
                        screen: c.screen,
                    })
                    .collect();
                let result = match self.estimator.estimate(&observations, &self.camera) {
                    Ok(estimate) if self.estimator.accepts(&estimate) => Ok(Detection {
                        pose: estimate.pose,
                        inliers: estimate.inliers.iter().map(|&i| observations[i]).collect(),
                        mean_reprojection_error: estimate.mean_reprojection_error,
                    }),
                    Ok(estimate) => Err(DetectionFailure::Rejected {
                        inliers: estimate.inliers.len(),
                        mean_reprojection_error: estimate.mean_reprojection_error,
                    }),
                    Err(err) => Err(DetectionFailure::Pose(err)),
                };
                trace!(
                    target: "imtrack_engine::detection",
                    "Target {target_index}: {correspondences} correspondences, success {}",
                    result.is_ok()
                );
                DetectionAttempt {
                    target_index,
                    correspondences,
                    result,
                }
            })
            .collect();

        debug!(
            target: "imtrack_engine::detection",
            "Frame {}: {} keypoints, {}/{} targets detected",
            frame.frame_id,
            features.len(),
            attempts.iter().filter(|a| a.is_success()).count(),
            attempts.len()
        );
        attempts
    }
}
