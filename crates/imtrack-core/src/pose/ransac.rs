use log::{debug, warn};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::index::sample;

use super::{MIN_CORRESPONDENCES, PlanarObservation, Pose, solve_planar_pnp};
use crate::camera::CameraIntrinsics;
use crate::config::PoseParams;
use crate::error::PoseError;

#[derive(Debug, Clone, PartialEq)]
pub struct PoseEstimate {
    pub pose: Pose,
    /// Indices into the observations passed to [`PoseEstimator::estimate`].
    pub inliers: Vec<usize>,
    /// Mean pixel reprojection error over the inliers.
    pub mean_reprojection_error: f64,
}

/// RANSAC around the direct planar solver: minimal 4-point samples, pixel
/// reprojection scoring, and a refit on the consensus set.
#[derive(Debug, Clone)]
pub struct PoseEstimator {
    params: PoseParams,
}

impl PoseEstimator {
    pub fn new(params: PoseParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PoseParams {
        &self.params
    }

    /// Whether an estimate is good enough to count as a detection.
    pub fn accepts(&self, estimate: &PoseEstimate) -> bool {
        estimate.inliers.len() >= self.params.min_inliers
            && estimate.mean_reprojection_error <= self.params.max_reprojection_error
    }

    pub fn estimate(
        &self,
        observations: &[PlanarObservation],
        intrinsics: &CameraIntrinsics,
    ) -> Result<PoseEstimate, PoseError> {
        if observations.len() < MIN_CORRESPONDENCES {
            return Err(PoseError::InsufficientCorrespondences {
                found: observations.len(),
            });
        }

        // Seeded so identical frames produce identical poses.
        let mut rng = SmallRng::seed_from_u64(self.params.ransac_seed);
        let mut last_error = PoseError::DegeneratePose("no minimal sample produced a pose");
        let mut best: Option<(Pose, Vec<usize>)> = None;
        let mut minimal = [observations[0]; MIN_CORRESPONDENCES];

        for _ in 0..self.params.ransac_iterations.max(1) {
            for (slot, idx) in minimal
                .iter_mut()
                .zip(sample(&mut rng, observations.len(), MIN_CORRESPONDENCES).into_iter())
            {
                *slot = observations[idx];
            }
            let candidate = match solve_planar_pnp(&minimal, intrinsics) {
                Ok(pose) => pose,
                Err(err) => {
                    last_error = err;
                    continue;
                }
            };

            let inliers = self.collect_inliers(&candidate, observations, intrinsics);
            if best.as_ref().is_none_or(|(_, b)| inliers.len() > b.len()) {
                let complete = inliers.len() == observations.len();
                best = Some((candidate, inliers));
                if complete {
                    break;
                }
            }
        }

        let Some((mut pose, mut inliers)) = best else {
            warn!(target: "imtrack_core::pose", "RANSAC found no pose: {last_error}");
            return Err(last_error);
        };

        if inliers.len() >= MIN_CORRESPONDENCES {
            let consensus: Vec<PlanarObservation> = inliers.iter().map(|&i| observations[i]).collect();
            if let Ok(refined) = solve_planar_pnp(&consensus, intrinsics) {
                let refined_inliers = self.collect_inliers(&refined, observations, intrinsics);
                if refined_inliers.len() >= inliers.len() {
                    pose = refined;
                    inliers = refined_inliers;
                }
            }
        }

        let mean_reprojection_error = if inliers.is_empty() {
            f64::INFINITY
        } else {
            inliers
                .iter()
                .map(|&i| pose.reprojection_error(intrinsics, &observations[i]))
                .sum::<f64>()
                / inliers.len() as f64
        };

        debug!(
            target: "imtrack_core::pose",
            "RANSAC pose: {}/{} inliers, mean error {:.3}px",
            inliers.len(),
            observations.len(),
            mean_reprojection_error
        );

        Ok(PoseEstimate {
            pose,
            inliers,
            mean_reprojection_error,
        })
    }

    fn collect_inliers(
        &self,
        pose: &Pose,
        observations: &[PlanarObservation],
        intrinsics: &CameraIntrinsics,
    ) -> Vec<usize> {
        observations
            .iter()
            .enumerate()
            .filter(|(_, obs)| pose.reprojection_error(intrinsics, obs) < self.params.inlier_threshold_px)
            .map(|(idx, _)| idx)
            .collect()
    }
}
