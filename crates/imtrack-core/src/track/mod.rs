//! Frame-to-frame point tracking by template correlation.
//!
//! Templates are cut from the frame in which a target was confirmed and kept
//! for the whole tracking session, so positions do not drift with template
//! updates. Every accepted position goes through a per-point One-Euro filter.

pub mod filter;
pub mod ncc;

use std::sync::Arc;

use image::GrayImage;
use log::{debug, trace};
use nalgebra::Vector2;
use tracing::debug_span;

use crate::config::{FilterParams, TrackingParams};
use crate::pose::PlanarObservation;

pub use filter::{OneEuroFilter, PointFilter};
pub use ncc::{Patch, PatchMatch};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPoint {
    /// Target-plane position the point was matched to.
    pub world: Vector2<f64>,
    template: Arc<Patch>,
    /// Last accepted raw correlation peak, in frame pixels.
    pub raw: Vector2<f32>,
    /// Filtered screen position reported to listeners.
    pub screen: Vector2<f64>,
    filter: PointFilter,
    /// Correlation score of the current frame; 0 when rejected.
    pub reliability: f32,
    /// Running average of acceptance in [0, 1].
    pub stability: f32,
    pub accepted: bool,
}

impl TrackedPoint {
    pub fn template(&self) -> &Patch {
        &self.template
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackStep {
    pub accepted: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct PatchTracker {
    params: TrackingParams,
    filter: FilterParams,
}

impl PatchTracker {
    pub fn new(params: TrackingParams, filter: FilterParams) -> Self {
        Self { params, filter }
    }

    pub fn params(&self) -> &TrackingParams {
        &self.params
    }

    /// Cuts templates around the given screen points. Points too close to
    /// the border, textureless, or within a template radius of an already
    /// seeded point are skipped; at most `max_tracked_points` are kept.
    pub fn seed(&self, image: &GrayImage, observations: &[PlanarObservation], timestamp: f64) -> Vec<TrackedPoint> {
        let min_spacing = self.params.template_radius as f32;
        let mut points: Vec<TrackedPoint> = Vec::new();
        for obs in observations {
            if points.len() >= self.params.max_tracked_points {
                break;
            }
            let raw = Vector2::new(obs.screen.x as f32, obs.screen.y as f32);
            if points.iter().any(|p| (p.raw - raw).norm() < min_spacing) {
                continue;
            }
            let Some(template) = Patch::extract(image, raw, self.params.template_radius) else {
                continue;
            };
            let mut filter = PointFilter::new(self.filter);
            let screen = filter.filter(obs.screen, timestamp);
            points.push(TrackedPoint {
                world: obs.world,
                template: Arc::new(template),
                raw,
                screen,
                filter,
                reliability: 1.0,
                stability: 1.0,
                accepted: true,
            });
        }
        debug!(
            target: "imtrack_core::track",
            "Seeded {} tracked points from {} observations",
            points.len(),
            observations.len()
        );
        points
    }

    /// Correlates every point's template around its last accepted position.
    pub fn step(&self, image: &GrayImage, points: &mut [TrackedPoint], timestamp: f64) -> TrackStep {
        let _span = debug_span!("track_points", count = points.len()).entered();
        let rate = self.params.stability_rate;
        let mut accepted = 0;

        for point in points.iter_mut() {
            let found = point
                .template
                .search(image, point.raw, self.params.search_radius)
                .filter(|m| m.score >= self.params.min_similarity);
            match found {
                Some(m) => {
                    point.raw = m.position;
                    point.screen = point
                        .filter
                        .filter(Vector2::new(m.position.x as f64, m.position.y as f64), timestamp);
                    point.reliability = m.score;
                    point.stability += rate * (1.0 - point.stability);
                    point.accepted = true;
                    accepted += 1;
                }
                None => {
                    point.reliability = 0.0;
                    point.stability -= rate * point.stability;
                    point.accepted = false;
                }
            }
        }

        trace!(
            target: "imtrack_core::track",
            "Tracking step: {accepted}/{} points accepted",
            points.len()
        );
        TrackStep {
            accepted,
            total: points.len(),
        }
    }

    /// Whether a step kept enough points for the frame to count as tracked.
    pub fn is_good(&self, step: &TrackStep) -> bool {
        step.accepted >= self.params.min_tracked_points
    }
}

/// (world, filtered screen) pairs of the points accepted in the last step.
pub fn accepted_observations(points: &[TrackedPoint]) -> Vec<PlanarObservation> {
    points
        .iter()
        .filter(|p| p.accepted)
        .map(|p| PlanarObservation {
            world: p.world,
            screen: p.screen,
        })
        .collect()
}
