//! Planar pose from 2D-3D correspondences.
//!
//! Target points lie on the z = 0 plane of the target frame, which makes
//! the projection linear in `[r1 r2 t]` (direct linear transform). The
//! null vector of the stacked system is rescaled and orthogonalized into a
//! proper rotation.

pub mod ransac;

use log::trace;
use nalgebra::{DMatrix, Matrix3, Matrix3x4, Point3, Vector2, Vector3};

use crate::camera::CameraIntrinsics;
use crate::error::PoseError;

pub use ransac::{PoseEstimate, PoseEstimator};

pub const MIN_CORRESPONDENCES: usize = 4;

/// Unknowns of the planar DLT: r1 (3), r2 (3), t (3).
const UNKNOWNS: usize = 9;

/// Smallest accepted ratio between the second-smallest and largest singular
/// value. Below it the null space is not one-dimensional.
const CONDITION_FLOOR: f64 = 1e-9;

/// A correspondence for the pose solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanarObservation {
    /// Target-plane point (z = 0) in target units.
    pub world: Vector2<f64>,
    /// Observed pixel position.
    pub screen: Vector2<f64>,
}

/// Target-to-camera transform `[R | t]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    pub fn matrix(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.set_column(3, &self.translation);
        m
    }

    pub fn transform_plane_point(&self, world: &Vector2<f64>) -> Point3<f64> {
        let p = self.rotation.column(0) * world.x + self.rotation.column(1) * world.y + self.translation;
        Point3::from(p)
    }

    pub fn project(&self, intrinsics: &CameraIntrinsics, world: &Vector2<f64>) -> Option<Vector2<f64>> {
        intrinsics.project(&self.transform_plane_point(world))
    }

    /// Pixel distance between the projection of `observation.world` and the
    /// observed pixel; infinite for points behind the camera.
    pub fn reprojection_error(&self, intrinsics: &CameraIntrinsics, observation: &PlanarObservation) -> f64 {
        self.project(intrinsics, &observation.world)
            .map_or(f64::INFINITY, |p| (p - observation.screen).norm())
    }
}

/// Direct planar PnP over every supplied observation.
pub fn solve_planar_pnp(
    observations: &[PlanarObservation],
    intrinsics: &CameraIntrinsics,
) -> Result<Pose, PoseError> {
    if observations.len() < MIN_CORRESPONDENCES {
        return Err(PoseError::InsufficientCorrespondences {
            found: observations.len(),
        });
    }

    let k_inv = intrinsics.inverse();
    // Zero rows keep the thin SVD square in the unknowns for the minimal case.
    let rows = (observations.len() * 2).max(UNKNOWNS);
    let mut a = DMatrix::<f64>::zeros(rows, UNKNOWNS);
    for (i, obs) in observations.iter().enumerate() {
        let ray = k_inv * Vector3::new(obs.screen.x, obs.screen.y, 1.0);
        let (u, v) = (ray.x / ray.z, ray.y / ray.z);
        let (x, y) = (obs.world.x, obs.world.y);
        let row = i * 2;

        // Camera point c = r1 x + r2 y + t; rows encode c.x - u c.z = 0 and c.y - v c.z = 0.
        a[(row, 0)] = x;
        a[(row, 3)] = y;
        a[(row, 6)] = 1.0;
        a[(row, 2)] = -u * x;
        a[(row, 5)] = -u * y;
        a[(row, 8)] = -u;

        a[(row + 1, 1)] = x;
        a[(row + 1, 4)] = y;
        a[(row + 1, 7)] = 1.0;
        a[(row + 1, 2)] = -v * x;
        a[(row + 1, 5)] = -v * y;
        a[(row + 1, 8)] = -v;
    }

    let svd = a.svd(false, true);
    let Some(v_t) = svd.v_t else {
        return Err(PoseError::DegeneratePose("singular value decomposition failed"));
    };
    let singular = &svd.singular_values;
    if singular.iter().any(|s| !s.is_finite()) {
        return Err(PoseError::DegeneratePose("non-finite singular values"));
    }

    let mut order: Vec<usize> = (0..singular.len()).collect();
    order.sort_by(|&i, &j| singular[i].partial_cmp(&singular[j]).unwrap_or(std::cmp::Ordering::Equal));
    let smallest = order[0];
    let second = order[1];
    let largest = order[order.len() - 1];
    if singular[largest] <= f64::EPSILON || singular[second] / singular[largest] < CONDITION_FLOOR {
        return Err(PoseError::DegeneratePose("rank-deficient linear system"));
    }
    trace!(
        target: "imtrack_core::pose",
        "DLT singular values: min {:.3e}, second {:.3e}, max {:.3e}",
        singular[smallest],
        singular[second],
        singular[largest]
    );

    let h = v_t.row(smallest).transpose();
    // Column-major H = [r1 r2 t], each column three consecutive unknowns.
    let mut r1 = Vector3::new(h[0], h[1], h[2]);
    let mut r2 = Vector3::new(h[3], h[4], h[5]);
    let mut t = Vector3::new(h[6], h[7], h[8]);

    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }

    let scale = (r1.norm() + r2.norm()) * 0.5;
    if !scale.is_finite() || scale <= f64::EPSILON {
        return Err(PoseError::DegeneratePose("vanishing rotation scale"));
    }
    r1 /= scale;
    r2 /= scale;
    let r3 = r1.cross(&r2);

    let rotation = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r3]))?;
    let translation = t / scale;
    if !translation.iter().all(|v| v.is_finite()) {
        return Err(PoseError::DegeneratePose("non-finite translation"));
    }
    Ok(Pose::new(rotation, translation))
}

/// Projects onto SO(3) with `R = U Vᵗ`, flipping the last column of `U`
/// when the product would be a reflection.
fn nearest_rotation(m: &Matrix3<f64>) -> Result<Matrix3<f64>, PoseError> {
    let svd = m.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(PoseError::DegeneratePose("rotation orthogonalization failed"));
    };
    if (u * v_t).determinant() < 0.0 {
        let flipped = -u.column(2);
        u.set_column(2, &flipped);
    }
    Ok(u * v_t)
}
