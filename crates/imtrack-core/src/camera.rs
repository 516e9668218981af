use nalgebra::{Matrix3, Point3, Vector2};

/// Pinhole intrinsics of the camera feeding frames to the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub skew: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            skew: 0.0,
            width,
            height,
        }
    }

    /// Intrinsics matching a perspective projection with the given vertical
    /// field of view and the principal point at the image centre.
    pub fn from_vertical_fov(width: u32, height: u32, fovy_degrees: f64) -> Self {
        let f = height as f64 * 0.5 / (fovy_degrees.to_radians() * 0.5).tan();
        Self::new(f, f, width as f64 * 0.5, height as f64 * 0.5, width, height)
    }

    pub fn is_valid(&self) -> bool {
        [self.fx, self.fy, self.cx, self.cy, self.skew]
            .iter()
            .all(|v| v.is_finite())
            && self.fx > 0.0
            && self.fy > 0.0
            && self.width > 0
            && self.height > 0
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Closed-form inverse of the upper-triangular intrinsic matrix.
    pub fn inverse(&self) -> Matrix3<f64> {
        let fxfy = self.fx * self.fy;
        Matrix3::new(
            1.0 / self.fx,
            -self.skew / fxfy,
            (self.skew * self.cy - self.cx * self.fy) / fxfy,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Projects a camera-space point to pixels; `None` on or behind the
    /// camera plane.
    pub fn project(&self, point_cam: &Point3<f64>) -> Option<Vector2<f64>> {
        if point_cam.z <= 0.0 {
            return None;
        }
        let x = point_cam.x / point_cam.z;
        let y = point_cam.y / point_cam.z;
        Some(Vector2::new(
            self.fx * x + self.skew * y + self.cx,
            self.fy * y + self.cy,
        ))
    }

    /// Pixel to normalized camera-ray coordinates on the z = 1 plane.
    pub fn normalize(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let y = (pixel.y - self.cy) / self.fy;
        let x = (pixel.x - self.cx - self.skew * y) / self.fx;
        Vector2::new(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn inverse_matches_matrix() {
        let mut intrinsics = CameraIntrinsics::new(600.0, 620.0, 300.0, 200.0, 640, 480);
        intrinsics.skew = 3.0;
        let product = intrinsics.matrix() * intrinsics.inverse();
        assert_relative_eq!(product, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn project_then_normalize_recovers_ray() {
        let intrinsics = CameraIntrinsics::from_vertical_fov(640, 480, 60.0);
        let point = Point3::new(0.1, -0.2, 2.5);
        let pixel = intrinsics.project(&point).expect("in front of camera");
        let ray = intrinsics.normalize(&pixel);
        assert_relative_eq!(ray.x, 0.04, epsilon = 1e-12);
        assert_relative_eq!(ray.y, -0.08, epsilon = 1e-12);
        assert!(intrinsics.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn vertical_fov_sets_focal_length() {
        let intrinsics = CameraIntrinsics::from_vertical_fov(640, 480, 90.0);
        assert_relative_eq!(intrinsics.fy, 240.0, epsilon = 1e-9);
        assert_relative_eq!(intrinsics.cx, 320.0);
        assert!(intrinsics.is_valid());
    }
}
