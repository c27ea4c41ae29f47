//! Two-view triangulation with geometric validation.
//!
//! A candidate point is accepted only if it lies in front of both cameras,
//! reprojects within tolerance in both views, and the two rays subtend at
//! least the configured parallax (baseline) angle.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::camera::{Intrinsics, MIN_DEPTH};
use super::SE3;

/// Configuration for landmark triangulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Minimum angle (degrees) subtended at the point by two camera centers.
    pub min_parallax_deg: f64,
    /// Maximum reprojection error in pixels, per view.
    pub max_reprojection_px: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            min_parallax_deg: 1.0,
            max_reprojection_px: 4.0,
        }
    }
}

impl TriangulationConfig {
    pub fn min_parallax_rad(&self) -> f64 {
        self.min_parallax_deg.to_radians()
    }
}

/// Why a triangulation candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriangulationReject {
    /// Linear system had no finite solution.
    Degenerate,
    /// Negative or zero depth in at least one camera.
    BehindCamera,
    /// Rays are too close to parallel.
    LowParallax,
    /// Reprojection error above tolerance.
    Reprojection,
}

/// A single 2D observation together with its camera.
#[derive(Debug, Clone, Copy)]
pub struct View<'a> {
    /// Camera-to-world pose.
    pub pose_wc: &'a SE3,
    pub intrinsics: &'a Intrinsics,
    /// Observed (distorted) pixel.
    pub pixel: Vector2<f64>,
}

/// Compute skew-symmetric matrix from vector.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Build a 3x4 projection matrix [R | t] from a world-to-camera pose.
pub fn projection_matrix(pose_cw: &SE3) -> Matrix3x4<f64> {
    let r = pose_cw.rotation_matrix();
    let t = pose_cw.translation;
    Matrix3x4::from_columns(&[r.column(0).into(), r.column(1).into(), r.column(2).into(), t])
}

/// Triangulate a 3D point using the Direct Linear Transform.
///
/// `xn1`/`xn2` are undistorted normalized coordinates, poses are camera-to-world.
pub fn triangulate_dlt(
    xn1: &Vector2<f64>,
    xn2: &Vector2<f64>,
    pose1_wc: &SE3,
    pose2_wc: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(&pose1_wc.inverse());
    let p2 = projection_matrix(&pose2_wc.inverse());

    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    // Smallest singular value is not guaranteed to be last; pick it explicitly.
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x_h = v_t.row(min_idx);

    if x_h[3].abs() < 1e-12 {
        return None;
    }
    let p = Vector3::new(x_h[0] / x_h[3], x_h[1] / x_h[3], x_h[2] / x_h[3]);
    p.iter().all(|c| c.is_finite()).then_some(p)
}

/// Angle (radians) subtended at `point` by two camera centers.
pub fn parallax_angle(point: &Vector3<f64>, center1: &Vector3<f64>, center2: &Vector3<f64>) -> f64 {
    let r1 = center1 - point;
    let r2 = center2 - point;
    let denom = r1.norm() * r2.norm();
    if denom < 1e-12 {
        return 0.0;
    }
    (r1.dot(&r2) / denom).clamp(-1.0, 1.0).acos()
}

/// Largest parallax angle over all pairs of camera centers.
pub fn max_parallax(point: &Vector3<f64>, centers: &[Vector3<f64>]) -> f64 {
    let mut best = 0.0_f64;
    for i in 0..centers.len() {
        for j in (i + 1)..centers.len() {
            best = best.max(parallax_angle(point, &centers[i], &centers[j]));
        }
    }
    best
}

/// Reprojection error in pixels of a world point in one view.
pub fn reprojection_error(point: &Vector3<f64>, view: &View<'_>) -> Option<f64> {
    let p_cam = view.pose_wc.inverse().transform_point(point);
    view.intrinsics
        .project(&p_cam)
        .map(|uv| (uv - view.pixel).norm())
}

/// Check depth, reprojection and parallax of a triangulated point.
pub fn validate_triangulation(
    point: &Vector3<f64>,
    v1: &View<'_>,
    v2: &View<'_>,
    config: &TriangulationConfig,
) -> Result<(), TriangulationReject> {
    for view in [v1, v2] {
        let depth = view.pose_wc.inverse().transform_point(point).z;
        if depth <= MIN_DEPTH {
            return Err(TriangulationReject::BehindCamera);
        }
    }

    let parallax = parallax_angle(point, &v1.pose_wc.translation, &v2.pose_wc.translation);
    if parallax < config.min_parallax_rad() {
        return Err(TriangulationReject::LowParallax);
    }

    for view in [v1, v2] {
        match reprojection_error(point, view) {
            Some(err) if err <= config.max_reprojection_px => {}
            _ => return Err(TriangulationReject::Reprojection),
        }
    }

    Ok(())
}

/// Triangulate and validate a point from two views.
pub fn triangulate_pair(
    v1: &View<'_>,
    v2: &View<'_>,
    config: &TriangulationConfig,
) -> Result<Vector3<f64>, TriangulationReject> {
    let xn1 = v1.intrinsics.pixel_to_normalized(&v1.pixel);
    let xn2 = v2.intrinsics.pixel_to_normalized(&v2.pixel);
    let point = triangulate_dlt(&xn1, &xn2, v1.pose_wc, v2.pose_wc)
        .ok_or(TriangulationReject::Degenerate)?;
    validate_triangulation(&point, v1, v2, config)?;
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> Intrinsics {
        Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0)
    }

    fn project(cam: &Intrinsics, pose_wc: &SE3, p: &Vector3<f64>) -> Vector2<f64> {
        cam.project(&pose_wc.inverse().transform_point(p)).unwrap()
    }

    #[test]
    fn test_triangulate_recovers_point() {
        let cam = camera();
        let pose1 = SE3::identity();
        let pose2 = SE3 {
            translation: Vector3::new(0.5, 0.0, 0.0),
            ..SE3::from_axis_angle(&Vector3::y(), -0.05)
        };
        let p = Vector3::new(0.3, -0.2, 5.0);

        let v1 = View { pose_wc: &pose1, intrinsics: &cam, pixel: project(&cam, &pose1, &p) };
        let v2 = View { pose_wc: &pose2, intrinsics: &cam, pixel: project(&cam, &pose2, &p) };

        let tri = triangulate_pair(&v1, &v2, &TriangulationConfig::default()).unwrap();
        assert_relative_eq!(tri, p, epsilon = 1e-8);
    }

    #[test]
    fn test_rejects_low_parallax() {
        let cam = camera();
        let pose1 = SE3::identity();
        let pose2 = SE3 {
            translation: Vector3::new(0.01, 0.0, 0.0),
            ..SE3::identity()
        };
        let p = Vector3::new(0.0, 0.0, 20.0);

        let v1 = View { pose_wc: &pose1, intrinsics: &cam, pixel: project(&cam, &pose1, &p) };
        let v2 = View { pose_wc: &pose2, intrinsics: &cam, pixel: project(&cam, &pose2, &p) };

        let result = triangulate_pair(&v1, &v2, &TriangulationConfig::default());
        assert_eq!(result, Err(TriangulationReject::LowParallax));
    }

    #[test]
    fn test_rejects_point_behind_camera() {
        let cam = camera();
        let pose1 = SE3::identity();
        let pose2 = SE3 {
            translation: Vector3::new(1.0, 0.0, 0.0),
            ..SE3::identity()
        };
        let p = Vector3::new(0.5, 0.0, -4.0);
        let v1 = View { pose_wc: &pose1, intrinsics: &cam, pixel: Vector2::new(320.0, 240.0) };
        let v2 = View { pose_wc: &pose2, intrinsics: &cam, pixel: Vector2::new(320.0, 240.0) };

        assert_eq!(
            validate_triangulation(&p, &v1, &v2, &TriangulationConfig::default()),
            Err(TriangulationReject::BehindCamera)
        );
    }

    #[test]
    fn test_parallax_angle_right_angle() {
        let p = Vector3::zeros();
        let angle = parallax_angle(&p, &Vector3::x(), &Vector3::y());
        assert_relative_eq!(angle, std::f64::consts::FRAC_PI_2, epsilon = 1e-12);

        let centers = [Vector3::x(), Vector3::new(1.0, 0.1, 0.0), Vector3::y()];
        assert_relative_eq!(max_parallax(&p, &centers), std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_symmetric_cross_product() {
        let a = Vector3::new(1.0, -2.0, 0.5);
        let b = Vector3::new(0.3, 0.7, -1.1);
        assert_relative_eq!(skew_symmetric(&a) * b, a.cross(&b), epsilon = 1e-12);
    }
}
