//! PnP (Perspective-n-Point): camera pose from 3D-2D correspondences.
//!
//! Hypotheses come from a linear DLT on undistorted normalized coordinates
//! inside RANSAC; the consensus pose is then refined with Levenberg-Marquardt
//! on the inliers.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn, Matrix2x3, Matrix3, Matrix3x4, Vector2, Vector3, Vector6};

use super::camera::{Intrinsics, MIN_DEPTH};
use super::ransac::{ransac, Estimator, RansacConfig};
use super::triangulation::skew_symmetric;
use super::SE3;
use crate::error::GeometryError;

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated camera pose (T_wc).
    pub pose: SE3,
    /// Inlier mask per correspondence.
    pub inlier_mask: Vec<bool>,
    /// Reprojection error per correspondence (in pixels).
    pub reproj_errors: Vec<f64>,
}

impl PnPResult {
    pub fn num_inliers(&self) -> usize {
        self.inlier_mask.iter().filter(|&&m| m).count()
    }
}

/// Linear PnP on normalized coordinates. Returns T_cw.
pub fn pnp_dlt(world: &[Vector3<f64>], normalized: &[Vector2<f64>]) -> Result<SE3, GeometryError> {
    let n = world.len();
    if n < 6 || normalized.len() != n {
        return Err(GeometryError::NotEnoughPoints { needed: 6, got: n });
    }

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (pw, xn)) in world.iter().zip(normalized.iter()).enumerate() {
        let (x, y, z) = (pw.x, pw.y, pw.z);
        let (r0, r1) = (2 * i, 2 * i + 1);

        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = z;
        a[(r0, 3)] = 1.0;
        a[(r0, 8)] = -xn.x * x;
        a[(r0, 9)] = -xn.x * y;
        a[(r0, 10)] = -xn.x * z;
        a[(r0, 11)] = -xn.x;

        a[(r1, 4)] = x;
        a[(r1, 5)] = y;
        a[(r1, 6)] = z;
        a[(r1, 7)] = 1.0;
        a[(r1, 8)] = -xn.y * x;
        a[(r1, 9)] = -xn.y * y;
        a[(r1, 10)] = -xn.y * z;
        a[(r1, 11)] = -xn.y;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed("PnP DLT"))?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or(GeometryError::SvdFailed("PnP DLT"))?;
    let p_vec = v_t.row(min_idx);

    let mut p = Matrix3x4::<f64>::zeros();
    for r in 0..3 {
        for c in 0..4 {
            p[(r, c)] = p_vec[4 * r + c];
        }
    }

    // Fix the projective sign so that the rotation block is proper.
    let m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();
    if m.determinant() < 0.0 {
        p = -p;
    }
    let m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();

    let svd_m = m.svd(true, true);
    let u = svd_m.u.ok_or(GeometryError::SvdFailed("PnP rotation"))?;
    let v_t = svd_m.v_t.ok_or(GeometryError::SvdFailed("PnP rotation"))?;
    let scale = svd_m.singular_values.mean();
    if scale.abs() < 1e-12 {
        return Err(GeometryError::Degenerate("planar or collinear PnP sample"));
    }
    let rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        return Err(GeometryError::Degenerate("improper PnP rotation"));
    }
    let translation: Vector3<f64> = p.column(3).into_owned() / scale;

    Ok(SE3::from_rt(&rotation, translation))
}

fn reprojection_px(pose_cw: &SE3, intrinsics: &Intrinsics, pw: &Vector3<f64>, uv: &Vector2<f64>) -> f64 {
    intrinsics
        .project(&pose_cw.transform_point(pw))
        .map_or(f64::INFINITY, |proj| (proj - uv).norm())
}

struct PnpEstimator<'a> {
    world: &'a [Vector3<f64>],
    pixels: &'a [Vector2<f64>],
    normalized: Vec<Vector2<f64>>,
    intrinsics: &'a Intrinsics,
}

impl Estimator for PnpEstimator<'_> {
    /// World-to-camera pose.
    type Model = SE3;
    const MIN_SAMPLES: usize = 6;

    fn num_data(&self) -> usize {
        self.world.len()
    }

    fn fit(&self, sample: &[usize]) -> Option<SE3> {
        let w: Vec<_> = sample.iter().map(|&i| self.world[i]).collect();
        let x: Vec<_> = sample.iter().map(|&i| self.normalized[i]).collect();
        pnp_dlt(&w, &x).ok()
    }

    fn residual(&self, model: &SE3, index: usize) -> f64 {
        reprojection_px(model, self.intrinsics, &self.world[index], &self.pixels[index])
    }

    fn refit(&self, inliers: &[usize]) -> Option<SE3> {
        self.fit(inliers)
    }
}

/// Pose-only least squares over normalized reprojection residuals scaled to pixels.
///
/// Parameters are a left perturbation of `initial_cw`.
struct PoseRefinementProblem<'a> {
    initial_cw: SE3,
    delta: Vector6<f64>,
    world: Vec<Vector3<f64>>,
    normalized: Vec<Vector2<f64>>,
    intrinsics: &'a Intrinsics,
}

impl PoseRefinementProblem<'_> {
    fn pose_cw(&self) -> SE3 {
        self.initial_cw.retract_left(&self.delta)
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PoseRefinementProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.delta = Vector6::from_iterator(x.iter().copied());
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_iterator(6, self.delta.iter().copied())
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let pose = self.pose_cw();
        let mut r = DVector::zeros(self.world.len() * 2);
        for (i, (pw, xn)) in self.world.iter().zip(self.normalized.iter()).enumerate() {
            let pc = pose.transform_point(pw);
            if pc.z <= MIN_DEPTH {
                return None;
            }
            r[2 * i] = self.intrinsics.fx * (pc.x / pc.z - xn.x);
            r[2 * i + 1] = self.intrinsics.fy * (pc.y / pc.z - xn.y);
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let pose = self.pose_cw();
        let mut j = DMatrix::zeros(self.world.len() * 2, 6);
        for (i, pw) in self.world.iter().enumerate() {
            let pc = pose.transform_point(pw);
            if pc.z <= MIN_DEPTH {
                return None;
            }
            let invz = 1.0 / pc.z;
            let d_proj = Matrix2x3::new(
                self.intrinsics.fx * invz,
                0.0,
                -self.intrinsics.fx * pc.x * invz * invz,
                0.0,
                self.intrinsics.fy * invz,
                -self.intrinsics.fy * pc.y * invz * invz,
            );
            let d_rot = d_proj * (-skew_symmetric(&pc));
            j.view_mut((2 * i, 0), (2, 3)).copy_from(&d_rot);
            j.view_mut((2 * i, 3), (2, 3)).copy_from(&d_proj);
        }
        Some(j)
    }
}

/// Refine a world-to-camera pose on inlier correspondences.
fn refine_pose(
    initial_cw: SE3,
    world: Vec<Vector3<f64>>,
    normalized: Vec<Vector2<f64>>,
    intrinsics: &Intrinsics,
) -> SE3 {
    let problem = PoseRefinementProblem {
        initial_cw,
        delta: Vector6::zeros(),
        world,
        normalized,
        intrinsics,
    };
    let (problem, report) = LevenbergMarquardt::new().minimize(problem);
    if report.termination.was_successful() && report.objective_function.is_finite() {
        problem.pose_cw()
    } else {
        initial_cw
    }
}

/// Solve PnP with RANSAC given 3D-2D correspondences.
///
/// Returns the camera-to-world pose with per-correspondence inlier flags and
/// reprojection errors, measured after refinement.
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
    intrinsics: &Intrinsics,
    config: &RansacConfig,
    min_inliers: usize,
) -> Result<PnPResult, GeometryError> {
    if points3d.len() != pixels.len() {
        return Err(GeometryError::Degenerate("mismatched correspondence lists"));
    }
    let estimator = PnpEstimator {
        world: points3d,
        pixels,
        normalized: pixels.iter().map(|uv| intrinsics.pixel_to_normalized(uv)).collect(),
        intrinsics,
    };
    let outcome = ransac(&estimator, config, config.threshold_px, min_inliers)?;

    let world: Vec<_> = outcome.inliers.iter().map(|&i| points3d[i]).collect();
    let normalized: Vec<_> = outcome.inliers.iter().map(|&i| estimator.normalized[i]).collect();
    let pose_cw = refine_pose(outcome.model, world, normalized, intrinsics);

    let reproj_errors: Vec<f64> = points3d
        .iter()
        .zip(pixels.iter())
        .map(|(pw, uv)| reprojection_px(&pose_cw, intrinsics, pw, uv))
        .collect();
    let inlier_mask = reproj_errors.iter().map(|&e| e <= config.threshold_px).collect();

    Ok(PnPResult {
        pose: pose_cw.inverse(),
        inlier_mask,
        reproj_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn setup(n: usize) -> (SE3, Intrinsics, Vec<Vector3<f64>>, Vec<Vector2<f64>>) {
        let intrinsics = Intrinsics::pinhole(520.0, 515.0, 320.0, 240.0);
        let pose_wc = SE3 {
            translation: Vector3::new(0.4, -0.2, 0.3),
            ..SE3::from_axis_angle(&Vector3::new(0.1, 1.0, 0.0), 0.15)
        };
        let pose_cw = pose_wc.inverse();
        let mut rng = StdRng::seed_from_u64(11);
        let mut world = Vec::new();
        let mut pixels = Vec::new();
        while world.len() < n {
            let pw = Vector3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(4.0..8.0),
            );
            if let Some(uv) = intrinsics.project(&pose_cw.transform_point(&pw)) {
                world.push(pw);
                pixels.push(uv);
            }
        }
        (pose_wc, intrinsics, world, pixels)
    }

    #[test]
    fn test_dlt_exact_on_clean_data() {
        let (pose_wc, intrinsics, world, pixels) = setup(12);
        let normalized: Vec<_> = pixels.iter().map(|uv| intrinsics.pixel_to_normalized(uv)).collect();
        let pose_cw = pnp_dlt(&world, &normalized).unwrap();
        assert_relative_eq!(pose_cw.inverse().translation, pose_wc.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let (pose_wc, intrinsics, mut world, mut pixels) = setup(50);
        for i in 0..8 {
            world.push(Vector3::new(i as f64 * 0.3, 1.0, 6.0));
            pixels.push(Vector2::new(20.0 + 40.0 * i as f64, 460.0));
        }

        let result = solve_pnp_ransac(&world, &pixels, &intrinsics, &RansacConfig::default(), 20).unwrap();
        assert_eq!(result.num_inliers(), 50);
        assert!(result.inlier_mask[..50].iter().all(|&m| m));
        assert_relative_eq!(result.pose.translation, pose_wc.translation, epsilon = 1e-6);
        assert!(result.pose.angular_distance(&pose_wc) < 1e-6);
    }

    #[test]
    fn test_refinement_reduces_noise_error() {
        let (pose_wc, intrinsics, world, pixels) = setup(80);
        let mut rng = StdRng::seed_from_u64(3);
        let noisy: Vec<_> = pixels
            .iter()
            .map(|uv| uv + Vector2::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5)))
            .collect();

        let result = solve_pnp_ransac(&world, &noisy, &intrinsics, &RansacConfig::default(), 20).unwrap();
        assert!((result.pose.translation - pose_wc.translation).norm() < 0.05);
        let mean_err = result.reproj_errors.iter().sum::<f64>() / result.reproj_errors.len() as f64;
        assert!(mean_err < 0.6);
    }

    #[test]
    fn test_not_enough_points() {
        let (_, intrinsics, world, pixels) = setup(4);
        let err = solve_pnp_ransac(&world, &pixels, &intrinsics, &RansacConfig::default(), 4).unwrap_err();
        assert_eq!(err, GeometryError::NotEnoughPoints { needed: 6, got: 4 });
    }
}
