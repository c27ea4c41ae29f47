//! Two-view relative pose from the essential matrix.
//!
//! Inputs are undistorted normalized coordinates. The essential matrix
//! satisfies `x2^T E x1 = 0` for `X2 = R * X1 + t`, and the recovered
//! translation has unit norm (monocular scale is unobservable).

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

use super::ransac::{ransac, Estimator, RansacConfig};
use super::triangulation::triangulate_dlt;
use super::SE3;
use crate::error::GeometryError;

/// Minimum share of inliers that must triangulate in front of both cameras.
const MIN_CHEIRALITY_RATIO: f64 = 0.5;

/// Relative pose of a second camera with respect to the first.
#[derive(Debug, Clone)]
pub struct RelativePose {
    /// Camera-to-world pose of camera 2, where world is camera 1's frame.
    pub pose2_wc: SE3,
    /// Indices of correspondences consistent with the pose (epipolar + cheirality).
    pub inliers: Vec<usize>,
    pub essential: Matrix3<f64>,
}

/// Hartley normalization: zero centroid, mean distance sqrt(2).
fn normalize_points(pts: &[Vector2<f64>]) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let n = pts.len() as f64;
    let centroid = pts.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = pts.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * centroid.x, 0.0, s, -s * centroid.y, 0.0, 0.0, 1.0);
    let normalized = pts.iter().map(|p| (p - centroid) * s).collect();
    (normalized, t)
}

/// Closest rank-2 matrix (singular values s1, s2, 0).
fn enforce_rank2(m: &Matrix3<f64>) -> Result<Matrix3<f64>, GeometryError> {
    let svd = m.svd(true, true);
    let u = svd.u.ok_or(GeometryError::SvdFailed("rank-2 projection"))?;
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed("rank-2 projection"))?;
    let s = svd.singular_values;
    Ok(u * Matrix3::from_diagonal(&Vector3::new(s[0], s[1], 0.0)) * v_t)
}

/// Project a matrix onto the essential manifold (singular values s, s, 0).
fn enforce_essential_constraints(e: &Matrix3<f64>) -> Result<Matrix3<f64>, GeometryError> {
    let svd = e.svd(true, true);
    let u = svd.u.ok_or(GeometryError::SvdFailed("essential projection"))?;
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed("essential projection"))?;
    let s = 0.5 * (svd.singular_values[0] + svd.singular_values[1]);
    Ok(u * Matrix3::from_diagonal(&Vector3::new(s, s, 0.0)) * v_t)
}

/// Normalized 8-point algorithm for the essential matrix.
pub fn essential_8point(x1: &[Vector2<f64>], x2: &[Vector2<f64>]) -> Result<Matrix3<f64>, GeometryError> {
    let n = x1.len();
    if n < 8 || x2.len() != n {
        return Err(GeometryError::NotEnoughPoints { needed: 8, got: n.min(x2.len()) });
    }

    let (p1, t1) = normalize_points(x1);
    let (p2, t2) = normalize_points(x2);

    let rows = n.max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (a1, a2)) in p1.iter().zip(p2.iter()).enumerate() {
        let (x, y, xp, yp) = (a1.x, a1.y, a2.x, a2.y);
        a[(i, 0)] = xp * x;
        a[(i, 1)] = xp * y;
        a[(i, 2)] = xp;
        a[(i, 3)] = yp * x;
        a[(i, 4)] = yp * y;
        a[(i, 5)] = yp;
        a[(i, 6)] = x;
        a[(i, 7)] = y;
        a[(i, 8)] = 1.0;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed("8-point"))?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or(GeometryError::SvdFailed("8-point"))?;
    let e_vec = v_t.row(min_idx);

    let mut e = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            e[(r, c)] = e_vec[3 * r + c];
        }
    }

    // Equal singular values only hold in the original coordinates.
    let e = t2.transpose() * enforce_rank2(&e)? * t1;
    let norm = e.norm();
    if norm < 1e-12 {
        return Err(GeometryError::Degenerate("zero essential matrix"));
    }
    enforce_essential_constraints(&(e / norm))
}

/// Decompose an essential matrix into the four (R, t) candidates.
pub fn decompose_essential(e: &Matrix3<f64>) -> Result<[(Matrix3<f64>, Vector3<f64>); 4], GeometryError> {
    let svd = e.svd(true, true);
    let mut u = svd.u.ok_or(GeometryError::SvdFailed("essential decomposition"))?;
    let mut v_t = svd.v_t.ok_or(GeometryError::SvdFailed("essential decomposition"))?;

    if u.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    if v_t.determinant() < 0.0 {
        v_t.row_mut(2).neg_mut();
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t: Vector3<f64> = u.column(2).normalize();

    Ok([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// First-order geometric (Sampson) error, squared, in normalized units.
pub fn sampson_distance(e: &Matrix3<f64>, x1: &Vector2<f64>, x2: &Vector2<f64>) -> f64 {
    let x1h = x1.push(1.0);
    let x2h = x2.push(1.0);
    let ex1 = e * x1h;
    let etx2 = e.transpose() * x2h;
    let num = x2h.dot(&ex1);
    let den = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if den < 1e-18 {
        return f64::INFINITY;
    }
    num * num / den
}

struct EssentialEstimator<'a> {
    x1: &'a [Vector2<f64>],
    x2: &'a [Vector2<f64>],
}

impl Estimator for EssentialEstimator<'_> {
    type Model = Matrix3<f64>;
    const MIN_SAMPLES: usize = 8;

    fn num_data(&self) -> usize {
        self.x1.len()
    }

    fn fit(&self, sample: &[usize]) -> Option<Matrix3<f64>> {
        let a: Vec<_> = sample.iter().map(|&i| self.x1[i]).collect();
        let b: Vec<_> = sample.iter().map(|&i| self.x2[i]).collect();
        essential_8point(&a, &b).ok()
    }

    fn residual(&self, model: &Matrix3<f64>, index: usize) -> f64 {
        sampson_distance(model, &self.x1[index], &self.x2[index])
    }

    fn refit(&self, inliers: &[usize]) -> Option<Matrix3<f64>> {
        self.fit(inliers)
    }
}

/// Count correspondences that triangulate in front of both cameras.
fn cheirality_inliers(
    x1: &[Vector2<f64>],
    x2: &[Vector2<f64>],
    candidates: &[usize],
    pose2_wc: &SE3,
) -> Vec<usize> {
    let pose1 = SE3::identity();
    let pose2_cw = pose2_wc.inverse();
    candidates
        .iter()
        .copied()
        .filter(|&i| {
            triangulate_dlt(&x1[i], &x2[i], &pose1, pose2_wc)
                .map(|p| p.z > 0.0 && pose2_cw.transform_point(&p).z > 0.0)
                .unwrap_or(false)
        })
        .collect()
}

/// Robustly estimate the relative pose between two views.
///
/// `focal_px` converts the pixel threshold of `config` to normalized units.
pub fn estimate_relative_pose(
    x1: &[Vector2<f64>],
    x2: &[Vector2<f64>],
    config: &RansacConfig,
    focal_px: f64,
    min_inliers: usize,
) -> Result<RelativePose, GeometryError> {
    if x1.len() != x2.len() {
        return Err(GeometryError::Degenerate("mismatched correspondence lists"));
    }
    let threshold = (config.threshold_px / focal_px).powi(2);
    let estimator = EssentialEstimator { x1, x2 };
    let outcome = ransac(&estimator, config, threshold, min_inliers)?;

    let mut best: Option<(SE3, Vec<usize>)> = None;
    for (r, t) in decompose_essential(&outcome.model)? {
        // (R, t) maps camera-1 coordinates into camera 2.
        let pose2_wc = SE3::from_rt(&r, t).inverse();
        let good = cheirality_inliers(x1, x2, &outcome.inliers, &pose2_wc);
        if best.as_ref().map_or(true, |(_, b)| good.len() > b.len()) {
            best = Some((pose2_wc, good));
        }
    }

    let Some((pose2_wc, inliers)) = best else {
        return Err(GeometryError::Degenerate("no pose candidate"));
    };
    if (inliers.len() as f64) < MIN_CHEIRALITY_RATIO * outcome.inliers.len() as f64
        || inliers.len() < min_inliers
    {
        return Err(GeometryError::Degenerate("points fail cheirality"));
    }

    Ok(RelativePose {
        pose2_wc,
        inliers,
        essential: outcome.model,
    })
}
