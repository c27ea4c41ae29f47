//! Scale Calibrator: store coordinates to metric coordinates.
//!
//! A monocular reconstruction is defined up to a similarity. Given a few
//! points with known metric coordinates (or camera pairs with a known
//! metric distance) the calibrator estimates the [`Sim3`] that maps store
//! coordinates onto them. The store itself is never modified; the transform
//! is applied at export time.
//!
//! # Algorithm
//!
//! Umeyama's closed-form least-squares similarity:
//! 1. Center both point sets on their centroids
//! 2. SVD of the cross-covariance Σ = (1/n) Σ_i y_i x_iᵀ = U D Vᵀ
//! 3. R = U S Vᵀ with S = diag(1, 1, det(U)det(V)) to exclude reflections
//! 4. s = tr(D S) / σ²_x, t = μ_y - s R μ_x

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CalibrationError;
use crate::geometry::Sim3;
use crate::map::{KeyframeId, LandmarkId, PoseGraph};

/// Ratio of the second to the first singular value of the source spread
/// below which the control points count as collinear.
const DEFAULT_COLLINEARITY_TOLERANCE: f64 = 1e-3;

/// What a control point is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ControlTarget {
    Landmark(LandmarkId),
    /// The camera center of a keyframe.
    Camera(KeyframeId),
}

impl std::fmt::Display for ControlTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlTarget::Landmark(id) => write!(f, "{id}"),
            ControlTarget::Camera(id) => write!(f, "camera {id}"),
        }
    }
}

/// A store entity with known metric coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPoint {
    pub target: ControlTarget,
    pub metric: Vector3<f64>,
}

impl ControlPoint {
    pub fn landmark(id: LandmarkId, metric: Vector3<f64>) -> Self {
        Self {
            target: ControlTarget::Landmark(id),
            metric,
        }
    }

    pub fn camera(id: KeyframeId, metric: Vector3<f64>) -> Self {
        Self {
            target: ControlTarget::Camera(id),
            metric,
        }
    }
}

/// Known metric distance between two camera centers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceConstraint {
    pub a: KeyframeId,
    pub b: KeyframeId,
    pub metric_distance: f64,
}

/// Estimated store-to-metric similarity with its fit residuals.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub transform: Sim3,
    /// RMS of `per_point_errors` (metric units).
    pub rms_error: f64,
    /// Residual per control point or constraint, in input order.
    pub per_point_errors: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct ScaleCalibrator {
    collinearity_tolerance: f64,
}

impl Default for ScaleCalibrator {
    fn default() -> Self {
        Self {
            collinearity_tolerance: DEFAULT_COLLINEARITY_TOLERANCE,
        }
    }
}

impl ScaleCalibrator {
    pub fn new(collinearity_tolerance: f64) -> Self {
        Self { collinearity_tolerance }
    }

    /// Store-space position of a control target.
    fn resolve(graph: &PoseGraph, target: ControlTarget) -> Result<Vector3<f64>, CalibrationError> {
        let position = match target {
            ControlTarget::Landmark(id) => graph.landmark(id).map(|lm| lm.position),
            ControlTarget::Camera(id) => graph.keyframe(id).and_then(|kf| kf.camera_center()),
        };
        position.ok_or_else(|| CalibrationError::UnknownTarget(target.to_string()))
    }

    /// Least-squares similarity from control points (at least 3, not collinear).
    pub fn calibrate(&self, graph: &PoseGraph, points: &[ControlPoint]) -> Result<Calibration, CalibrationError> {
        if points.len() < 3 {
            return Err(CalibrationError::Underdetermined { got: points.len() });
        }
        let source = points
            .iter()
            .map(|cp| Self::resolve(graph, cp.target))
            .collect::<Result<Vec<_>, _>>()?;
        let target: Vec<Vector3<f64>> = points.iter().map(|cp| cp.metric).collect();

        let transform = self.umeyama(&source, &target)?;
        let per_point_errors: Vec<f64> = source
            .iter()
            .zip(&target)
            .map(|(s, t)| (transform.transform_point(s) - t).norm())
            .collect();
        let rms_error = rms(&per_point_errors);

        info!(
            "[Calibration] {} control points: scale {:.6}, rms error {:.4}",
            points.len(),
            transform.scale,
            rms_error
        );

        Ok(Calibration {
            transform,
            rms_error,
            per_point_errors,
        })
    }

    fn umeyama(&self, source: &[Vector3<f64>], target: &[Vector3<f64>]) -> Result<Sim3, CalibrationError> {
        let n = source.len() as f64;
        let mu_x: Vector3<f64> = source.iter().sum::<Vector3<f64>>() / n;
        let mu_y: Vector3<f64> = target.iter().sum::<Vector3<f64>>() / n;

        let mut spread = Matrix3::zeros();
        let mut cov = Matrix3::zeros();
        let mut var_x = 0.0;
        for (x, y) in source.iter().zip(target) {
            let dx = x - mu_x;
            let dy = y - mu_y;
            spread += dx * dx.transpose();
            cov += dy * dx.transpose();
            var_x += dx.norm_squared();
        }
        cov /= n;
        var_x /= n;

        let sv = spread.symmetric_eigenvalues();
        let mut sv: Vec<f64> = sv.iter().map(|v| v.max(0.0).sqrt()).collect();
        sv.sort_by(|a, b| b.total_cmp(a));
        if sv[0] < 1e-12 || var_x < 1e-24 {
            return Err(CalibrationError::Degenerate("control points coincide"));
        }
        if sv[1] < self.collinearity_tolerance * sv[0] {
            return Err(CalibrationError::Collinear);
        }

        let svd = cov.svd(true, true);
        let u = svd.u.ok_or(CalibrationError::Degenerate("svd failed"))?;
        let v_t = svd.v_t.ok_or(CalibrationError::Degenerate("svd failed"))?;
        let d = svd.singular_values;

        let mut s = Vector3::new(1.0, 1.0, 1.0);
        if u.determinant() * v_t.determinant() < 0.0 {
            // Singular values come sorted; flip the smallest.
            s[2] = -1.0;
        }
        let rotation = u * Matrix3::from_diagonal(&s) * v_t;
        let scale = d.component_mul(&s).sum() / var_x;
        if !(scale.is_finite() && scale > 0.0) {
            return Err(CalibrationError::Degenerate("non-positive scale"));
        }
        let translation = mu_y - scale * (rotation * mu_x);

        debug!(
            "[Calibration] singular values of source spread: {:.3e} {:.3e} {:.3e}",
            sv[0], sv[1], sv[2]
        );

        Ok(Sim3::from_rts(rotation, translation, scale))
    }

    /// Scale-only calibration from known camera-to-camera distances.
    ///
    /// Minimizes Σ (s·d_i - m_i)² over s, giving s = Σ d_i m_i / Σ d_i².
    /// Rotation and translation stay the identity.
    pub fn from_distances(
        &self,
        graph: &PoseGraph,
        constraints: &[DistanceConstraint],
    ) -> Result<Calibration, CalibrationError> {
        if constraints.is_empty() {
            return Err(CalibrationError::Underdetermined { got: 0 });
        }

        let mut store_distances = Vec::with_capacity(constraints.len());
        for c in constraints {
            let a = Self::resolve(graph, ControlTarget::Camera(c.a))?;
            let b = Self::resolve(graph, ControlTarget::Camera(c.b))?;
            let d = (a - b).norm();
            if d < 1e-12 {
                return Err(CalibrationError::Degenerate("zero store-space distance"));
            }
            store_distances.push(d);
        }

        let num: f64 = store_distances
            .iter()
            .zip(constraints)
            .map(|(d, c)| d * c.metric_distance)
            .sum();
        let den: f64 = store_distances.iter().map(|d| d * d).sum();
        let scale = num / den;
        if !(scale.is_finite() && scale > 0.0) {
            return Err(CalibrationError::Degenerate("non-positive scale"));
        }

        let per_point_errors: Vec<f64> = store_distances
            .iter()
            .zip(constraints)
            .map(|(d, c)| (scale * d - c.metric_distance).abs())
            .collect();
        let rms_error = rms(&per_point_errors);

        info!(
            "[Calibration] {} distance constraints: scale {:.6}, rms error {:.4}",
            constraints.len(),
            scale,
            rms_error
        );

        Ok(Calibration {
            transform: Sim3::from_scale(scale),
            rms_error,
            per_point_errors,
        })
    }
}

fn rms(errors: &[f64]) -> f64 {
    if errors.is_empty() {
        return 0.0;
    }
    (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
}
