//! Bundle adjustment: refinement snapshot and the built-in solver.
//!
//! Refinement runs in three phases so that the solve itself holds no lock:
//! 1. collect a [`RefinementProblem`] snapshot under a read lock
//! 2. solve it lock-free with a [`BundleAdjuster`]
//! 3. apply the [`RefinementSolution`] under the write lock
//!
//! # Theory
//!
//! Bundle adjustment minimizes the robust reprojection error:
//!
//! ```text
//! E = Σ_ij ρ(||u_ij - π(T_i, p_j)||)
//! ```
//!
//! [`LmBundleAdjuster`] runs Levenberg-Marquardt on the normal equations,
//! eliminating the points with the Schur complement so only the reduced
//! camera system is solved densely:
//!
//! ```text
//! (U - W V⁻¹ Wᵀ) δc = b_c - W V⁻¹ b_p
//! δp = V⁻¹ (b_p - Wᵀ δc)
//! ```
//!
//! Poses are updated with a left perturbation of T_cw; residuals are
//! measured in ideal (undistorted) pixels.

use std::collections::HashMap;

use nalgebra::{
    DMatrix, DVector, Matrix2x3, Matrix2x6, Matrix3, Matrix6, Matrix6x3, SMatrix, Vector2, Vector3, Vector6,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::BundleAdjuster;
use crate::error::RefineError;
use crate::geometry::{Intrinsics, SE3};
use crate::map::{KeyframeId, LandmarkId};

/// Points closer than this (camera z) get a fixed penalty instead of a projection.
const MIN_BA_DEPTH: f64 = 1e-3;

/// Residual assigned to an observation behind its camera.
const BEHIND_CAMERA_PENALTY_PX: f64 = 100.0;

/// Which part of the graph a refinement pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementScope {
    /// Window around a newly registered keyframe.
    Local(KeyframeId),
    /// Every registered keyframe and every landmark.
    Global,
}

impl std::fmt::Display for RefinementScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefinementScope::Local(kf) => write!(f, "Local({kf})"),
            RefinementScope::Global => f.write_str("Global"),
        }
    }
}

/// A camera in the refinement snapshot.
#[derive(Debug, Clone)]
pub struct ProblemCamera {
    pub kf_id: KeyframeId,
    /// World-to-camera pose (T_cw).
    pub pose_cw: SE3,
    pub intrinsics: Intrinsics,
    /// Held constant by the solver.
    pub fixed: bool,
}

/// A landmark in the refinement snapshot.
#[derive(Debug, Clone)]
pub struct ProblemPoint {
    pub lm_id: LandmarkId,
    pub position: Vector3<f64>,
}

/// One observation edge of the snapshot.
#[derive(Debug, Clone)]
pub struct ProblemObservation {
    /// Index into [`RefinementProblem::cameras`].
    pub camera: usize,
    /// Index into [`RefinementProblem::points`].
    pub point: usize,
    pub feature_idx: usize,
    /// Observed position, undistorted normalized coordinates.
    pub normalized: Vector2<f64>,
}

/// Snapshot of poses, landmarks and observations submitted to a [`BundleAdjuster`].
#[derive(Debug, Clone)]
pub struct RefinementProblem {
    pub scope: RefinementScope,
    /// Store revision the snapshot was taken at.
    pub base_revision: u64,
    pub cameras: Vec<ProblemCamera>,
    pub points: Vec<ProblemPoint>,
    pub observations: Vec<ProblemObservation>,
}

impl RefinementProblem {
    pub fn num_optimized_cameras(&self) -> usize {
        self.cameras.iter().filter(|c| !c.fixed).count()
    }

    /// Residual (ideal pixels) of one observation for the given camera and point state.
    pub fn residual(&self, obs: &ProblemObservation, pose_cw: &SE3, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        let cam = &self.cameras[obs.camera].intrinsics;
        let p_cam = pose_cw.transform_point(point);
        if p_cam.z <= MIN_BA_DEPTH {
            return None;
        }
        let proj = Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
        // Error = observed - projected (g2o convention)
        Some(Vector2::new(
            cam.fx * (obs.normalized.x - proj.x),
            cam.fy * (obs.normalized.y - proj.y),
        ))
    }
}

/// Refined values returned by a [`BundleAdjuster`].
#[derive(Debug, Clone)]
pub struct RefinementSolution {
    /// Refined camera-to-world poses of the non-fixed cameras.
    pub poses_wc: HashMap<KeyframeId, SE3>,
    pub points: HashMap<LandmarkId, Vector3<f64>>,
    /// Reprojection error (pixels) per observation, in problem order.
    pub residuals: Vec<f64>,
    pub iterations: usize,
    /// RMS reprojection error before refinement (pixels).
    pub initial_rms: f64,
    /// RMS reprojection error after refinement (pixels).
    pub final_rms: f64,
    pub converged: bool,
}

/// Solver parameters for [`LmBundleAdjuster`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Huber kernel threshold (pixels).
    pub huber_px: f64,
    /// Convergence threshold on the gradient (max norm).
    pub gradient_tolerance: f64,
    /// Convergence threshold on the relative cost decrease.
    pub cost_tolerance: f64,
    /// Convergence threshold on step size.
    pub param_tolerance: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            huber_px: 5.991_f64.sqrt(), // ~2.45 pixels (95% chi2 with 2 DOF)
            gradient_tolerance: 1e-10,
            cost_tolerance: 1e-12,
            param_tolerance: 1e-12,
        }
    }
}

/// Built-in Levenberg-Marquardt bundle adjuster.
#[derive(Debug, Clone, Default)]
pub struct LmBundleAdjuster {
    config: LmConfig,
}

impl LmBundleAdjuster {
    pub fn new(config: LmConfig) -> Self {
        Self { config }
    }
}

impl BundleAdjuster for LmBundleAdjuster {
    fn refine(
        &self,
        problem: &RefinementProblem,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<RefinementSolution, RefineError> {
        solve(problem, &self.config, should_stop)
    }
}

// ============================================================================
// Solver
// ============================================================================

/// Current estimate of all cameras and points.
#[derive(Clone)]
struct State {
    poses_cw: Vec<SE3>,
    points: Vec<Vector3<f64>>,
}

/// Normal equations of one linearization.
struct NormalEquations {
    /// Camera blocks JcᵀJc, by optimized camera index.
    u: Vec<Matrix6<f64>>,
    /// Point blocks JpᵀJp.
    v: Vec<Matrix3<f64>>,
    /// Off-diagonal blocks JcᵀJp: (optimized camera, point, block).
    w: Vec<(usize, usize, Matrix6x3<f64>)>,
    /// Gradients Jᵀe.
    g_c: Vec<Vector6<f64>>,
    g_p: Vec<Vector3<f64>>,
}

impl NormalEquations {
    fn gradient_max_norm(&self) -> f64 {
        self.g_c
            .iter()
            .map(|g| g.amax())
            .chain(self.g_p.iter().map(|g| g.amax()))
            .fold(0.0, f64::max)
    }
}

fn huber_weight(error_norm: f64, k: f64) -> f64 {
    if error_norm <= k {
        1.0
    } else {
        k / error_norm
    }
}

fn huber_cost(error_norm: f64, k: f64) -> f64 {
    if error_norm <= k {
        error_norm * error_norm
    } else {
        2.0 * k * error_norm - k * k
    }
}

/// Jacobian of the error w.r.t. a left perturbation of T_cw.
/// Matches g2o's EdgeSE3ProjectXYZ::linearizeOplus().
fn jacobian_pose(p_cam: &Vector3<f64>, fx: f64, fy: f64) -> Matrix2x6<f64> {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    let invz = 1.0 / z;
    let invz2 = invz * invz;

    // Columns: [rot_x, rot_y, rot_z, trans_x, trans_y, trans_z]
    Matrix2x6::new(
        x * y * invz2 * fx,
        -(1.0 + x * x * invz2) * fx,
        y * invz * fx,
        -invz * fx,
        0.0,
        x * invz2 * fx,
        (1.0 + y * y * invz2) * fy,
        -x * y * invz2 * fy,
        -x * invz * fy,
        0.0,
        -invz * fy,
        y * invz2 * fy,
    )
}

/// Jacobian of the error w.r.t. the world point: -1/z * tmp * R_cw.
fn jacobian_point(p_cam: &Vector3<f64>, r_cw: &Matrix3<f64>, fx: f64, fy: f64) -> Matrix2x3<f64> {
    let invz = 1.0 / p_cam.z;
    let tmp = Matrix2x3::new(fx, 0.0, -fx * p_cam.x * invz, 0.0, fy, -fy * p_cam.y * invz);
    (-invz) * tmp * r_cw
}

fn add_block<const R: usize, const C: usize>(m: &mut DMatrix<f64>, row: usize, col: usize, block: &SMatrix<f64, R, C>) {
    for r in 0..R {
        for c in 0..C {
            m[(row + r, col + c)] += block[(r, c)];
        }
    }
}

fn damp<const D: usize>(block: &SMatrix<f64, D, D>, lambda: f64) -> SMatrix<f64, D, D> {
    let mut damped = *block;
    for i in 0..D {
        damped[(i, i)] += lambda * block[(i, i)].max(1e-6);
    }
    damped
}

struct Solver<'a> {
    problem: &'a RefinementProblem,
    config: &'a LmConfig,
    /// Problem camera index → optimized camera index.
    opt_index: Vec<Option<usize>>,
    num_opt: usize,
    /// Observation indices per point.
    point_obs: Vec<Vec<usize>>,
}

impl<'a> Solver<'a> {
    fn new(problem: &'a RefinementProblem, config: &'a LmConfig) -> Self {
        let mut num_opt = 0;
        let opt_index = problem
            .cameras
            .iter()
            .map(|c| {
                if c.fixed {
                    None
                } else {
                    num_opt += 1;
                    Some(num_opt - 1)
                }
            })
            .collect();
        let mut point_obs = vec![Vec::new(); problem.points.len()];
        for (k, obs) in problem.observations.iter().enumerate() {
            point_obs[obs.point].push(k);
        }
        Self {
            problem,
            config,
            opt_index,
            num_opt,
            point_obs,
        }
    }

    fn residual(&self, state: &State, k: usize) -> Option<Vector2<f64>> {
        let obs = &self.problem.observations[k];
        self.problem
            .residual(obs, &state.poses_cw[obs.camera], &state.points[obs.point])
    }

    fn error_norm(&self, state: &State, k: usize) -> f64 {
        self.residual(state, k)
            .map(|e| e.norm())
            .unwrap_or(BEHIND_CAMERA_PENALTY_PX * std::f64::consts::SQRT_2)
    }

    fn cost(&self, state: &State) -> f64 {
        (0..self.problem.observations.len())
            .map(|k| huber_cost(self.error_norm(state, k), self.config.huber_px))
            .sum()
    }

    fn rms(&self, state: &State) -> f64 {
        let n = self.problem.observations.len();
        if n == 0 {
            return 0.0;
        }
        let sq: f64 = (0..n).map(|k| self.error_norm(state, k).powi(2)).sum();
        (sq / n as f64).sqrt()
    }

    fn linearize(&self, state: &State) -> NormalEquations {
        let mut eq = NormalEquations {
            u: vec![Matrix6::zeros(); self.num_opt],
            v: vec![Matrix3::zeros(); self.problem.points.len()],
            w: Vec::new(),
            g_c: vec![Vector6::zeros(); self.num_opt],
            g_p: vec![Vector3::zeros(); self.problem.points.len()],
        };

        for (k, obs) in self.problem.observations.iter().enumerate() {
            let pose_cw = &state.poses_cw[obs.camera];
            let p_cam = pose_cw.transform_point(&state.points[obs.point]);
            // Behind the camera: contributes a constant penalty only.
            let Some(e) = self.residual(state, k) else {
                continue;
            };
            let w = huber_weight(e.norm(), self.config.huber_px);
            let cam = &self.problem.cameras[obs.camera].intrinsics;

            let jp = jacobian_point(&p_cam, &pose_cw.rotation_matrix(), cam.fx, cam.fy);
            eq.v[obs.point] += w * jp.transpose() * jp;
            eq.g_p[obs.point] += w * jp.transpose() * e;

            if let Some(ci) = self.opt_index[obs.camera] {
                let jc = jacobian_pose(&p_cam, cam.fx, cam.fy);
                eq.u[ci] += w * jc.transpose() * jc;
                eq.g_c[ci] += w * jc.transpose() * e;
                eq.w.push((ci, obs.point, w * jc.transpose() * jp));
            }
        }
        eq
    }

    /// Damped Gauss-Newton step via the Schur complement. `None` if singular.
    fn step(&self, eq: &NormalEquations, lambda: f64) -> Option<(Vec<Vector6<f64>>, Vec<Vector3<f64>>)> {
        let n_points = self.problem.points.len();

        let mut v_inv = Vec::with_capacity(n_points);
        for v in &eq.v {
            v_inv.push(damp(v, lambda).try_inverse()?);
        }

        // W blocks per point, in the order of `eq.w`.
        let mut w_by_point: Vec<Vec<(usize, Matrix6x3<f64>)>> = vec![Vec::new(); n_points];
        for &(ci, pj, block) in &eq.w {
            w_by_point[pj].push((ci, block));
        }

        let dim = 6 * self.num_opt;
        let mut s = DMatrix::<f64>::zeros(dim, dim);
        let mut rhs = DVector::<f64>::zeros(dim);
        for (ci, u) in eq.u.iter().enumerate() {
            add_block(&mut s, 6 * ci, 6 * ci, &damp(u, lambda));
            for r in 0..6 {
                rhs[6 * ci + r] -= eq.g_c[ci][r];
            }
        }

        for (pj, blocks) in w_by_point.iter().enumerate() {
            let b_p = -eq.g_p[pj];
            for (a, w_a) in blocks {
                let w_vinv = w_a * v_inv[pj];
                let r = w_vinv * b_p;
                for i in 0..6 {
                    rhs[6 * a + i] -= r[i];
                }
                for (b, w_b) in blocks {
                    add_block(&mut s, 6 * a, 6 * b, &(-(w_vinv * w_b.transpose())));
                }
            }
        }

        let delta_c = if dim == 0 {
            DVector::zeros(0)
        } else {
            match s.clone().cholesky() {
                Some(chol) => chol.solve(&rhs),
                None => s.lu().solve(&rhs)?,
            }
        };
        if delta_c.iter().any(|x| !x.is_finite()) {
            return None;
        }

        let cams: Vec<Vector6<f64>> = (0..self.num_opt)
            .map(|ci| Vector6::from_fn(|r, _| delta_c[6 * ci + r]))
            .collect();

        let points = (0..n_points)
            .map(|pj| {
                let mut b = -eq.g_p[pj];
                for (a, w_a) in &w_by_point[pj] {
                    b -= w_a.transpose() * cams[*a];
                }
                v_inv[pj] * b
            })
            .collect();

        Some((cams, points))
    }

    fn apply(&self, state: &State, cams: &[Vector6<f64>], points: &[Vector3<f64>]) -> State {
        let poses_cw = state
            .poses_cw
            .iter()
            .enumerate()
            .map(|(i, pose)| match self.opt_index[i] {
                Some(ci) => pose.retract_left(&cams[ci]),
                None => *pose,
            })
            .collect();
        let points = state.points.iter().zip(points).map(|(p, d)| p + d).collect();
        State { poses_cw, points }
    }
}

/// Run Levenberg-Marquardt on a refinement problem.
pub fn solve(
    problem: &RefinementProblem,
    config: &LmConfig,
    should_stop: &dyn Fn() -> bool,
) -> Result<RefinementSolution, RefineError> {
    if problem.observations.is_empty() || problem.points.is_empty() {
        return Err(RefineError::IllConditioned("no observations to refine".into()));
    }

    let solver = Solver::new(problem, config);
    let mut state = State {
        poses_cw: problem.cameras.iter().map(|c| c.pose_cw).collect(),
        points: problem.points.iter().map(|p| p.position).collect(),
    };

    let initial_rms = solver.rms(&state);
    let mut cost = solver.cost(&state);
    if !cost.is_finite() {
        return Err(RefineError::IllConditioned("non-finite initial cost".into()));
    }

    let mut lambda = 1e-3; // Initial damping
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let min_lambda = 1e-10;
    let max_lambda = 1e10;

    let mut iterations = 0;
    let mut converged = false;
    let mut accepted_any = false;
    let mut solved_any = false;

    while iterations < config.max_iterations {
        if should_stop() {
            return Err(RefineError::Cancelled);
        }
        iterations += 1;

        let eq = solver.linearize(&state);
        if eq.gradient_max_norm() < config.gradient_tolerance {
            converged = true;
            break;
        }

        let Some((d_cams, d_points)) = solver.step(&eq, lambda) else {
            if lambda >= max_lambda {
                break;
            }
            lambda = (lambda * lambda_up).min(max_lambda);
            continue;
        };
        solved_any = true;

        let step_norm = d_cams
            .iter()
            .map(|d| d.norm_squared())
            .chain(d_points.iter().map(|d| d.norm_squared()))
            .sum::<f64>()
            .sqrt();
        if step_norm < config.param_tolerance {
            converged = true;
            break;
        }

        let trial = solver.apply(&state, &d_cams, &d_points);
        let trial_cost = solver.cost(&trial);

        if trial_cost.is_finite() && trial_cost < cost {
            let decrease = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
            state = trial;
            cost = trial_cost;
            accepted_any = true;
            lambda = (lambda * lambda_down).max(min_lambda);
            if decrease < config.cost_tolerance {
                converged = true;
                break;
            }
        } else {
            if lambda >= max_lambda {
                // No descent direction left: at a minimum as far as LM can tell.
                converged = true;
                break;
            }
            lambda = (lambda * lambda_up).min(max_lambda);
        }
    }

    if !solved_any && !converged {
        return Err(RefineError::IllConditioned("reduced camera system is singular".into()));
    }
    if !accepted_any && !converged {
        return Err(RefineError::DidNotConverge { iterations });
    }

    let final_rms = solver.rms(&state);
    debug!(
        "[BA-LM] {} iters={} error: {:.3} -> {:.3} px",
        problem.scope, iterations, initial_rms, final_rms
    );

    let residuals = (0..problem.observations.len())
        .map(|k| solver.error_norm(&state, k))
        .collect();

    let poses_wc = problem
        .cameras
        .iter()
        .zip(&state.poses_cw)
        .filter(|(cam, _)| !cam.fixed)
        .map(|(cam, pose_cw)| (cam.kf_id, pose_cw.inverse()))
        .collect();
    let points = problem
        .points
        .iter()
        .zip(&state.points)
        .map(|(p, pos)| (p.lm_id, *pos))
        .collect();

    Ok(RefinementSolution {
        poses_wc,
        points,
        residuals,
        iterations,
        initial_rms,
        final_rms,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn camera() -> Intrinsics {
        Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0)
    }

    /// Cameras along x looking down +z at a cloud of points.
    fn scene(num_cams: usize, num_points: usize) -> (Vec<SE3>, Vec<Vector3<f64>>) {
        let mut rng = StdRng::seed_from_u64(7);
        let poses_wc = (0..num_cams)
            .map(|i| SE3::from_translation(Vector3::new(i as f64 * 0.5, 0.0, 0.0)))
            .collect();
        let points = (0..num_points)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-2.0..3.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(4.0..8.0),
                )
            })
            .collect();
        (poses_wc, points)
    }

    fn problem_from(poses_wc: &[SE3], truth: &[Vector3<f64>], points: &[Vector3<f64>]) -> RefinementProblem {
        let cam = camera();
        let cameras: Vec<ProblemCamera> = poses_wc
            .iter()
            .enumerate()
            .map(|(i, pose)| ProblemCamera {
                kf_id: KeyframeId::new(i as u64),
                pose_cw: pose.inverse(),
                intrinsics: cam,
                fixed: i < 2,
            })
            .collect();
        let mut observations = Vec::new();
        for (ci, pose) in poses_wc.iter().enumerate() {
            for (pj, p) in truth.iter().enumerate() {
                let pc = pose.inverse().transform_point(p);
                observations.push(ProblemObservation {
                    camera: ci,
                    point: pj,
                    feature_idx: pj,
                    normalized: Vector2::new(pc.x / pc.z, pc.y / pc.z),
                });
            }
        }
        RefinementProblem {
            scope: RefinementScope::Global,
            base_revision: 0,
            cameras,
            points: points
                .iter()
                .enumerate()
                .map(|(j, p)| ProblemPoint {
                    lm_id: LandmarkId::new(j as u64),
                    position: *p,
                })
                .collect(),
            observations,
        }
    }

    #[test]
    fn test_jacobian_pose_numerical() {
        let pose_cw = SE3::from_axis_angle(&Vector3::new(0.1, 1.0, 0.2), 0.3)
            * SE3::from_translation(Vector3::new(0.2, -0.1, 0.4));
        let point = Vector3::new(0.5, -0.3, 5.0);
        let fx = 450.0;
        let fy = 470.0;
        let error = |pose: &SE3| {
            let p = pose.transform_point(&point);
            // observation at the origin: error = -projection
            Vector2::new(-fx * p.x / p.z, -fy * p.y / p.z)
        };

        let analytic = jacobian_pose(&pose_cw.transform_point(&point), fx, fy);
        let eps = 1e-6;
        for j in 0..6 {
            let mut delta = Vector6::zeros();
            delta[j] = eps;
            let plus = error(&pose_cw.retract_left(&delta));
            delta[j] = -eps;
            let minus = error(&pose_cw.retract_left(&delta));
            let numeric = (plus - minus) / (2.0 * eps);
            assert_relative_eq!(analytic[(0, j)], numeric.x, epsilon = 1e-3, max_relative = 1e-4);
            assert_relative_eq!(analytic[(1, j)], numeric.y, epsilon = 1e-3, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_jacobian_point_numerical() {
        let pose_cw = SE3::from_axis_angle(&Vector3::new(0.3, 0.2, 1.0), -0.2);
        let point = Vector3::new(-0.4, 0.6, 4.0);
        let (fx, fy) = (500.0, 510.0);
        let error = |p: &Vector3<f64>| {
            let pc = pose_cw.transform_point(p);
            Vector2::new(-fx * pc.x / pc.z, -fy * pc.y / pc.z)
        };
        let analytic = jacobian_point(
            &pose_cw.transform_point(&point),
            &pose_cw.rotation_matrix(),
            fx,
            fy,
        );
        let eps = 1e-6;
        for j in 0..3 {
            let mut d = Vector3::zeros();
            d[j] = eps;
            let numeric = (error(&(point + d)) - error(&(point - d))) / (2.0 * eps);
            assert_relative_eq!(analytic[(0, j)], numeric.x, epsilon = 1e-3, max_relative = 1e-4);
            assert_relative_eq!(analytic[(1, j)], numeric.y, epsilon = 1e-3, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_refine_recovers_perturbed_points() {
        let (poses, truth) = scene(4, 40);
        let mut rng = StdRng::seed_from_u64(11);
        let noisy: Vec<Vector3<f64>> = truth
            .iter()
            .map(|p| p + Vector3::new(rng.gen_range(-0.05..0.05), rng.gen_range(-0.05..0.05), rng.gen_range(-0.1..0.1)))
            .collect();
        let mut problem = problem_from(&poses, &truth, &noisy);
        // Perturb one free camera.
        problem.cameras[3].pose_cw = problem.cameras[3]
            .pose_cw
            .retract_left(&Vector6::new(0.01, -0.005, 0.002, 0.02, -0.01, 0.01));

        let solution = LmBundleAdjuster::default().refine(&problem, &|| false).unwrap();

        assert!(solution.initial_rms > 1.0);
        assert!(solution.final_rms < 1e-4, "final rms {}", solution.final_rms);
        assert_eq!(solution.residuals.len(), problem.observations.len());
        assert_eq!(solution.poses_wc.len(), 2);
        // Two fixed cameras pin the gauge, including scale.
        let refined = solution.poses_wc[&KeyframeId::new(3)];
        assert_relative_eq!(refined.translation, poses[3].translation, epsilon = 1e-4);
        for (j, p) in truth.iter().enumerate() {
            assert_relative_eq!(solution.points[&LandmarkId::new(j as u64)], *p, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_refine_at_optimum_is_idempotent() {
        let (poses, truth) = scene(3, 25);
        let problem = problem_from(&poses, &truth, &truth);
        let solution = LmBundleAdjuster::default().refine(&problem, &|| false).unwrap();
        assert!(solution.converged);
        assert!(solution.final_rms < 1e-9);
        for (j, p) in truth.iter().enumerate() {
            assert_relative_eq!(solution.points[&LandmarkId::new(j as u64)], *p, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_refine_can_be_cancelled() {
        let (poses, truth) = scene(3, 10);
        let problem = problem_from(&poses, &truth, &truth);
        let err = LmBundleAdjuster::default().refine(&problem, &|| true).unwrap_err();
        assert_eq!(err, RefineError::Cancelled);
    }

    #[test]
    fn test_empty_problem_is_ill_conditioned() {
        let problem = problem_from(&[], &[], &[]);
        assert!(matches!(
            LmBundleAdjuster::default().refine(&problem, &|| false),
            Err(RefineError::IllConditioned(_))
        ));
    }

    #[test]
    fn test_huber_cost_is_continuous() {
        let k = 2.0;
        assert_relative_eq!(huber_cost(k, k), k * k);
        assert_relative_eq!(huber_cost(k + 1e-9, k), k * k, epsilon = 1e-6);
        assert_relative_eq!(huber_weight(4.0, k), 0.5);
    }
}
