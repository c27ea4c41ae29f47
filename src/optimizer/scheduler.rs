//! Refinement scheduler: when to run bundle adjustment and how its result
//! is written back.
//!
//! A local pass runs after every registration; a global pass every
//! `global_every` registrations (and on demand). Results computed against a
//! store revision that has since moved are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::{run_with_deadline, BundleAdjuster};
use crate::error::{CapabilityError, RefineError};
use crate::map::{KeyframeId, LandmarkId, ObservationRemoval, PoseGraph, MIN_OBSERVATIONS};

use super::bundle_adjustment::{
    LmConfig, ProblemCamera, ProblemObservation, ProblemPoint, RefinementProblem, RefinementScope,
    RefinementSolution,
};

/// Refinement cadence and post-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Global pass every K registrations (0 disables periodic global passes).
    pub global_every: usize,
    /// Keyframes in a local window, the new keyframe included.
    pub local_window: usize,
    /// Observations with a larger residual (pixels) are removed after refinement.
    pub outlier_threshold_px: f64,
    /// Solver iterations per pass.
    pub max_iterations: usize,
    /// Huber kernel threshold (pixels).
    pub huber_px: f64,
    /// Run one global pass after the last frame.
    pub final_global: bool,
    /// Run periodic global passes on the background worker.
    pub background_global: bool,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            global_every: 5,
            local_window: 6,
            outlier_threshold_px: 4.0,
            max_iterations: 30,
            huber_px: 5.991_f64.sqrt(),
            final_global: true,
            background_global: false,
        }
    }
}

impl RefinementConfig {
    pub fn lm_config(&self) -> LmConfig {
        LmConfig {
            max_iterations: self.max_iterations,
            huber_px: self.huber_px,
            ..LmConfig::default()
        }
    }
}

/// What [`RefinementScheduler::apply`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied {
        poses: usize,
        points: usize,
        outliers_removed: usize,
        landmarks_pruned: usize,
    },
    /// The store changed since the snapshot; nothing was written.
    Stale { base_revision: u64, current_revision: u64 },
}

/// Counters over the scheduler's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefinementStats {
    pub local_applied: usize,
    pub global_applied: usize,
    pub stale_discarded: usize,
    pub failed: usize,
    pub outliers_removed: usize,
    pub landmarks_pruned: usize,
}

impl RefinementStats {
    pub fn merge(&mut self, other: &RefinementStats) {
        self.local_applied += other.local_applied;
        self.global_applied += other.global_applied;
        self.stale_discarded += other.stale_discarded;
        self.failed += other.failed;
        self.outliers_removed += other.outliers_removed;
        self.landmarks_pruned += other.landmarks_pruned;
    }

    pub fn applied(&self) -> usize {
        self.local_applied + self.global_applied
    }
}

pub struct RefinementScheduler {
    config: RefinementConfig,
    /// Landmarks below this baseline angle are pruned after refinement.
    min_parallax_rad: f64,
    registered_since_global: usize,
    stats: RefinementStats,
}

impl RefinementScheduler {
    pub fn new(config: RefinementConfig, min_parallax_deg: f64) -> Self {
        Self {
            config,
            min_parallax_rad: min_parallax_deg.to_radians(),
            registered_since_global: 0,
            stats: RefinementStats::default(),
        }
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    pub fn stats(&self) -> &RefinementStats {
        &self.stats
    }

    /// Passes due after `kf` was registered: always a local pass, plus a
    /// global pass every `global_every` registrations.
    pub fn on_registered(&mut self, kf: KeyframeId) -> Vec<RefinementScope> {
        self.registered_since_global += 1;
        let mut scopes = vec![RefinementScope::Local(kf)];
        if self.config.global_every > 0 && self.registered_since_global >= self.config.global_every {
            self.registered_since_global = 0;
            scopes.push(RefinementScope::Global);
        }
        scopes
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Phase 1: collect (read access)
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot the part of the store covered by `scope`.
    ///
    /// Gauge: a global pass holds the earliest registered keyframe fixed; a
    /// local pass holds the oldest window keyframe and every observer outside
    /// the window fixed. Returns `None` when there is nothing to refine.
    pub fn collect(&self, graph: &PoseGraph, scope: RefinementScope) -> Option<RefinementProblem> {
        let window: Vec<KeyframeId> = match scope {
            RefinementScope::Global => graph.registration_order(),
            RefinementScope::Local(kf) => {
                if !graph.is_registered(kf) {
                    return None;
                }
                let mut window = vec![kf];
                window.extend(
                    graph
                        .covisible_keyframes(kf, self.config.local_window.saturating_sub(1))
                        .into_iter()
                        .filter(|id| graph.is_registered(*id)),
                );
                window
            }
        };
        if window.is_empty() {
            return None;
        }

        let anchor = window
            .iter()
            .filter_map(|id| graph.keyframe(*id).and_then(|kf| kf.registration_seq().map(|s| (s, *id))))
            .min()
            .map(|(_, id)| id)?;

        // Landmarks seen from the window.
        let mut lm_ids: Vec<LandmarkId> = window
            .iter()
            .flat_map(|kf| graph.landmarks_observed_by(*kf).into_iter().map(|(_, lm)| lm))
            .collect();
        lm_ids.sort();
        lm_ids.dedup();
        if lm_ids.is_empty() {
            return None;
        }

        let mut cameras: Vec<ProblemCamera> = Vec::new();
        let mut camera_index = std::collections::HashMap::new();
        let mut points = Vec::with_capacity(lm_ids.len());
        let mut observations = Vec::new();

        for lm_id in lm_ids {
            let Some(lm) = graph.landmark(lm_id) else { continue };
            let point = points.len();
            points.push(ProblemPoint {
                lm_id,
                position: lm.position,
            });

            for kf_id in lm.observers() {
                let Some(kf) = graph.keyframe(kf_id) else { continue };
                let Some(pose_wc) = kf.pose_wc() else { continue };
                let Some(&feature_idx) = lm.observations().get(&kf_id) else { continue };
                let Some(pixel) = kf.features().pixel(feature_idx) else { continue };

                let camera = *camera_index.entry(kf_id).or_insert_with(|| {
                    cameras.push(ProblemCamera {
                        kf_id,
                        pose_cw: pose_wc.inverse(),
                        intrinsics: kf.intrinsics,
                        fixed: kf_id == anchor || !window.contains(&kf_id),
                    });
                    cameras.len() - 1
                });

                observations.push(ProblemObservation {
                    camera,
                    point,
                    feature_idx,
                    normalized: kf.intrinsics.pixel_to_normalized(&pixel),
                });
            }
        }

        if observations.is_empty() {
            return None;
        }

        Some(RefinementProblem {
            scope,
            base_revision: graph.revision(),
            cameras,
            points,
            observations,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Phase 2: solve (no lock)
    // ─────────────────────────────────────────────────────────────────────────

    /// Solve on a worker thread with a deadline.
    ///
    /// `abort` lets another thread cancel the solve; a timeout cancels it too.
    pub fn solve(
        adjuster: &Arc<dyn BundleAdjuster>,
        problem: &Arc<RefinementProblem>,
        timeout: Duration,
        abort: Option<Arc<AtomicBool>>,
    ) -> Result<RefinementSolution, RefineError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let job = {
            let adjuster = Arc::clone(adjuster);
            let problem = Arc::clone(problem);
            let cancel = Arc::clone(&cancel);
            move || {
                let should_stop = || {
                    cancel.load(Ordering::SeqCst) || abort.as_ref().is_some_and(|a| a.load(Ordering::SeqCst))
                };
                adjuster.refine(&problem, &should_stop)
            }
        };

        let result = match run_with_deadline(timeout, job) {
            Ok(result) => result,
            Err(e) => {
                cancel.store(true, Ordering::SeqCst);
                Err(RefineError::Capability(e))
            }
        };

        let solution = result?;
        if solution.residuals.len() != problem.observations.len() {
            return Err(RefineError::IllConditioned(format!(
                "adjuster returned {} residuals for {} observations",
                solution.residuals.len(),
                problem.observations.len()
            )));
        }
        Ok(solution)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Phase 3: apply (write access)
    // ─────────────────────────────────────────────────────────────────────────

    /// Write a solution back, remove outlier observations and prune landmarks.
    ///
    /// Discards the solution if the store moved since the snapshot.
    pub fn apply(
        &mut self,
        graph: &mut PoseGraph,
        problem: &RefinementProblem,
        solution: &RefinementSolution,
    ) -> ApplyOutcome {
        if graph.revision() != problem.base_revision {
            self.stats.stale_discarded += 1;
            warn!(
                "[Refine-{}] discarding stale result (revision {} -> {})",
                scope_label(problem.scope),
                problem.base_revision,
                graph.revision()
            );
            return ApplyOutcome::Stale {
                base_revision: problem.base_revision,
                current_revision: graph.revision(),
            };
        }

        let mut poses = 0;
        for (kf_id, pose_wc) in &solution.poses_wc {
            if graph.is_registered(*kf_id) && graph.set_pose(*kf_id, *pose_wc) {
                poses += 1;
            }
        }

        let mut points = 0;
        for (lm_id, position) in &solution.points {
            if graph.update_landmark_position(*lm_id, *position) {
                points += 1;
            }
        }

        let mut outliers_removed = 0;
        let mut landmarks_pruned = 0;
        for (obs, &residual) in problem.observations.iter().zip(&solution.residuals) {
            if residual <= self.config.outlier_threshold_px {
                continue;
            }
            let kf_id = problem.cameras[obs.camera].kf_id;
            let lm_id = problem.points[obs.point].lm_id;
            match graph.remove_observation(kf_id, lm_id) {
                ObservationRemoval::Missing => {}
                ObservationRemoval::Removed => outliers_removed += 1,
                ObservationRemoval::RemovedWithLandmark => {
                    outliers_removed += 1;
                    landmarks_pruned += 1;
                }
            }
        }
        landmarks_pruned += graph.prune_landmarks(MIN_OBSERVATIONS, self.min_parallax_rad);

        graph.assert_invariants();

        match problem.scope {
            RefinementScope::Local(_) => self.stats.local_applied += 1,
            RefinementScope::Global => self.stats.global_applied += 1,
        }
        self.stats.outliers_removed += outliers_removed;
        self.stats.landmarks_pruned += landmarks_pruned;

        debug!(
            "[Refine-{}] applied: {} poses, {} points, {} outliers, {} landmarks pruned",
            scope_label(problem.scope),
            poses,
            points,
            outliers_removed,
            landmarks_pruned
        );

        ApplyOutcome::Applied {
            poses,
            points,
            outliers_removed,
            landmarks_pruned,
        }
    }

    /// Record a failed pass. The store is left as it was.
    pub fn record_failure(&mut self, scope: RefinementScope, error: &RefineError) {
        self.stats.failed += 1;
        match error {
            RefineError::Capability(CapabilityError::Timeout(t)) => {
                warn!("[Refine-{}] timed out after {:?}", scope_label(scope), t)
            }
            other => warn!("[Refine-{}] failed: {}", scope_label(scope), other),
        }
    }

    /// Record a pass cancelled by a newer registration. Counted as stale.
    pub fn record_superseded(&mut self, scope: RefinementScope) {
        self.stats.stale_discarded += 1;
        debug!("[Refine-{}] cancelled by a newer registration", scope_label(scope));
    }

    /// Collect, solve and apply in one go, holding `graph` throughout.
    ///
    /// Returns `Ok(None)` when there was nothing to refine.
    pub fn refine_now(
        &mut self,
        graph: &mut PoseGraph,
        scope: RefinementScope,
        adjuster: &Arc<dyn BundleAdjuster>,
        timeout: Duration,
    ) -> Result<Option<ApplyOutcome>, RefineError> {
        let Some(problem) = self.collect(graph, scope) else {
            return Ok(None);
        };
        let problem = Arc::new(problem);
        match Self::solve(adjuster, &problem, timeout, None) {
            Ok(solution) => {
                info!(
                    "[Refine-{}] iters={} error: {:.3} -> {:.3} px",
                    scope_label(scope),
                    solution.iterations,
                    solution.initial_rms,
                    solution.final_rms
                );
                Ok(Some(self.apply(graph, &problem, &solution)))
            }
            Err(e) => {
                self.record_failure(scope, &e);
                Err(e)
            }
        }
    }
}

fn scope_label(scope: RefinementScope) -> &'static str {
    match scope {
        RefinementScope::Local(_) => "Local",
        RefinementScope::Global => "Global",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Intrinsics, SE3};
    use crate::optimizer::LmBundleAdjuster;
    use crate::tracking::{Displacement, FeatureSet, Frame, ImageRef, Keyframe, Keypoint};
    use approx::assert_relative_eq;
    use nalgebra::{Vector2, Vector3};
    use std::collections::HashMap;

    fn intrinsics() -> Intrinsics {
        Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0)
    }

    fn scene_points() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                pts.push(Vector3::new(-1.0 + 0.5 * i as f64, -1.0 + 0.5 * j as f64, 5.0 + 0.3 * ((i + j) % 3) as f64));
            }
        }
        pts
    }

    /// Registered keyframes along x, each seeing every point, with landmarks
    /// created at `landmark_offset` from the truth.
    fn build_graph(num_kfs: usize, landmark_offset: Vector3<f64>) -> (PoseGraph, Vec<KeyframeId>, Vec<LandmarkId>) {
        let cam = intrinsics();
        let pts = scene_points();
        let mut graph = PoseGraph::new();
        let mut kfs = Vec::new();
        for i in 0..num_kfs {
            let pose_wc = SE3::from_translation(Vector3::new(0.4 * i as f64, 0.0, 0.0));
            let keypoints = pts
                .iter()
                .map(|p| {
                    let uv = cam.project(&pose_wc.inverse().transform_point(p)).unwrap();
                    Keypoint::new(uv, vec![0.0])
                })
                .collect();
            let kf = Arc::new(Keyframe::new(
                Frame::new(i as u64, i as f64, ImageRef::new(format!("{i}"))),
                Arc::new(FeatureSet::new(keypoints)),
                Displacement::Unavailable,
            ));
            let id = graph.insert_keyframe(kf, cam);
            graph.set_pose(id, pose_wc);
            kfs.push(id);
        }
        let lms = pts
            .iter()
            .enumerate()
            .map(|(j, p)| {
                let obs: Vec<(KeyframeId, usize)> = kfs.iter().map(|kf| (*kf, j)).collect();
                graph.create_landmark(p + landmark_offset, None, &obs).unwrap()
            })
            .collect();
        (graph, kfs, lms)
    }

    fn adjuster() -> Arc<dyn BundleAdjuster> {
        Arc::new(LmBundleAdjuster::default())
    }

    #[test]
    fn test_cadence() {
        let config = RefinementConfig {
            global_every: 3,
            ..RefinementConfig::default()
        };
        let mut scheduler = RefinementScheduler::new(config, 1.0);
        let kf = KeyframeId::new(0);
        assert_eq!(scheduler.on_registered(kf), vec![RefinementScope::Local(kf)]);
        assert_eq!(scheduler.on_registered(kf), vec![RefinementScope::Local(kf)]);
        assert_eq!(
            scheduler.on_registered(kf),
            vec![RefinementScope::Local(kf), RefinementScope::Global]
        );
        assert_eq!(scheduler.on_registered(kf).len(), 1);
    }

    #[test]
    fn test_collect_global_fixes_first_registered() {
        let (graph, kfs, lms) = build_graph(3, Vector3::zeros());
        let scheduler = RefinementScheduler::new(RefinementConfig::default(), 1.0);
        let problem = scheduler.collect(&graph, RefinementScope::Global).unwrap();

        assert_eq!(problem.points.len(), lms.len());
        assert_eq!(problem.observations.len(), lms.len() * 3);
        assert_eq!(problem.base_revision, graph.revision());
        let fixed: Vec<KeyframeId> = problem.cameras.iter().filter(|c| c.fixed).map(|c| c.kf_id).collect();
        assert_eq!(fixed, vec![kfs[0]]);
    }

    #[test]
    fn test_collect_local_fixes_outside_window() {
        let (graph, kfs, _) = build_graph(4, Vector3::zeros());
        let config = RefinementConfig {
            local_window: 2,
            ..RefinementConfig::default()
        };
        let scheduler = RefinementScheduler::new(config, 1.0);
        let problem = scheduler.collect(&graph, RefinementScope::Local(kfs[3])).unwrap();

        let free: Vec<KeyframeId> = problem.cameras.iter().filter(|c| !c.fixed).map(|c| c.kf_id).collect();
        // Window is {KF3, best covisible}; its oldest member is the anchor.
        assert_eq!(free, vec![kfs[3]]);
        assert_eq!(problem.cameras.len(), 4);
    }

    #[test]
    fn test_refinement_reduces_error_and_is_idempotent() {
        let (mut graph, kfs, lms) = build_graph(4, Vector3::new(0.02, -0.01, 0.05));
        let mut scheduler = RefinementScheduler::new(RefinementConfig::default(), 1.0);
        let adjuster = adjuster();
        let timeout = Duration::from_secs(30);

        let outcome = scheduler
            .refine_now(&mut graph, RefinementScope::Global, &adjuster, timeout)
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        assert_eq!(graph.num_landmarks(), lms.len());

        let poses_before: HashMap<KeyframeId, SE3> =
            kfs.iter().map(|kf| (*kf, *graph.keyframe(*kf).unwrap().pose_wc().unwrap())).collect();
        let points_before: Vec<Vector3<f64>> = lms.iter().map(|lm| graph.landmark(*lm).unwrap().position).collect();

        scheduler
            .refine_now(&mut graph, RefinementScope::Global, &adjuster, timeout)
            .unwrap();

        for kf in &kfs {
            let after = graph.keyframe(*kf).unwrap().pose_wc().unwrap();
            assert_relative_eq!(after.translation, poses_before[kf].translation, epsilon = 1e-6);
            assert!(after.angular_distance(&poses_before[kf]) < 1e-6);
        }
        for (lm, before) in lms.iter().zip(&points_before) {
            assert_relative_eq!(graph.landmark(*lm).unwrap().position, *before, epsilon = 1e-6);
        }
        assert_eq!(scheduler.stats().global_applied, 2);
    }

    #[test]
    fn test_stale_solution_is_discarded() {
        let (mut graph, kfs, lms) = build_graph(3, Vector3::new(0.0, 0.0, 0.1));
        let mut scheduler = RefinementScheduler::new(RefinementConfig::default(), 1.0);
        let problem = Arc::new(scheduler.collect(&graph, RefinementScope::Global).unwrap());
        let solution =
            RefinementScheduler::solve(&adjuster(), &problem, Duration::from_secs(30), None).unwrap();

        // A registration-side mutation lands between collect and apply.
        let position_before = graph.landmark(lms[0]).unwrap().position;
        graph.remove_observation(kfs[2], lms[1]);

        let outcome = scheduler.apply(&mut graph, &problem, &solution);
        assert!(matches!(outcome, ApplyOutcome::Stale { .. }));
        assert_eq!(graph.landmark(lms[0]).unwrap().position, position_before);
        assert_eq!(scheduler.stats().stale_discarded, 1);
    }

    #[test]
    fn test_outlier_observations_are_removed() {
        let (mut graph, kfs, lms) = build_graph(3, Vector3::zeros());
        let mut scheduler = RefinementScheduler::new(RefinementConfig::default(), 1.0);
        let problem = scheduler.collect(&graph, RefinementScope::Global).unwrap();

        // Fake solution: values unchanged, one residual over threshold.
        let mut residuals = vec![0.1; problem.observations.len()];
        let target = problem
            .observations
            .iter()
            .position(|o| problem.cameras[o.camera].kf_id == kfs[1] && problem.points[o.point].lm_id == lms[4])
            .unwrap();
        residuals[target] = 25.0;
        let solution = RefinementSolution {
            poses_wc: HashMap::new(),
            points: HashMap::new(),
            residuals,
            iterations: 1,
            initial_rms: 0.1,
            final_rms: 0.1,
            converged: true,
        };

        let outcome = scheduler.apply(&mut graph, &problem, &solution);
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                poses: 0,
                points: 0,
                outliers_removed: 1,
                landmarks_pruned: 0
            }
        );
        assert!(!graph.landmark(lms[4]).unwrap().is_observed_by(kfs[1]));
        assert_eq!(graph.landmark(lms[4]).unwrap().num_observations(), 2);
    }

    #[test]
    fn test_failed_refinement_leaves_store_untouched() {
        struct Diverging;
        impl BundleAdjuster for Diverging {
            fn refine(
                &self,
                _problem: &RefinementProblem,
                _should_stop: &dyn Fn() -> bool,
            ) -> Result<RefinementSolution, RefineError> {
                Err(RefineError::DidNotConverge { iterations: 10 })
            }
        }

        let (mut graph, _, lms) = build_graph(3, Vector3::new(0.0, 0.0, 0.2));
        let revision = graph.revision();
        let position = graph.landmark(lms[0]).unwrap().position;
        let mut scheduler = RefinementScheduler::new(RefinementConfig::default(), 1.0);
        let adjuster: Arc<dyn BundleAdjuster> = Arc::new(Diverging);

        let err = scheduler
            .refine_now(&mut graph, RefinementScope::Global, &adjuster, Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err, RefineError::DidNotConverge { iterations: 10 });
        assert_eq!(graph.revision(), revision);
        assert_eq!(graph.landmark(lms[0]).unwrap().position, position);
        assert_eq!(scheduler.stats().failed, 1);
    }

    #[test]
    fn test_pixel_projection_helper_matches_normalized() {
        let cam = intrinsics();
        let uv = Vector2::new(400.0, 300.0);
        let xn = cam.pixel_to_normalized(&uv);
        assert_relative_eq!(cam.normalized_to_pixel(&xn), uv, epsilon = 1e-9);
    }
}
