//! Incremental Registrator - grows the reconstruction one keyframe at a time.
//!
//! Two entry points:
//! 1. [`Registrator::bootstrap`]: two-view initialization from an essential
//!    matrix, first camera at the origin, unit baseline
//! 2. [`Registrator::register`]: chain 2D-2D matches against a bounded
//!    window into 2D-3D matches, solve PnP, associate the inliers and
//!    triangulate new landmarks with the window
//!
//! Every check runs before the first mutation, so a failed call leaves the
//! store as it was.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::{Correspondence, WindowMatch};
use crate::error::{GeometryError, MatchError, RegistrationError, RegistrationStage};
use crate::geometry::triangulation::{triangulate_pair, View};
use crate::geometry::two_view::estimate_relative_pose;
use crate::geometry::{solve_pnp_ransac, Intrinsics, RansacConfig, TriangulationConfig, SE3};
use crate::map::{KeyframeId, LandmarkId, PoseGraph};
use crate::tracking::Keyframe;

/// Registration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Most recently registered keyframes in the window (N).
    pub window_recent: usize,
    /// Keyframes most covisible with the recent ones added to the window (M).
    pub window_covisible: usize,
    /// Correspondences needed to attempt a registration.
    pub min_correspondences: usize,
    /// PnP / two-view inliers needed to accept a pose.
    pub min_inliers: usize,
    /// Landmarks the two-view bootstrap must triangulate.
    pub min_bootstrap_landmarks: usize,
    /// Consecutive failures before tracking is declared lost.
    pub max_consecutive_failures: usize,
    /// Retries of a failed keyframe after later successes.
    pub max_retries_per_keyframe: usize,
    pub ransac: RansacConfig,
    pub triangulation: TriangulationConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            window_recent: 5,
            window_covisible: 5,
            min_correspondences: 30,
            min_inliers: 15,
            min_bootstrap_landmarks: 20,
            max_consecutive_failures: 5,
            max_retries_per_keyframe: 2,
            ransac: RansacConfig::default(),
            triangulation: TriangulationConfig::default(),
        }
    }
}

/// A keyframe that is not in the store yet, with the intrinsics it will use.
#[derive(Debug, Clone)]
pub struct PendingKeyframe {
    pub keyframe: Arc<Keyframe>,
    pub intrinsics: Intrinsics,
}

impl PendingKeyframe {
    pub fn new(keyframe: Arc<Keyframe>, intrinsics: Intrinsics) -> Self {
        Self { keyframe, intrinsics }
    }
}

/// Counts describing a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutcome {
    /// Keyframes that received a pose (two for a bootstrap).
    pub registered: Vec<KeyframeId>,
    pub inliers: usize,
    pub new_landmarks: usize,
    /// Existing landmarks that gained an observation.
    pub extended_observations: usize,
}

/// A 2D-3D match found by chaining through a window keyframe.
#[derive(Debug, Clone, Copy)]
struct Chained {
    feature_idx: usize,
    landmark: LandmarkId,
    confidence: f64,
}

pub struct Registrator {
    config: RegistrationConfig,
}

impl Registrator {
    pub fn new(config: RegistrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Keyframes a new keyframe is matched against: the N most recently
    /// registered plus the M keyframes most covisible with them.
    pub fn window(&self, graph: &PoseGraph) -> Vec<KeyframeId> {
        let mut window = graph.recent_registered(self.config.window_recent);
        let in_window: HashSet<KeyframeId> = window.iter().copied().collect();

        let mut weights: HashMap<KeyframeId, usize> = HashMap::new();
        for kf_id in &window {
            let Some(kf) = graph.keyframe(*kf_id) else { continue };
            for (other, w) in kf.covisibility_weights() {
                if !in_window.contains(other) && graph.is_registered(*other) {
                    *weights.entry(*other).or_insert(0) += w;
                }
            }
        }

        let mut covisible: Vec<(KeyframeId, usize)> = weights.into_iter().collect();
        covisible.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        window.extend(
            covisible
                .into_iter()
                .take(self.config.window_covisible)
                .map(|(id, _)| id),
        );
        window
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bootstrap
    // ─────────────────────────────────────────────────────────────────────────

    /// Initialize the reconstruction from two keyframes.
    ///
    /// `correspondences` index `seed` on side a and `candidate` on side b.
    /// The seed is placed at the origin and the candidate at unit distance.
    /// Both keyframes and all landmarks are inserted only on success.
    pub fn bootstrap(
        &self,
        graph: &mut PoseGraph,
        seed: &PendingKeyframe,
        candidate: &PendingKeyframe,
        correspondences: &[Correspondence],
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let required = self.config.min_correspondences;
        if correspondences.len() < required {
            return Err(RegistrationError::InsufficientCorrespondences {
                stage: RegistrationStage::TwoView,
                found: correspondences.len(),
                required,
            });
        }

        let x1: Vec<_> = correspondences
            .iter()
            .map(|c| seed.intrinsics.pixel_to_normalized(&c.pixel_a))
            .collect();
        let x2: Vec<_> = correspondences
            .iter()
            .map(|c| candidate.intrinsics.pixel_to_normalized(&c.pixel_b))
            .collect();
        let focal = 0.5 * (seed.intrinsics.mean_focal() + candidate.intrinsics.mean_focal());

        let relative = estimate_relative_pose(&x1, &x2, &self.config.ransac, focal, self.config.min_inliers)
            .map_err(RegistrationError::DegenerateTwoView)?;

        let pose_seed = SE3::identity();
        let mut pose_candidate = relative.pose2_wc;
        let baseline = pose_candidate.translation.norm();
        if baseline < 1e-9 {
            return Err(RegistrationError::DegenerateTwoView(GeometryError::Degenerate("zero baseline")));
        }
        pose_candidate.translation /= baseline;

        let mut accepted: Vec<(usize, usize, Vector3<f64>)> = Vec::new();
        for &i in &relative.inliers {
            let c = &correspondences[i];
            let v1 = View {
                pose_wc: &pose_seed,
                intrinsics: &seed.intrinsics,
                pixel: c.pixel_a,
            };
            let v2 = View {
                pose_wc: &pose_candidate,
                intrinsics: &candidate.intrinsics,
                pixel: c.pixel_b,
            };
            if let Ok(point) = triangulate_pair(&v1, &v2, &self.config.triangulation) {
                accepted.push((c.index_a, c.index_b, point));
            }
        }

        if accepted.len() < self.config.min_bootstrap_landmarks {
            return Err(RegistrationError::InsufficientTriangulation {
                triangulated: accepted.len(),
                required: self.config.min_bootstrap_landmarks,
            });
        }

        // All checks passed: mutate.
        let seed_id = graph.insert_keyframe(Arc::clone(&seed.keyframe), seed.intrinsics);
        let candidate_id = graph.insert_keyframe(Arc::clone(&candidate.keyframe), candidate.intrinsics);
        graph.set_pose(seed_id, pose_seed);
        graph.set_pose(candidate_id, pose_candidate);

        let mut new_landmarks = 0;
        for (idx_a, idx_b, point) in accepted {
            let color = seed.keyframe.features.color(idx_a);
            if graph
                .create_landmark(point, color, &[(seed_id, idx_a), (candidate_id, idx_b)])
                .is_some()
            {
                new_landmarks += 1;
            }
        }

        graph.assert_invariants();

        info!(
            "[Registrator] bootstrap {} + {}: {} inliers, {} landmarks",
            seed_id,
            candidate_id,
            relative.inliers.len(),
            new_landmarks
        );

        Ok(RegistrationOutcome {
            registered: vec![seed_id, candidate_id],
            inliers: relative.inliers.len(),
            new_landmarks,
            extended_observations: 0,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incremental registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register an unregistered keyframe against its window.
    ///
    /// `matches` hold correspondences with `kf_id` on side a and the window
    /// keyframe on side b.
    pub fn register(
        &self,
        graph: &mut PoseGraph,
        kf_id: KeyframeId,
        matches: &[WindowMatch],
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let (intrinsics, features) = match graph.keyframe(kf_id) {
            Some(kf) => (kf.intrinsics, Arc::clone(kf.features())),
            None => {
                return Err(RegistrationError::InsufficientCorrespondences {
                    stage: RegistrationStage::Matching,
                    found: 0,
                    required: self.config.min_correspondences,
                })
            }
        };

        // Step 1: usable correspondences per registered window member.
        let mut usable: Vec<(KeyframeId, &[Correspondence])> = Vec::new();
        let mut capability_error = None;
        for m in matches {
            if !graph.is_registered(m.target) {
                continue;
            }
            match &m.result {
                Ok(corrs) => usable.push((m.target, corrs.as_slice())),
                Err(MatchError::NoCorrespondence) => {}
                Err(MatchError::Capability(e)) => {
                    warn!("[Registrator] {} vs {}: {}", kf_id, m.target, e);
                    capability_error = Some(e.clone());
                }
            }
        }
        let total: usize = usable.iter().map(|(_, c)| c.len()).sum();
        if total == 0 {
            if let Some(e) = capability_error {
                return Err(RegistrationError::Capability(e));
            }
        }
        if total < self.config.min_correspondences {
            return Err(RegistrationError::InsufficientCorrespondences {
                stage: RegistrationStage::Matching,
                found: total,
                required: self.config.min_correspondences,
            });
        }

        // Step 2: chain 2D-2D matches through the window's landmarks.
        let chained = self.chain(graph, &usable);
        if chained.len() < self.config.min_inliers {
            return Err(RegistrationError::InsufficientCorrespondences {
                stage: RegistrationStage::PoseEstimation,
                found: chained.len(),
                required: self.config.min_inliers,
            });
        }

        // Step 3: PnP.
        let mut points3d = Vec::with_capacity(chained.len());
        let mut pixels = Vec::with_capacity(chained.len());
        for c in &chained {
            let (Some(lm), Some(pixel)) = (graph.landmark(c.landmark), features.pixel(c.feature_idx)) else {
                continue;
            };
            points3d.push(lm.position);
            pixels.push(pixel);
        }
        let pnp = solve_pnp_ransac(&points3d, &pixels, &intrinsics, &self.config.ransac, self.config.min_inliers)
            .map_err(|e| match e {
                GeometryError::RansacFailed { inliers } => RegistrationError::InsufficientInliers {
                    inliers,
                    required: self.config.min_inliers,
                },
                other => RegistrationError::PoseSolver(other),
            })?;
        let inliers = pnp.num_inliers();
        if inliers < self.config.min_inliers {
            return Err(RegistrationError::InsufficientInliers {
                inliers,
                required: self.config.min_inliers,
            });
        }

        // All checks passed: mutate.
        graph.set_pose(kf_id, pnp.pose);

        let mut extended = 0;
        for (c, &inlier) in chained.iter().zip(&pnp.inlier_mask) {
            if inlier && graph.add_observation(kf_id, c.feature_idx, c.landmark) {
                extended += 1;
            }
        }

        // Step 4: new landmarks from unexplained matches.
        let new_landmarks = self.triangulate_new(graph, kf_id, &usable);

        graph.assert_invariants();

        info!(
            "[Registrator] {} registered: {} inliers, {} extended, {} new landmarks",
            kf_id, inliers, extended, new_landmarks
        );

        Ok(RegistrationOutcome {
            registered: vec![kf_id],
            inliers,
            extended_observations: extended,
            new_landmarks,
        })
    }

    /// 2D-3D matches: query features whose window match observes a landmark.
    ///
    /// Each query feature and each landmark is used at most once, the most
    /// confident match winning.
    fn chain(&self, graph: &PoseGraph, usable: &[(KeyframeId, &[Correspondence])]) -> Vec<Chained> {
        let mut candidates: Vec<Chained> = usable
            .iter()
            .flat_map(|(target, corrs)| {
                corrs.iter().filter_map(move |c| {
                    graph.landmark_for_feature(*target, c.index_b).map(|landmark| Chained {
                        feature_idx: c.index_a,
                        landmark,
                        confidence: c.confidence,
                    })
                })
            })
            .collect();
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut used_features = HashSet::new();
        let mut used_landmarks = HashSet::new();
        candidates.retain(|c| used_features.insert(c.feature_idx) && used_landmarks.insert(c.landmark));
        candidates.sort_by_key(|c| c.feature_idx);
        candidates
    }

    /// Triangulate matches where neither side has a landmark yet.
    fn triangulate_new(
        &self,
        graph: &mut PoseGraph,
        kf_id: KeyframeId,
        usable: &[(KeyframeId, &[Correspondence])],
    ) -> usize {
        let Some(kf) = graph.keyframe(kf_id) else { return 0 };
        let Some(pose_wc) = kf.pose_wc().copied() else { return 0 };
        let intrinsics = kf.intrinsics;
        let features = Arc::clone(kf.features());

        let mut created = 0;
        let mut rejected = 0;
        for (target, corrs) in usable {
            let Some(other) = graph.keyframe(*target) else { continue };
            let Some(other_pose) = other.pose_wc().copied() else { continue };
            let other_intrinsics = other.intrinsics;

            for c in corrs.iter() {
                if graph.landmark_for_feature(kf_id, c.index_a).is_some()
                    || graph.landmark_for_feature(*target, c.index_b).is_some()
                {
                    continue;
                }
                let v1 = View {
                    pose_wc: &pose_wc,
                    intrinsics: &intrinsics,
                    pixel: c.pixel_a,
                };
                let v2 = View {
                    pose_wc: &other_pose,
                    intrinsics: &other_intrinsics,
                    pixel: c.pixel_b,
                };
                match triangulate_pair(&v1, &v2, &self.config.triangulation) {
                    Ok(point) => {
                        let color = features.color(c.index_a);
                        if graph
                            .create_landmark(point, color, &[(kf_id, c.index_a), (*target, c.index_b)])
                            .is_some()
                        {
                            created += 1;
                        }
                    }
                    Err(_) => rejected += 1,
                }
            }
        }

        debug!(
            "[Registrator] {}: triangulated {} new landmarks ({} rejected)",
            kf_id, created, rejected
        );
        created
    }
}

impl Default for Registrator {
    fn default() -> Self {
        Self::new(RegistrationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::geometry::triangulation::parallax_angle;
    use crate::tracking::{Displacement, FeatureSet, Frame, ImageRef, Keypoint};
    use approx::assert_relative_eq;
    use nalgebra::Vector2;
    use std::time::Duration;

    fn intrinsics() -> Intrinsics {
        Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0)
    }

    /// Scene points spread in depth so the pose problems are well posed.
    fn scene() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for i in 0..8 {
            for j in 0..6 {
                let x = -2.0 + 0.55 * i as f64;
                let y = -1.5 + 0.6 * j as f64;
                let z = 6.0 + ((i * 7 + j * 3) % 5) as f64 * 0.8;
                pts.push(Vector3::new(x, y, z));
            }
        }
        pts
    }

    fn pose_at(x: f64) -> SE3 {
        SE3::from_translation(Vector3::new(x, 0.0, 0.0))
    }

    /// Keyframe seeing every scene point; keypoint j observes point j.
    fn pending(index: u64, pose_wc: &SE3) -> PendingKeyframe {
        let cam = intrinsics();
        let keypoints = scene()
            .iter()
            .enumerate()
            .map(|(j, p)| {
                let uv = cam.project(&pose_wc.inverse().transform_point(p)).unwrap();
                let mut kp = Keypoint::new(uv, vec![j as f32]);
                kp.color = Some([j as u8, 0, 0]);
                kp
            })
            .collect();
        let kf = Keyframe::new(
            Frame::new(index, index as f64 * 0.1, ImageRef::new(format!("frame_{index:06}.png"))),
            Arc::new(FeatureSet::new(keypoints)),
            Displacement::Unavailable,
        );
        PendingKeyframe::new(Arc::new(kf), cam)
    }

    fn identity_matches(a: &PendingKeyframe, b: &PendingKeyframe) -> Vec<Correspondence> {
        (0..a.keyframe.features.len())
            .map(|j| Correspondence {
                index_a: j,
                index_b: j,
                pixel_a: a.keyframe.features.keypoints[j].pixel,
                pixel_b: b.keyframe.features.keypoints[j].pixel,
                confidence: 1.0,
            })
            .collect()
    }

    fn registrator() -> Registrator {
        Registrator::new(RegistrationConfig {
            min_correspondences: 20,
            min_inliers: 12,
            ..RegistrationConfig::default()
        })
    }

    fn bootstrapped() -> (PoseGraph, Registrator, Vec<KeyframeId>) {
        let reg = registrator();
        let mut graph = PoseGraph::new();
        let a = pending(0, &pose_at(0.0));
        let b = pending(5, &pose_at(0.5));
        let outcome = reg.bootstrap(&mut graph, &a, &b, &identity_matches(&a, &b)).unwrap();
        (graph, reg, outcome.registered)
    }

    #[test]
    fn test_bootstrap_unit_baseline() {
        let (graph, _, ids) = bootstrapped();
        assert_eq!(ids.len(), 2);
        let seed = graph.keyframe(ids[0]).unwrap().pose_wc().unwrap();
        let cand = graph.keyframe(ids[1]).unwrap().pose_wc().unwrap();
        assert_relative_eq!(seed.translation, Vector3::zeros());
        assert_relative_eq!(cand.translation.norm(), 1.0, epsilon = 1e-9);
        // Camera moved along +x.
        assert!(cand.translation.x > 0.99);
        assert_eq!(graph.num_landmarks(), scene().len());
        graph.assert_invariants();
    }

    #[test]
    fn test_bootstrap_landmarks_satisfy_baseline() {
        let (graph, reg, ids) = bootstrapped();
        let c0 = graph.keyframe(ids[0]).unwrap().camera_center().unwrap();
        let c1 = graph.keyframe(ids[1]).unwrap().camera_center().unwrap();
        let min = reg.config().triangulation.min_parallax_rad();
        for lm in graph.landmarks() {
            assert!(parallax_angle(&lm.position, &c0, &c1) >= min);
            assert_eq!(lm.num_observations(), 2);
        }
        // Colors come from the seed keypoints.
        let lm = graph.landmark_for_feature(ids[0], 7).unwrap();
        assert_eq!(graph.landmark(lm).unwrap().color, Some([7, 0, 0]));
    }

    #[test]
    fn test_bootstrap_without_correspondences_leaves_store_empty() {
        let reg = registrator();
        let mut graph = PoseGraph::new();
        let a = pending(0, &pose_at(0.0));
        let b = pending(1, &pose_at(0.5));

        let err = reg.bootstrap(&mut graph, &a, &b, &[]).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::InsufficientCorrespondences {
                stage: RegistrationStage::TwoView,
                found: 0,
                required: 20
            }
        );
        assert!(graph.is_empty());
        assert_eq!(graph.revision(), 0);
    }

    #[test]
    fn test_bootstrap_rejects_low_parallax() {
        let reg = registrator();
        let mut graph = PoseGraph::new();
        let a = pending(0, &pose_at(0.0));
        let b = pending(1, &pose_at(0.02));

        let err = reg.bootstrap(&mut graph, &a, &b, &identity_matches(&a, &b)).unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::InsufficientTriangulation { .. } | RegistrationError::DegenerateTwoView(_)
        ));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_register_chains_through_window() {
        let (mut graph, reg, ids) = bootstrapped();
        let c = pending(10, &pose_at(1.0));
        let kf = graph.insert_keyframe(Arc::clone(&c.keyframe), c.intrinsics);

        let b_features = Arc::clone(graph.keyframe(ids[1]).unwrap().features());
        let corrs: Vec<Correspondence> = (0..scene().len())
            .map(|j| Correspondence {
                index_a: j,
                index_b: j,
                pixel_a: c.keyframe.features.keypoints[j].pixel,
                pixel_b: b_features.keypoints[j].pixel,
                confidence: 0.9,
            })
            .collect();
        let matches = vec![WindowMatch {
            target: ids[1],
            result: Ok(corrs),
        }];

        let outcome = reg.register(&mut graph, kf, &matches).unwrap();
        assert_eq!(outcome.registered, vec![kf]);
        assert_eq!(outcome.extended_observations, scene().len());
        assert_eq!(outcome.new_landmarks, 0);

        // Bootstrap fixed the scale: 0.5 true units = 1.0 store units.
        let pose = graph.keyframe(kf).unwrap().pose_wc().unwrap();
        assert_relative_eq!(pose.translation, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-4);
        assert!(graph.landmarks().all(|lm| lm.num_observations() == 3));
        graph.assert_invariants();
    }

    #[test]
    fn test_register_failure_leaves_store_untouched() {
        let (mut graph, reg, ids) = bootstrapped();
        let c = pending(10, &pose_at(1.0));
        let kf = graph.insert_keyframe(Arc::clone(&c.keyframe), c.intrinsics);
        let revision = graph.revision();

        let matches = vec![WindowMatch {
            target: ids[1],
            result: Err(MatchError::NoCorrespondence),
        }];
        let err = reg.register(&mut graph, kf, &matches).unwrap_err();
        assert_eq!(err.stage(), RegistrationStage::Matching);
        assert_eq!(graph.revision(), revision);
        assert!(!graph.is_registered(kf));
    }

    #[test]
    fn test_register_reports_capability_failure() {
        let (mut graph, reg, ids) = bootstrapped();
        let c = pending(10, &pose_at(1.0));
        let kf = graph.insert_keyframe(Arc::clone(&c.keyframe), c.intrinsics);

        let timeout = CapabilityError::Timeout(Duration::from_millis(5));
        let matches = vec![WindowMatch {
            target: ids[0],
            result: Err(MatchError::Capability(timeout.clone())),
        }];
        let err = reg.register(&mut graph, kf, &matches).unwrap_err();
        assert_eq!(err, RegistrationError::Capability(timeout));
    }

    #[test]
    fn test_register_triangulates_unexplained_matches() {
        let (mut graph, reg, ids) = bootstrapped();

        // Drop half the landmarks so their features are free again.
        let dropped: Vec<LandmarkId> = graph.landmarks().map(|lm| lm.id).filter(|id| id.0 % 2 == 0).collect();
        for lm in &dropped {
            graph.remove_landmark(*lm);
        }
        let remaining = graph.num_landmarks();

        let c = pending(10, &pose_at(1.0));
        let kf = graph.insert_keyframe(Arc::clone(&c.keyframe), c.intrinsics);
        let b_features = Arc::clone(graph.keyframe(ids[1]).unwrap().features());
        let corrs: Vec<Correspondence> = (0..scene().len())
            .map(|j| Correspondence {
                index_a: j,
                index_b: j,
                pixel_a: c.keyframe.features.keypoints[j].pixel,
                pixel_b: b_features.keypoints[j].pixel,
                confidence: 1.0,
            })
            .collect();
        let matches = vec![WindowMatch {
            target: ids[1],
            result: Ok(corrs),
        }];

        let outcome = reg.register(&mut graph, kf, &matches).unwrap();
        assert_eq!(outcome.extended_observations, remaining);
        assert_eq!(outcome.new_landmarks, dropped.len());

        let min = reg.config().triangulation.min_parallax_rad();
        for (_, lm_id) in graph.landmarks_observed_by(kf) {
            assert!(graph.landmark_parallax(lm_id) >= min);
        }
        graph.assert_invariants();
    }

    #[test]
    fn test_window_recent_plus_covisible() {
        let (mut graph, _, ids) = bootstrapped();
        let reg = Registrator::new(RegistrationConfig {
            window_recent: 1,
            window_covisible: 5,
            ..RegistrationConfig::default()
        });
        assert_eq!(reg.window(&graph), vec![ids[1], ids[0]]);

        // Unregistered keyframes never enter the window.
        let c = pending(10, &pose_at(1.0));
        graph.insert_keyframe(Arc::clone(&c.keyframe), c.intrinsics);
        assert_eq!(reg.window(&graph).len(), 2);
    }

    #[test]
    fn test_chain_prefers_confident_match() {
        let (graph, reg, ids) = bootstrapped();
        let lm0 = graph.landmark_for_feature(ids[0], 0).unwrap();
        let corrs = vec![
            Correspondence {
                index_a: 3,
                index_b: 0,
                pixel_a: Vector2::zeros(),
                pixel_b: Vector2::zeros(),
                confidence: 0.2,
            },
            Correspondence {
                index_a: 4,
                index_b: 0,
                pixel_a: Vector2::zeros(),
                pixel_b: Vector2::zeros(),
                confidence: 0.9,
            },
        ];
        let chained = reg.chain(&graph, &[(ids[0], corrs.as_slice())]);
        assert_eq!(chained.len(), 1);
        assert_eq!(chained[0].feature_idx, 4);
        assert_eq!(chained[0].landmark, lm0);
    }
}
