//! Deterministic synthetic scenes.
//!
//! A camera moves along +x looking down +z. Every frame sees a fixed
//! number of landmarks; a fraction `overlap` of them carries over to the
//! next frame, the rest are replaced by new ones. Each landmark has its own
//! random unit descriptor, so descriptor matching recovers exactly the
//! shared landmarks.

use std::collections::HashSet;
use std::sync::Arc;

use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::calibration::ControlPoint;
use crate::capability::{FeatureExtractor, FrameSource};
use crate::error::CapabilityError;
use crate::geometry::{Intrinsics, SE3};
use crate::map::{KeyframeId, PoseGraph};
use crate::tracking::{Displacement, FeatureSet, Frame, ImageRef, Keyframe, Keypoint};

/// Synthetic scene parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub num_frames: usize,
    /// Camera travel between consecutive frames (scene units).
    pub step: f64,
    /// Fraction of a frame's landmarks still visible in the next frame.
    pub overlap: f64,
    pub points_per_frame: usize,
    pub min_depth: f64,
    pub max_depth: f64,
    /// Maximum absolute pixel noise (uniform).
    pub pixel_noise: f64,
    pub descriptor_dims: usize,
    /// Seconds between frames.
    pub frame_interval: f64,
    pub seed: u64,
    pub intrinsics: Intrinsics,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            num_frames: 10,
            step: 0.5,
            overlap: 0.7,
            points_per_frame: 120,
            min_depth: 4.0,
            max_depth: 8.0,
            pixel_noise: 0.0,
            descriptor_dims: 32,
            frame_interval: 1.0 / 30.0,
            seed: 7,
            intrinsics: Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SceneLandmark {
    pub position: Vector3<f64>,
    pub descriptor: Vec<f32>,
    pub color: [u8; 3],
}

/// A generated scene: ground-truth cameras and landmarks plus the features
/// each frame would produce.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    config: SceneConfig,
    poses_wc: Vec<SE3>,
    landmarks: Vec<SceneLandmark>,
    /// Landmark index of every keypoint, per frame.
    visible: Vec<Vec<usize>>,
    features: Vec<Arc<FeatureSet>>,
}

impl SyntheticScene {
    pub fn generate(config: SceneConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let cam = config.intrinsics;
        let width = 2.0 * cam.cx;
        let height = 2.0 * cam.cy;

        let poses_wc: Vec<SE3> = (0..config.num_frames)
            .map(|i| SE3::from_translation(Vector3::new(i as f64 * config.step, 0.0, 0.0)))
            .collect();

        let mut landmarks: Vec<SceneLandmark> = Vec::new();
        let mut visible: Vec<Vec<usize>> = Vec::with_capacity(config.num_frames);

        for (f, pose_wc) in poses_wc.iter().enumerate() {
            let mut seen: Vec<usize> = match visible.last() {
                Some(prev) if f > 0 => {
                    let keep = ((config.overlap.clamp(0.0, 1.0) * prev.len() as f64).round() as usize).min(prev.len());
                    let mut kept: Vec<usize> = prev.choose_multiple(&mut rng, keep).copied().collect();
                    kept.sort_unstable();
                    kept
                }
                _ => Vec::new(),
            };

            while seen.len() < config.points_per_frame {
                // Points enter on the right and drift left as the camera moves +x.
                let u = rng.gen_range(0.25 * width..width);
                let v = rng.gen_range(0.0..height);
                let z = rng.gen_range(config.min_depth..config.max_depth);
                let p_cam = Vector3::new((u - cam.cx) / cam.fx * z, (v - cam.cy) / cam.fy * z, z);
                landmarks.push(SceneLandmark {
                    position: pose_wc.transform_point(&p_cam),
                    descriptor: random_descriptor(&mut rng, config.descriptor_dims),
                    color: [rng.gen(), rng.gen(), rng.gen()],
                });
                seen.push(landmarks.len() - 1);
            }
            visible.push(seen);
        }

        let mut features = Vec::with_capacity(config.num_frames);
        for (pose_wc, seen) in poses_wc.iter().zip(&visible) {
            let pose_cw = pose_wc.inverse();
            let mut keypoints = Vec::with_capacity(seen.len());
            for &lm in seen {
                let landmark = &landmarks[lm];
                let Some(mut pixel) = cam.project(&pose_cw.transform_point(&landmark.position)) else {
                    continue;
                };
                if config.pixel_noise > 0.0 {
                    pixel += Vector2::new(
                        rng.gen_range(-config.pixel_noise..config.pixel_noise),
                        rng.gen_range(-config.pixel_noise..config.pixel_noise),
                    );
                }
                let mut kp = Keypoint::new(pixel, landmark.descriptor.clone());
                kp.color = Some(landmark.color);
                keypoints.push(kp);
            }
            features.push(Arc::new(FeatureSet::new(keypoints)));
        }

        Self {
            config,
            poses_wc,
            landmarks,
            visible,
            features,
        }
    }

    /// Straight-line sequence with the default layout.
    pub fn straight_line(num_frames: usize, overlap: f64) -> Self {
        Self::generate(SceneConfig {
            num_frames,
            overlap,
            ..SceneConfig::default()
        })
    }

    /// Two frames that share no landmark.
    pub fn disjoint_pair() -> Self {
        Self::generate(SceneConfig {
            num_frames: 2,
            overlap: 0.0,
            ..SceneConfig::default()
        })
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.config.intrinsics
    }

    pub fn num_frames(&self) -> usize {
        self.poses_wc.len()
    }

    pub fn pose_wc(&self, frame: usize) -> Option<&SE3> {
        self.poses_wc.get(frame)
    }

    pub fn poses_wc(&self) -> &[SE3] {
        &self.poses_wc
    }

    pub fn landmarks(&self) -> &[SceneLandmark] {
        &self.landmarks
    }

    /// Scene landmarks seen by `frame`, in keypoint order.
    pub fn visible(&self, frame: usize) -> &[usize] {
        self.visible.get(frame).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn features(&self, frame: usize) -> Option<&Arc<FeatureSet>> {
        self.features.get(frame)
    }

    pub fn shared_landmarks(&self, a: usize, b: usize) -> usize {
        let in_a: HashSet<usize> = self.visible(a).iter().copied().collect();
        self.visible(b).iter().filter(|lm| in_a.contains(lm)).count()
    }

    /// Store built from ground truth: every frame registered at its true pose,
    /// every landmark seen twice or more inserted with its observations.
    pub fn ground_truth_graph(&self) -> PoseGraph {
        let mut graph = PoseGraph::new();
        let mut kf_ids: Vec<KeyframeId> = Vec::with_capacity(self.num_frames());
        for position in 0..self.num_frames() {
            let (Some(frame), Some(features)) = (self.frame(position), self.features(position)) else {
                continue;
            };
            let kf = Arc::new(Keyframe::new(frame, Arc::clone(features), Displacement::Unavailable));
            let id = graph.insert_keyframe(kf, self.config.intrinsics);
            graph.set_pose(id, self.poses_wc[position]);
            kf_ids.push(id);
        }

        let mut observations: Vec<Vec<(KeyframeId, usize)>> = vec![Vec::new(); self.landmarks.len()];
        for (frame, seen) in self.visible.iter().enumerate() {
            for (feature_idx, &lm) in seen.iter().enumerate() {
                observations[lm].push((kf_ids[frame], feature_idx));
            }
        }
        for (lm, obs) in observations.iter().enumerate() {
            let landmark = &self.landmarks[lm];
            graph.create_landmark(landmark.position, Some(landmark.color), obs);
        }
        graph
    }

    /// Ground-truth positions of up to `max` reconstructed landmarks, found
    /// through the keypoints that observe them.
    pub fn control_points(&self, graph: &PoseGraph, max: usize) -> Vec<ControlPoint> {
        let mut landmarks: Vec<_> = graph.landmarks().collect();
        landmarks.sort_by_key(|lm| lm.id);
        landmarks
            .into_iter()
            .filter_map(|lm| {
                let (kf_id, &feature_idx) = lm.observations().iter().next()?;
                let frame = graph.keyframe(*kf_id)?.frame_index() as usize;
                let scene_lm = *self.visible(frame).get(feature_idx)?;
                Some(ControlPoint::landmark(lm.id, self.landmarks[scene_lm].position))
            })
            .take(max)
            .collect()
    }
}

impl FrameSource for SyntheticScene {
    fn len(&self) -> usize {
        self.poses_wc.len()
    }

    fn frame(&self, position: usize) -> Option<Frame> {
        if position >= self.poses_wc.len() {
            return None;
        }
        let frame = Frame::new(
            position as u64,
            position as f64 * self.config.frame_interval,
            ImageRef::new(format!("frame_{position:06}.png")),
        );
        Some(frame.with_intrinsics(self.config.intrinsics))
    }
}

impl FeatureExtractor for SyntheticScene {
    fn extract(&self, frame: &Frame) -> Result<FeatureSet, CapabilityError> {
        self.features
            .get(frame.index as usize)
            .map(|fs| FeatureSet::clone(fs))
            .ok_or_else(|| CapabilityError::Unavailable(format!("no synthetic frame {}", frame.index)))
    }
}

fn random_descriptor(rng: &mut StdRng, dims: usize) -> Vec<f32> {
    let mut d: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let norm = d.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        d.iter_mut().for_each(|x| *x /= norm);
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_between_consecutive_frames() {
        let scene = SyntheticScene::straight_line(6, 0.7);
        for f in 1..6 {
            assert_eq!(scene.shared_landmarks(f - 1, f), 84);
            assert_eq!(scene.visible(f).len(), 120);
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = SyntheticScene::straight_line(4, 0.5);
        let b = SyntheticScene::straight_line(4, 0.5);
        assert_eq!(a.landmarks().len(), b.landmarks().len());
        assert_eq!(a.visible(3), b.visible(3));
        assert_eq!(a.features(2).unwrap().keypoints, b.features(2).unwrap().keypoints);
    }

    #[test]
    fn test_disjoint_pair_shares_nothing() {
        let scene = SyntheticScene::disjoint_pair();
        assert_eq!(scene.num_frames(), 2);
        assert_eq!(scene.shared_landmarks(0, 1), 0);
    }

    #[test]
    fn test_keypoints_are_projections() {
        let scene = SyntheticScene::straight_line(3, 0.7);
        let cam = scene.intrinsics();
        let pose_cw = scene.pose_wc(2).unwrap().inverse();
        let fs = scene.features(2).unwrap();
        for (kp, &lm) in fs.keypoints.iter().zip(scene.visible(2)) {
            let expected = cam.project(&pose_cw.transform_point(&scene.landmarks()[lm].position)).unwrap();
            assert!((kp.pixel - expected).norm() < 1e-9);
        }
    }

    #[test]
    fn test_frame_source_and_extractor() {
        let scene = SyntheticScene::straight_line(3, 0.7);
        assert_eq!(scene.len(), 3);
        let frame = scene.frame(1).unwrap();
        assert_eq!(frame.index, 1);
        assert_eq!(frame.image.as_str(), "frame_000001.png");
        assert_eq!(frame.intrinsics, Some(*scene.intrinsics()));
        assert!(scene.frame(3).is_none());

        let fs = scene.extract(&frame).unwrap();
        assert_eq!(fs.len(), 120);
        assert!(fs.keypoints.iter().all(|kp| kp.color.is_some()));

        let ghost = Frame::new(9, 0.3, ImageRef::new("ghost.png"));
        assert!(scene.extract(&ghost).is_err());
    }

    #[test]
    fn test_ground_truth_graph_is_consistent() {
        let scene = SyntheticScene::straight_line(5, 0.7);
        let graph = scene.ground_truth_graph();
        assert_eq!(graph.num_registered(), 5);
        assert!(graph.validate().is_ok());
        assert!(graph.stats().landmarks_with_3plus > 0);
    }

    #[test]
    fn test_control_points_match_ground_truth() {
        let scene = SyntheticScene::straight_line(3, 0.7);
        let graph = scene.ground_truth_graph();
        let points = scene.control_points(&graph, 10);
        assert_eq!(points.len(), 10);
        for cp in &points {
            let crate::calibration::ControlTarget::Landmark(id) = cp.target else {
                panic!("expected a landmark target");
            };
            let lm = graph.landmark(id).unwrap();
            assert!((lm.position - cp.metric).norm() < 1e-9);
        }
    }
}
