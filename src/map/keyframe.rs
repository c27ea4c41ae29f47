//! Keyframe node of the pose graph.
//!
//! A node wraps the immutable [`Keyframe`] produced by the selector and adds
//! the mutable reconstruction state: the camera pose once registered, the
//! feature-to-landmark associations and the covisibility edges.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::Vector3;

use crate::geometry::{Intrinsics, SE3};
use crate::tracking::{FeatureSet, Keyframe};

use super::types::{KeyframeId, LandmarkId};

/// Camera pose of a registered keyframe.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose {
    /// Camera-to-world transform (T_wc).
    pub pose_wc: SE3,
    pub intrinsics: Intrinsics,
}

impl CameraPose {
    pub fn center(&self) -> Vector3<f64> {
        self.pose_wc.translation
    }
}

#[derive(Debug, Clone)]
pub struct KeyframeNode {
    pub id: KeyframeId,

    /// Frame, features and motion estimate. Shared with the caller, never mutated.
    pub keyframe: Arc<Keyframe>,

    /// Intrinsics resolved at insertion (frame hint or pipeline default).
    pub intrinsics: Intrinsics,

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────
    /// Camera-to-world pose. `None` while unregistered.
    pub(super) pose_wc: Option<SE3>,

    /// Position in registration order. `None` while unregistered.
    pub(super) registration_seq: Option<u64>,

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// Feature index → landmark.
    pub(super) landmark_ids: Vec<Option<LandmarkId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected keyframe → number of shared landmarks.
    pub(super) covisibility: HashMap<KeyframeId, usize>,
}

impl KeyframeNode {
    pub(super) fn new(id: KeyframeId, keyframe: Arc<Keyframe>, intrinsics: Intrinsics) -> Self {
        let num_features = keyframe.features.len();
        Self {
            id,
            keyframe,
            intrinsics,
            pose_wc: None,
            registration_seq: None,
            landmark_ids: vec![None; num_features],
            covisibility: HashMap::new(),
        }
    }

    /// Index of the source frame.
    pub fn frame_index(&self) -> u64 {
        self.keyframe.frame.index
    }

    pub fn timestamp(&self) -> f64 {
        self.keyframe.frame.timestamp
    }

    pub fn features(&self) -> &Arc<FeatureSet> {
        &self.keyframe.features
    }

    pub fn num_features(&self) -> usize {
        self.landmark_ids.len()
    }

    pub fn is_registered(&self) -> bool {
        self.pose_wc.is_some()
    }

    pub fn pose_wc(&self) -> Option<&SE3> {
        self.pose_wc.as_ref()
    }

    pub fn camera_pose(&self) -> Option<CameraPose> {
        self.pose_wc.as_ref().map(|pose_wc| CameraPose {
            pose_wc: *pose_wc,
            intrinsics: self.intrinsics,
        })
    }

    /// Camera center in world coordinates, if registered.
    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose_wc.as_ref().map(|p| p.translation)
    }

    pub fn registration_seq(&self) -> Option<u64> {
        self.registration_seq
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn landmark(&self, feature_idx: usize) -> Option<LandmarkId> {
        self.landmark_ids.get(feature_idx).copied().flatten()
    }

    pub(super) fn set_landmark(&mut self, feature_idx: usize, lm_id: LandmarkId) {
        if let Some(slot) = self.landmark_ids.get_mut(feature_idx) {
            *slot = Some(lm_id);
        }
    }

    pub(super) fn erase_landmark(&mut self, feature_idx: usize) -> Option<LandmarkId> {
        self.landmark_ids.get_mut(feature_idx).and_then(Option::take)
    }

    /// `(feature index, landmark)` for every associated feature.
    pub fn landmark_indices(&self) -> impl Iterator<Item = (usize, LandmarkId)> + '_ {
        self.landmark_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, lm)| lm.map(|id| (idx, id)))
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmark_ids.iter().filter(|lm| lm.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    pub fn covisibility_weight(&self, kf_id: KeyframeId) -> usize {
        self.covisibility.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyframeId, usize> {
        &self.covisibility
    }

    pub(super) fn increment_covisibility(&mut self, kf_id: KeyframeId) {
        if kf_id != self.id {
            *self.covisibility.entry(kf_id).or_insert(0) += 1;
        }
    }

    pub(super) fn decrement_covisibility(&mut self, kf_id: KeyframeId) {
        if let Some(w) = self.covisibility.get_mut(&kf_id) {
            if *w <= 1 {
                self.covisibility.remove(&kf_id);
            } else {
                *w -= 1;
            }
        }
    }

    /// Covisible keyframes, most shared landmarks first, ties by id.
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyframeId> {
        let mut covisibles: Vec<(KeyframeId, usize)> =
            self.covisibility.iter().map(|(&id, &w)| (id, w)).collect();
        covisibles.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        covisibles.into_iter().take(n).map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{Displacement, Frame, ImageRef, Keypoint};
    use nalgebra::Vector2;

    fn node(num_features: usize) -> KeyframeNode {
        let features = FeatureSet::new(
            (0..num_features)
                .map(|i| Keypoint::new(Vector2::new(i as f64, 0.0), vec![i as f32]))
                .collect(),
        );
        let kf = Keyframe::new(
            Frame::new(4, 0.4, ImageRef::new("f4")),
            Arc::new(features),
            Displacement::Unavailable,
        );
        KeyframeNode::new(KeyframeId::new(0), Arc::new(kf), Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0))
    }

    #[test]
    fn test_new_node_is_unregistered() {
        let node = node(5);
        assert!(!node.is_registered());
        assert_eq!(node.num_features(), 5);
        assert_eq!(node.num_landmarks(), 0);
        assert_eq!(node.frame_index(), 4);
    }

    #[test]
    fn test_landmark_slots() {
        let mut node = node(3);
        node.set_landmark(1, LandmarkId::new(9));
        node.set_landmark(7, LandmarkId::new(10));
        assert_eq!(node.landmark(1), Some(LandmarkId::new(9)));
        assert_eq!(node.landmark(7), None);
        assert_eq!(node.landmark_indices().collect::<Vec<_>>(), vec![(1, LandmarkId::new(9))]);
        assert_eq!(node.erase_landmark(1), Some(LandmarkId::new(9)));
        assert_eq!(node.num_landmarks(), 0);
    }

    #[test]
    fn test_covisibility_ordering() {
        let mut node = node(0);
        for _ in 0..3 {
            node.increment_covisibility(KeyframeId::new(2));
        }
        node.increment_covisibility(KeyframeId::new(5));
        node.increment_covisibility(KeyframeId::new(1));
        node.increment_covisibility(KeyframeId::new(0));

        assert_eq!(
            node.best_covisibles(3),
            vec![KeyframeId::new(2), KeyframeId::new(1), KeyframeId::new(5)]
        );
        node.decrement_covisibility(KeyframeId::new(1));
        assert_eq!(node.covisibility_weight(KeyframeId::new(1)), 0);
        assert!(!node.covisibility_weights().contains_key(&KeyframeId::new(0)));
    }
}
