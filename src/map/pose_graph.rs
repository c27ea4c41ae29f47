//! PoseGraph - the mutable reconstruction state.
//!
//! Holds keyframes (registered or waiting for registration), landmarks and
//! the observation edges linking them. Every mutation goes through the
//! methods below so that the bidirectional associations and the
//! covisibility weights stay consistent:
//! - an observation is stored on both the landmark and the keyframe
//! - removing a keyframe or landmark removes all its edges
//! - a landmark losing its second-to-last observation is removed
//!
//! A `revision` counter is bumped on every mutation; refinement results
//! computed against an older revision are rejected by the scheduler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;
use thiserror::Error;

use crate::geometry::triangulation::max_parallax;
use crate::geometry::{Intrinsics, SE3};
use crate::tracking::Keyframe;

use super::keyframe::KeyframeNode;
use super::landmark::Landmark;
use super::types::{KeyframeId, LandmarkId};

/// Minimum number of observations a landmark must keep.
pub const MIN_OBSERVATIONS: usize = 2;

/// A broken store invariant. Always a programming error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("{landmark} has an observation edge to missing {keyframe}")]
    DanglingObservation { landmark: LandmarkId, keyframe: KeyframeId },
    #[error("{keyframe} feature {feature} references missing {landmark}")]
    DanglingAssociation {
        keyframe: KeyframeId,
        feature: usize,
        landmark: LandmarkId,
    },
    #[error("edge {landmark} <-> {keyframe} feature {feature} is not stored on both sides")]
    MissingBackReference {
        landmark: LandmarkId,
        keyframe: KeyframeId,
        feature: usize,
    },
    #[error("{landmark} has {observations} observations, need at least {MIN_OBSERVATIONS}")]
    UnderObserved { landmark: LandmarkId, observations: usize },
    #[error("{landmark} is observed by unregistered {keyframe}")]
    UnregisteredObserver { landmark: LandmarkId, keyframe: KeyframeId },
    #[error("covisibility {a} -> {b} is {stored}, expected {expected}")]
    CovisibilityMismatch {
        a: KeyframeId,
        b: KeyframeId,
        stored: usize,
        expected: usize,
    },
}

/// Result of [`PoseGraph::remove_observation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationRemoval {
    /// No such edge.
    Missing,
    /// Edge removed, landmark kept.
    Removed,
    /// Edge removed and the landmark dropped below the minimum and was deleted.
    RemovedWithLandmark,
}

/// Summary counts of the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphStats {
    pub keyframes: usize,
    pub registered: usize,
    pub landmarks: usize,
    pub observations: usize,
    /// Mean number of observations per landmark.
    pub mean_track_length: f64,
    /// Landmarks seen by three or more keyframes.
    pub landmarks_with_3plus: usize,
}

pub struct PoseGraph {
    keyframes: HashMap<KeyframeId, KeyframeNode>,
    landmarks: HashMap<LandmarkId, Landmark>,

    next_kf_id: u64,
    next_lm_id: u64,
    next_registration_seq: u64,

    /// Bumped on every mutation.
    revision: u64,
}

impl PoseGraph {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            landmarks: HashMap::new(),
            next_kf_id: 0,
            next_lm_id: 0,
            next_registration_seq: 0,
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) {
        self.revision += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty() && self.landmarks.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframe Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert an unregistered keyframe.
    pub fn insert_keyframe(&mut self, keyframe: Arc<Keyframe>, intrinsics: Intrinsics) -> KeyframeId {
        let id = KeyframeId::new(self.next_kf_id);
        self.next_kf_id += 1;
        self.keyframes.insert(id, KeyframeNode::new(id, keyframe, intrinsics));
        self.bump();
        id
    }

    /// Set the camera-to-world pose of a keyframe.
    ///
    /// The first call registers the keyframe and assigns its position in
    /// registration order. Returns false for unknown ids.
    pub fn set_pose(&mut self, kf_id: KeyframeId, pose_wc: SE3) -> bool {
        let seq = self.next_registration_seq;
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return false;
        };
        if kf.registration_seq.is_none() {
            kf.registration_seq = Some(seq);
            self.next_registration_seq += 1;
        }
        kf.pose_wc = Some(pose_wc);
        self.bump();
        true
    }

    pub fn keyframe(&self, id: KeyframeId) -> Option<&KeyframeNode> {
        self.keyframes.get(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyframeNode> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn num_registered(&self) -> usize {
        self.keyframes.values().filter(|kf| kf.is_registered()).count()
    }

    pub fn is_registered(&self, id: KeyframeId) -> bool {
        self.keyframes.get(&id).is_some_and(|kf| kf.is_registered())
    }

    /// Keyframe holding the given source frame, if any.
    pub fn keyframe_for_frame(&self, frame_index: u64) -> Option<KeyframeId> {
        self.keyframes
            .values()
            .find(|kf| kf.frame_index() == frame_index)
            .map(|kf| kf.id)
    }

    /// Remove a keyframe with all its observation edges.
    ///
    /// Landmarks left with fewer than [`MIN_OBSERVATIONS`] are removed too.
    pub fn remove_keyframe(&mut self, kf_id: KeyframeId) -> Option<KeyframeNode> {
        let associations: Vec<LandmarkId> = self
            .keyframes
            .get(&kf_id)?
            .landmark_indices()
            .map(|(_, lm)| lm)
            .collect();

        for lm_id in associations {
            self.remove_observation(kf_id, lm_id);
        }

        let node = self.keyframes.remove(&kf_id)?;
        for other in node.covisibility.keys() {
            if let Some(other_kf) = self.keyframes.get_mut(other) {
                other_kf.covisibility.remove(&kf_id);
            }
        }
        self.bump();
        Some(node)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a landmark together with its initial observations.
    ///
    /// Returns `None` and leaves the store untouched unless the observations
    /// name at least [`MIN_OBSERVATIONS`] distinct registered keyframes whose
    /// features are free.
    pub fn create_landmark(
        &mut self,
        position: Vector3<f64>,
        color: Option<[u8; 3]>,
        observations: &[(KeyframeId, usize)],
    ) -> Option<LandmarkId> {
        let mut seen = HashSet::new();
        for &(kf_id, feature_idx) in observations {
            let kf = self.keyframes.get(&kf_id)?;
            if !kf.is_registered() || feature_idx >= kf.num_features() || kf.landmark(feature_idx).is_some() {
                return None;
            }
            if !seen.insert(kf_id) {
                return None;
            }
        }
        if seen.len() < MIN_OBSERVATIONS {
            return None;
        }

        let id = LandmarkId::new(self.next_lm_id);
        self.next_lm_id += 1;
        self.landmarks
            .insert(id, Landmark::new(id, position, color, observations[0].0));

        for &(kf_id, feature_idx) in observations {
            self.link(kf_id, feature_idx, id);
        }
        self.bump();
        Some(id)
    }

    /// Add an observation edge to an existing landmark.
    ///
    /// Returns false if the keyframe is unknown or unregistered, the feature
    /// is already associated, or the landmark is already observed by this keyframe.
    pub fn add_observation(&mut self, kf_id: KeyframeId, feature_idx: usize, lm_id: LandmarkId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        if !kf.is_registered() || feature_idx >= kf.num_features() || kf.landmark(feature_idx).is_some() {
            return false;
        }
        match self.landmarks.get(&lm_id) {
            Some(lm) if !lm.is_observed_by(kf_id) => {}
            _ => return false,
        }
        self.link(kf_id, feature_idx, lm_id);
        self.bump();
        true
    }

    /// Store the edge on both sides and bump covisibility with existing observers.
    fn link(&mut self, kf_id: KeyframeId, feature_idx: usize, lm_id: LandmarkId) {
        let existing: Vec<KeyframeId> = match self.landmarks.get_mut(&lm_id) {
            Some(lm) => {
                let existing = lm.observations.keys().copied().collect();
                lm.observations.insert(kf_id, feature_idx);
                existing
            }
            None => return,
        };

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_landmark(feature_idx, lm_id);
        }

        for other in existing {
            if other == kf_id {
                continue;
            }
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.increment_covisibility(other);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.increment_covisibility(kf_id);
            }
        }
    }

    /// Drop the edge on both sides and decrement covisibility with remaining observers.
    fn unlink(&mut self, kf_id: KeyframeId, lm_id: LandmarkId) -> bool {
        let (feature_idx, others) = match self.landmarks.get_mut(&lm_id) {
            Some(lm) => match lm.observations.remove(&kf_id) {
                Some(idx) => (idx, lm.observations.keys().copied().collect::<Vec<_>>()),
                None => return false,
            },
            None => return false,
        };

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_landmark(feature_idx);
        }

        for other in others {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.decrement_covisibility(other);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.decrement_covisibility(kf_id);
            }
        }
        true
    }

    /// Remove one observation edge, cascading to the landmark below the minimum.
    pub fn remove_observation(&mut self, kf_id: KeyframeId, lm_id: LandmarkId) -> ObservationRemoval {
        if !self.unlink(kf_id, lm_id) {
            return ObservationRemoval::Missing;
        }
        self.bump();

        let remaining = self
            .landmarks
            .get(&lm_id)
            .map(|lm| lm.num_observations())
            .unwrap_or(0);
        if remaining < MIN_OBSERVATIONS {
            self.remove_landmark(lm_id);
            ObservationRemoval::RemovedWithLandmark
        } else {
            ObservationRemoval::Removed
        }
    }

    /// Remove a landmark and all of its edges.
    pub fn remove_landmark(&mut self, lm_id: LandmarkId) -> Option<Landmark> {
        let observers: Vec<KeyframeId> = self.landmarks.get(&lm_id)?.observations.keys().copied().collect();
        for kf_id in observers {
            self.unlink(kf_id, lm_id);
        }
        let lm = self.landmarks.remove(&lm_id);
        self.bump();
        lm
    }

    pub fn update_landmark_position(&mut self, lm_id: LandmarkId, position: Vector3<f64>) -> bool {
        match self.landmarks.get_mut(&lm_id) {
            Some(lm) => {
                lm.position = position;
                self.bump();
                true
            }
            None => false,
        }
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn num_observations(&self) -> usize {
        self.landmarks.values().map(|lm| lm.num_observations()).sum()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// The `n` keyframes sharing the most landmarks with `kf_id`.
    pub fn covisible_keyframes(&self, kf_id: KeyframeId, n: usize) -> Vec<KeyframeId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.best_covisibles(n))
            .unwrap_or_default()
    }

    /// Registered keyframes in registration order.
    pub fn registration_order(&self) -> Vec<KeyframeId> {
        let mut registered: Vec<(u64, KeyframeId)> = self
            .keyframes
            .values()
            .filter_map(|kf| kf.registration_seq.map(|seq| (seq, kf.id)))
            .collect();
        registered.sort();
        registered.into_iter().map(|(_, id)| id).collect()
    }

    /// The `n` most recently registered keyframes, newest first.
    pub fn recent_registered(&self, n: usize) -> Vec<KeyframeId> {
        let mut order = self.registration_order();
        order.reverse();
        order.truncate(n);
        order
    }

    /// Earliest registered keyframe (gauge anchor).
    pub fn first_registered(&self) -> Option<KeyframeId> {
        self.keyframes
            .values()
            .filter_map(|kf| kf.registration_seq.map(|seq| (seq, kf.id)))
            .min()
            .map(|(_, id)| id)
    }

    /// Registered keyframes sorted by source frame index.
    pub fn registered_temporal_order(&self) -> Vec<&KeyframeNode> {
        let mut registered: Vec<&KeyframeNode> =
            self.keyframes.values().filter(|kf| kf.is_registered()).collect();
        registered.sort_by_key(|kf| (kf.frame_index(), kf.id));
        registered
    }

    /// `(feature index, landmark)` pairs of a keyframe.
    pub fn landmarks_observed_by(&self, kf_id: KeyframeId) -> Vec<(usize, LandmarkId)> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.landmark_indices().collect())
            .unwrap_or_default()
    }

    pub fn landmark_for_feature(&self, kf_id: KeyframeId, feature_idx: usize) -> Option<LandmarkId> {
        self.keyframes.get(&kf_id)?.landmark(feature_idx)
    }

    /// Largest baseline angle (radians) between any two observers of a landmark.
    pub fn landmark_parallax(&self, lm_id: LandmarkId) -> f64 {
        let Some(lm) = self.landmarks.get(&lm_id) else {
            return 0.0;
        };
        let centers: Vec<Vector3<f64>> = lm
            .observations
            .keys()
            .filter_map(|kf_id| self.keyframes.get(kf_id).and_then(|kf| kf.camera_center()))
            .collect();
        max_parallax(&lm.position, &centers)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove landmarks with too few observations or too small a baseline angle.
    ///
    /// Returns the number of removed landmarks.
    pub fn prune_landmarks(&mut self, min_observations: usize, min_parallax_rad: f64) -> usize {
        let to_remove: Vec<LandmarkId> = self
            .landmarks
            .values()
            .filter(|lm| {
                lm.num_observations() < min_observations.max(MIN_OBSERVATIONS)
                    || self.landmark_parallax(lm.id) < min_parallax_rad
            })
            .map(|lm| lm.id)
            .collect();

        let count = to_remove.len();
        for lm_id in to_remove {
            self.remove_landmark(lm_id);
        }
        count
    }

    pub fn stats(&self) -> GraphStats {
        let observations = self.num_observations();
        let landmarks = self.landmarks.len();
        GraphStats {
            keyframes: self.keyframes.len(),
            registered: self.num_registered(),
            landmarks,
            observations,
            mean_track_length: if landmarks > 0 {
                observations as f64 / landmarks as f64
            } else {
                0.0
            },
            landmarks_with_3plus: self
                .landmarks
                .values()
                .filter(|lm| lm.num_observations() >= 3)
                .count(),
        }
    }

    /// Check every structural invariant of the store.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let mut shared: HashMap<(KeyframeId, KeyframeId), usize> = HashMap::new();

        for lm in self.landmarks.values() {
            if lm.num_observations() < MIN_OBSERVATIONS {
                return Err(InvariantViolation::UnderObserved {
                    landmark: lm.id,
                    observations: lm.num_observations(),
                });
            }
            for (&kf_id, &feature) in &lm.observations {
                let Some(kf) = self.keyframes.get(&kf_id) else {
                    return Err(InvariantViolation::DanglingObservation {
                        landmark: lm.id,
                        keyframe: kf_id,
                    });
                };
                if !kf.is_registered() {
                    return Err(InvariantViolation::UnregisteredObserver {
                        landmark: lm.id,
                        keyframe: kf_id,
                    });
                }
                if kf.landmark(feature) != Some(lm.id) {
                    return Err(InvariantViolation::MissingBackReference {
                        landmark: lm.id,
                        keyframe: kf_id,
                        feature,
                    });
                }
            }
            let observers = lm.observers();
            for (i, &a) in observers.iter().enumerate() {
                for &b in &observers[i + 1..] {
                    *shared.entry((a, b)).or_insert(0) += 1;
                    *shared.entry((b, a)).or_insert(0) += 1;
                }
            }
        }

        for kf in self.keyframes.values() {
            for (feature, lm_id) in kf.landmark_indices() {
                let Some(lm) = self.landmarks.get(&lm_id) else {
                    return Err(InvariantViolation::DanglingAssociation {
                        keyframe: kf.id,
                        feature,
                        landmark: lm_id,
                    });
                };
                if lm.observations.get(&kf.id) != Some(&feature) {
                    return Err(InvariantViolation::MissingBackReference {
                        landmark: lm_id,
                        keyframe: kf.id,
                        feature,
                    });
                }
            }
            for (&other, &stored) in &kf.covisibility {
                let expected = shared.get(&(kf.id, other)).copied().unwrap_or(0);
                if stored != expected {
                    return Err(InvariantViolation::CovisibilityMismatch {
                        a: kf.id,
                        b: other,
                        stored,
                        expected,
                    });
                }
            }
        }

        for (&(a, b), &expected) in &shared {
            let stored = self.keyframes.get(&a).map(|kf| kf.covisibility_weight(b)).unwrap_or(0);
            if stored != expected {
                return Err(InvariantViolation::CovisibilityMismatch { a, b, stored, expected });
            }
        }

        Ok(())
    }

    /// Panic on any invariant violation.
    pub fn assert_invariants(&self) {
        if let Err(violation) = self.validate() {
            panic!("pose graph invariant violated: {violation}");
        }
    }

    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.landmarks.clear();
        self.bump();
    }
}

impl Default for PoseGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PoseGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoseGraph")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_landmarks", &self.landmarks.len())
            .field("revision", &self.revision)
            .finish()
    }
}
