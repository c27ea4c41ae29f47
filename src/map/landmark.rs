//! Landmark: a triangulated 3D point and its observations.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::types::{KeyframeId, LandmarkId};

#[derive(Debug, Clone)]
pub struct Landmark {
    pub id: LandmarkId,

    /// Position in world (store) coordinates.
    pub position: Vector3<f64>,

    /// RGB color sampled from the first observation, if available.
    pub color: Option<[u8; 3]>,

    /// Observing keyframe → feature index in that keyframe.
    pub(super) observations: HashMap<KeyframeId, usize>,

    /// Keyframe that triangulated this landmark.
    pub first_kf: KeyframeId,
}

impl Landmark {
    pub(super) fn new(
        id: LandmarkId,
        position: Vector3<f64>,
        color: Option<[u8; 3]>,
        first_kf: KeyframeId,
    ) -> Self {
        Self {
            id,
            position,
            color,
            observations: HashMap::new(),
            first_kf,
        }
    }

    pub fn observations(&self) -> &HashMap<KeyframeId, usize> {
        &self.observations
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyframeId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// Observing keyframes in id order.
    pub fn observers(&self) -> Vec<KeyframeId> {
        let mut ids: Vec<KeyframeId> = self.observations.keys().copied().collect();
        ids.sort();
        ids
    }
}
