//! Identifier types for the pose graph.

use serde::{Deserialize, Serialize};

/// Identifier of a keyframe inside a [`PoseGraph`](super::PoseGraph).
///
/// Assigned sequentially on insertion and never reused, so ids can be held
/// across mutations as plain handles instead of references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyframeId(pub u64);

impl KeyframeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Identifier of a triangulated landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(KeyframeId::new(7).to_string(), "KF7");
        assert_eq!(LandmarkId::new(123).to_string(), "LM123");
    }

    #[test]
    fn test_ids_order_by_value() {
        let mut ids = vec![KeyframeId::new(3), KeyframeId::new(1), KeyframeId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![KeyframeId::new(1), KeyframeId::new(2), KeyframeId::new(3)]);
    }
}
