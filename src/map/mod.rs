//! Pose-graph store: keyframes, landmarks and the observation edges between them.
//!
//! The graph is bipartite:
//! - keyframes reference landmarks per feature (`KeyframeNode::landmark`)
//! - landmarks track their observers (`Landmark::observations`)
//!
//! Keyframes additionally carry covisibility weights (number of shared
//! landmarks), used to pick the registration window and the local
//! refinement neighborhood.

pub mod keyframe;
pub mod landmark;
pub mod pose_graph;
pub mod types;

pub use keyframe::{CameraPose, KeyframeNode};
pub use landmark::Landmark;
pub use pose_graph::{GraphStats, InvariantViolation, ObservationRemoval, PoseGraph, MIN_OBSERVATIONS};
pub use types::{KeyframeId, LandmarkId};
