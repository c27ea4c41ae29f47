//! Frame-side logic: frames and features, motion estimate, keyframe admission
//! and the registration state machine.

pub mod frame;
pub mod keyframe_decision;
pub mod motion;
pub mod state;

pub use frame::{FeatureSet, Frame, ImageRef, Keyframe, Keypoint};
pub use keyframe_decision::{AdmitReason, KeyframeDecision, KeyframeSelector, KeyframeSelectorConfig};
pub use motion::Displacement;
pub use state::{RegistrationTracker, TrackingState};
