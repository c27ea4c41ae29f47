//! Incremental registration of keyframes into the pose graph.

pub mod registrator;

pub use registrator::{PendingKeyframe, RegistrationConfig, RegistrationOutcome, Registrator};
