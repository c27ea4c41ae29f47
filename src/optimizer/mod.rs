//! Bundle adjustment and its scheduling.
//!
//! - [`bundle_adjustment`]: refinement snapshot types and the built-in
//!   Schur-complement Levenberg-Marquardt solver
//! - [`scheduler`]: local/global cadence, stale-result policy and
//!   post-refinement outlier removal

pub mod bundle_adjustment;
pub mod scheduler;

pub use bundle_adjustment::{
    LmBundleAdjuster, LmConfig, ProblemCamera, ProblemObservation, ProblemPoint, RefinementProblem,
    RefinementScope, RefinementSolution,
};
pub use scheduler::{ApplyOutcome, RefinementConfig, RefinementScheduler, RefinementStats};
