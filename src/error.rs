//! Typed errors for every pipeline stage.
//!
//! Capability and geometric failures are recoverable and carry enough detail
//! to report which stage failed and why. Invariant violations of the pose
//! graph are not represented here: they panic (see `map::InvariantViolation`).

use std::time::Duration;

use thiserror::Error;

/// Failure of an external capability call (transient, retryable).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("capability call exceeded its deadline of {0:?}")]
    Timeout(Duration),
    #[error("capability worker disconnected")]
    Disconnected,
}

impl CapabilityError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Unavailable(_) | CapabilityError::Timeout(_))
    }
}

/// Result of a correspondence request that produced no matches.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// The images share nothing. A valid, empty answer.
    #[error("no correspondence between images")]
    NoCorrespondence,
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Non-fatal bundle-adjustment failures. The store keeps its previous values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RefineError {
    #[error("bundle adjustment did not converge after {iterations} iterations")]
    DidNotConverge { iterations: usize },
    #[error("bundle adjustment problem is ill-conditioned: {0}")]
    IllConditioned(String),
    #[error("bundle adjustment was cancelled")]
    Cancelled,
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Failures of the low-level geometric solvers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("need at least {needed} correspondences, got {got}")]
    NotEnoughPoints { needed: usize, got: usize },
    #[error("degenerate configuration: {0}")]
    Degenerate(&'static str),
    #[error("svd failed in {0}")]
    SvdFailed(&'static str),
    #[error("ransac found no consensus model (best had {inliers} inliers)")]
    RansacFailed { inliers: usize },
}

/// Registration stage that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStage {
    Matching,
    TwoView,
    PoseEstimation,
    Triangulation,
}

impl std::fmt::Display for RegistrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegistrationStage::Matching => "matching",
            RegistrationStage::TwoView => "two-view",
            RegistrationStage::PoseEstimation => "pose estimation",
            RegistrationStage::Triangulation => "triangulation",
        };
        f.write_str(name)
    }
}

/// Why a keyframe could not be registered. Never fatal on its own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("{stage}: found {found} correspondences, need {required}")]
    InsufficientCorrespondences {
        stage: RegistrationStage,
        found: usize,
        required: usize,
    },
    #[error("pose estimation: {inliers} inliers, need {required}")]
    InsufficientInliers { inliers: usize, required: usize },
    #[error("two-view: {0}")]
    DegenerateTwoView(GeometryError),
    #[error("pose estimation: {0}")]
    PoseSolver(GeometryError),
    #[error("triangulation: {triangulated} landmarks accepted, need {required}")]
    InsufficientTriangulation { triangulated: usize, required: usize },
    #[error("matching: {0}")]
    Capability(#[from] CapabilityError),
}

impl RegistrationError {
    pub fn stage(&self) -> RegistrationStage {
        match self {
            RegistrationError::InsufficientCorrespondences { stage, .. } => *stage,
            RegistrationError::InsufficientInliers { .. } | RegistrationError::PoseSolver(_) => {
                RegistrationStage::PoseEstimation
            }
            RegistrationError::DegenerateTwoView(_) => RegistrationStage::TwoView,
            RegistrationError::InsufficientTriangulation { .. } => RegistrationStage::Triangulation,
            RegistrationError::Capability(_) => RegistrationStage::Matching,
        }
    }
}

/// Scale calibration failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("underdetermined calibration: need at least 3 correspondences, got {got}")]
    Underdetermined { got: usize },
    #[error("underdetermined calibration: control points are collinear")]
    Collinear,
    #[error("control point references unknown {0}")]
    UnknownTarget(String),
    #[error("degenerate calibration: {0}")]
    Degenerate(&'static str),
}

impl CalibrationError {
    /// Too few or collinear correspondences to fix a similarity.
    pub fn is_underdetermined(&self) -> bool {
        matches!(
            self,
            CalibrationError::Underdetermined { .. } | CalibrationError::Collinear
        )
    }
}
