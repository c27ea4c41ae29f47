//! External capabilities consumed by the pipeline.
//!
//! Feature extraction, correspondence search and bundle adjustment are
//! injected as trait objects so they can be swapped without touching the
//! pipeline. Built-in implementations:
//! - [`DescriptorMatcher`] for correspondences (selected by [`MatcherKind`])
//! - [`LmBundleAdjuster`](crate::optimizer::LmBundleAdjuster) for refinement
//! - [`SyntheticScene`](crate::synthetic::SyntheticScene) and
//!   [`Dataset`](crate::io::dataset::Dataset) as frame sources and extractors

pub mod deadline;
pub mod matcher;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::error::{CapabilityError, MatchError, RefineError};
use crate::optimizer::bundle_adjustment::{RefinementProblem, RefinementSolution};
use crate::tracking::{FeatureSet, Frame};

pub use deadline::{match_pair, match_window, run_with_deadline, with_retries, Retryable, WindowMatch};
pub use matcher::{DescriptorMatcher, MatcherKind};

/// A matched keypoint pair between two images.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
    /// Keypoint index in the first feature set.
    pub index_a: usize,
    /// Keypoint index in the second feature set.
    pub index_b: usize,
    pub pixel_a: Vector2<f64>,
    pub pixel_b: Vector2<f64>,
    /// Match confidence in [0, 1].
    pub confidence: f64,
}

/// Finite, random-access sequence of frames.
///
/// Random access makes the sequence restartable from any index.
pub trait FrameSource: Send + Sync {
    fn len(&self) -> usize;

    /// Frame at a position in the sequence, `None` past the end.
    fn frame(&self, position: usize) -> Option<Frame>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keypoint detection and description.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, frame: &Frame) -> Result<FeatureSet, CapabilityError>;
}

/// Matches keypoints between two feature sets.
///
/// An image pair that shares nothing yields [`MatchError::NoCorrespondence`],
/// which callers treat as an empty result rather than a failure.
pub trait CorrespondenceProvider: Send + Sync {
    fn match_features(&self, a: &FeatureSet, b: &FeatureSet) -> Result<Vec<Correspondence>, MatchError>;

    fn name(&self) -> &str {
        "custom"
    }
}

/// Joint refinement of poses and landmarks.
///
/// `should_stop` is polled between iterations; returning true makes the
/// solver give up with [`RefineError::Cancelled`].
pub trait BundleAdjuster: Send + Sync {
    fn refine(
        &self,
        problem: &RefinementProblem,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<RefinementSolution, RefineError>;
}

/// Deadlines, retries and parallelism for capability calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Deadline for one correspondence request.
    pub match_timeout_ms: u64,
    /// Deadline for one bundle-adjustment call.
    pub refine_timeout_ms: u64,
    /// Retries after a transient failure.
    pub max_retries: usize,
    /// Concurrent correspondence requests.
    pub workers: usize,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            match_timeout_ms: 5_000,
            refine_timeout_ms: 60_000,
            max_retries: 2,
            workers: 4,
        }
    }
}

impl CapabilityConfig {
    pub fn match_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.match_timeout_ms)
    }

    pub fn refine_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.refine_timeout_ms)
    }
}
