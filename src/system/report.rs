//! Terminal status and counters of a pipeline run.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::map::GraphStats;
use crate::optimizer::RefinementStats;

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// Consecutive registration failures reached the limit.
    TrackingLost,
    /// No two-view initialization succeeded.
    BootstrapFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TrackingLost => f.write_str("tracking lost"),
            FailureReason::BootstrapFailed => f.write_str("bootstrap failed"),
        }
    }
}

/// How a run ended. Every run ends with exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStatus {
    /// Every admitted keyframe was registered.
    Success { registered: usize },
    /// Some keyframes stayed unregistered.
    Partial { registered: usize, total_keyframes: usize },
    Failure(FailureReason),
    /// The source produced no frames.
    InsufficientData,
    /// Only the seed keyframe was admitted.
    InsufficientMotion,
}

impl PipelineStatus {
    /// A reconstruction exists (full or partial).
    pub fn has_reconstruction(&self) -> bool {
        matches!(self, PipelineStatus::Success { .. } | PipelineStatus::Partial { .. })
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Success { registered } => write!(f, "success ({registered} keyframes registered)"),
            PipelineStatus::Partial {
                registered,
                total_keyframes,
            } => write!(f, "partial success ({registered}/{total_keyframes} keyframes registered)"),
            PipelineStatus::Failure(reason) => write!(f, "failure: {reason}"),
            PipelineStatus::InsufficientData => f.write_str("insufficient data: no frames"),
            PipelineStatus::InsufficientMotion => f.write_str("insufficient motion: only the seed frame was admitted"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineCounters {
    pub frames_seen: usize,
    pub frames_skipped: usize,
    pub redetections: usize,
    pub extraction_failures: usize,
    pub keyframes_admitted: usize,
    pub bootstrap_attempts: usize,
    pub registration_failures: usize,
    /// Registrations that succeeded on a retry.
    pub recovered_by_retry: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub status: PipelineStatus,
    pub counters: PipelineCounters,
    pub registered: usize,
    pub landmarks: usize,
    pub observations: usize,
    pub landmarks_with_3plus: usize,
    pub refinement: RefinementStats,
    pub elapsed: Duration,
}

impl PipelineReport {
    pub fn new(
        status: PipelineStatus,
        counters: PipelineCounters,
        graph: &GraphStats,
        refinement: RefinementStats,
        elapsed: Duration,
    ) -> Self {
        Self {
            status,
            counters,
            registered: graph.registered,
            landmarks: graph.landmarks,
            observations: graph.observations,
            landmarks_with_3plus: graph.landmarks_with_3plus,
            refinement,
            elapsed,
        }
    }

    /// Registered keyframes over admitted keyframes, in [0, 1].
    pub fn success_rate(&self) -> f64 {
        if self.counters.keyframes_admitted == 0 {
            0.0
        } else {
            self.registered as f64 / self.counters.keyframes_admitted as f64
        }
    }

    /// Final summary at `info` (`warn` when nothing was reconstructed).
    pub fn log_summary(&self) {
        if self.status.has_reconstruction() {
            info!("[Pipeline] {}", self.status);
        } else {
            warn!("[Pipeline] {}", self.status);
        }
        info!(
            "[Pipeline] frames: {} seen, {} skipped, {} redetect, {} extraction failures",
            self.counters.frames_seen,
            self.counters.frames_skipped,
            self.counters.redetections,
            self.counters.extraction_failures
        );
        info!(
            "[Pipeline] keyframes: {} admitted, {} registered ({:.1}%), {} failures, {} recovered by retry",
            self.counters.keyframes_admitted,
            self.registered,
            100.0 * self.success_rate(),
            self.counters.registration_failures,
            self.counters.recovered_by_retry
        );
        info!(
            "[Pipeline] map: {} landmarks ({} seen 3+ times), {} observations",
            self.landmarks, self.landmarks_with_3plus, self.observations
        );
        info!(
            "[Pipeline] refinement: {} local, {} global, {} stale, {} failed, {} outliers removed",
            self.refinement.local_applied,
            self.refinement.global_applied,
            self.refinement.stale_discarded,
            self.refinement.failed,
            self.refinement.outliers_removed
        );
        info!("[Pipeline] elapsed {:.2?}", self.elapsed);
    }
}
