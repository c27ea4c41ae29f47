//! Keyframe admission policy.

use serde::{Deserialize, Serialize};

use crate::tracking::motion::Displacement;

/// Keyframe selector parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyframeSelectorConfig {
    /// Mean feature displacement (pixels) that triggers a new keyframe.
    pub min_displacement_px: f64,
    /// Frames after the last keyframe at which one is admitted regardless of motion.
    pub max_frame_gap: usize,
}

impl Default for KeyframeSelectorConfig {
    fn default() -> Self {
        Self {
            min_displacement_px: 30.0,
            max_frame_gap: 15,
        }
    }
}

/// Why a frame was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitReason {
    /// First frame, always admitted.
    Seed,
    /// Displacement exceeded the threshold.
    Motion,
    /// Maximum frame gap reached.
    MaxGap,
}

/// Outcome of [`KeyframeSelector::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeDecision {
    Admit(AdmitReason),
    Skip,
    /// Displacement unavailable and the gap budget not yet spent. Not admitted;
    /// the next candidate needs full re-detection.
    Redetect,
}

impl KeyframeDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, KeyframeDecision::Admit(_))
    }
}

/// Decides which frames become keyframes.
///
/// Based on motion since the last admitted keyframe:
/// - the first frame seeds the pipeline
/// - mean displacement above `min_displacement_px` admits
/// - `max_frame_gap` frames without admission forces one
///
/// The selector never touches the pose graph.
#[derive(Debug, Clone)]
pub struct KeyframeSelector {
    config: KeyframeSelectorConfig,
    /// Frame counter since last keyframe.
    frames_since_kf: usize,
    seeded: bool,
    needs_redetection: bool,
    admitted: usize,
}

impl KeyframeSelector {
    pub fn new(config: KeyframeSelectorConfig) -> Self {
        Self {
            config,
            frames_since_kf: 0,
            seeded: false,
            needs_redetection: false,
            admitted: 0,
        }
    }

    /// Decide on the next frame given its displacement from the last keyframe.
    pub fn decide(&mut self, displacement: &Displacement) -> KeyframeDecision {
        if !self.seeded {
            self.seeded = true;
            return self.admit(AdmitReason::Seed);
        }

        self.frames_since_kf += 1;

        let gap_reached =
            self.config.max_frame_gap > 0 && self.frames_since_kf >= self.config.max_frame_gap;

        match displacement {
            Displacement::Unavailable if gap_reached => self.admit(AdmitReason::MaxGap),
            Displacement::Unavailable => {
                self.needs_redetection = true;
                KeyframeDecision::Redetect
            }
            Displacement::Measured { mean_px, .. } if *mean_px >= self.config.min_displacement_px => {
                self.admit(AdmitReason::Motion)
            }
            Displacement::Measured { .. } if gap_reached => self.admit(AdmitReason::MaxGap),
            Displacement::Measured { .. } => KeyframeDecision::Skip,
        }
    }

    fn admit(&mut self, reason: AdmitReason) -> KeyframeDecision {
        self.frames_since_kf = 0;
        self.needs_redetection = false;
        self.admitted += 1;
        KeyframeDecision::Admit(reason)
    }

    /// Whether the last decision asked for full re-detection.
    pub fn needs_redetection(&self) -> bool {
        self.needs_redetection
    }

    pub fn frames_since_keyframe(&self) -> usize {
        self.frames_since_kf
    }

    /// Number of frames admitted, seed included.
    pub fn admitted(&self) -> usize {
        self.admitted
    }

    pub fn config(&self) -> &KeyframeSelectorConfig {
        &self.config
    }

    /// Forget all history; the next frame is a seed again.
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
        self.seeded = false;
        self.needs_redetection = false;
        self.admitted = 0;
    }
}

impl Default for KeyframeSelector {
    fn default() -> Self {
        Self::new(KeyframeSelectorConfig::default())
    }
}
