//! Pipeline configuration, loaded from YAML.
//!
//! Every section is optional; missing sections and fields take their
//! defaults.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityConfig, DescriptorMatcher, MatcherKind};
use crate::geometry::Intrinsics;
use crate::mapping::RegistrationConfig;
use crate::optimizer::RefinementConfig;
use crate::tracking::KeyframeSelectorConfig;

/// Built-in matcher selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    #[serde(flatten)]
    pub kind: MatcherKind,
    /// Descriptor distance above which a match is rejected.
    pub max_descriptor_distance: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            kind: MatcherKind::default(),
            max_descriptor_distance: 0.7,
        }
    }
}

impl MatcherConfig {
    pub fn build(&self) -> DescriptorMatcher {
        DescriptorMatcher::new(self.kind, self.max_descriptor_distance)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub selector: KeyframeSelectorConfig,
    pub registration: RegistrationConfig,
    pub refinement: RefinementConfig,
    pub capability: CapabilityConfig,
    pub matcher: MatcherConfig,
    /// Used for frames that carry no intrinsics of their own.
    pub default_intrinsics: Intrinsics,
    /// Keep every N-th frame of the input.
    pub frame_skip: usize,
    /// Stop after this many frames (after skipping).
    pub max_frames: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            selector: KeyframeSelectorConfig::default(),
            registration: RegistrationConfig::default(),
            refinement: RefinementConfig::default(),
            capability: CapabilityConfig::default(),
            matcher: MatcherConfig::default(),
            default_intrinsics: Intrinsics::from_image_size(640, 480),
            frame_skip: 1,
            max_frames: None,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open config {:?}", path))?;
        let config: Self =
            serde_yaml::from_reader(file).with_context(|| format!("Failed to parse config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Write the effective configuration next to the outputs.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        serde_yaml::to_writer(file, self).with_context(|| format!("Failed to write config {:?}", path))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let reg = &self.registration;
        if reg.window_recent == 0 {
            bail!("registration.window_recent must be at least 1");
        }
        if reg.min_inliers < 6 {
            bail!("registration.min_inliers must be at least 6, got {}", reg.min_inliers);
        }
        if reg.min_correspondences < 8 {
            bail!(
                "registration.min_correspondences must be at least 8, got {}",
                reg.min_correspondences
            );
        }
        if reg.max_consecutive_failures == 0 {
            bail!("registration.max_consecutive_failures must be at least 1");
        }
        if reg.ransac.threshold_px <= 0.0 || reg.ransac.max_iterations == 0 {
            bail!("registration.ransac needs a positive threshold and iteration count");
        }
        if !(0.0..1.0).contains(&reg.ransac.confidence) {
            bail!("registration.ransac.confidence must be in [0, 1), got {}", reg.ransac.confidence);
        }
        if reg.triangulation.min_parallax_deg <= 0.0 || reg.triangulation.max_reprojection_px <= 0.0 {
            bail!("registration.triangulation thresholds must be positive");
        }

        let refine = &self.refinement;
        if refine.local_window < 2 {
            bail!("refinement.local_window must be at least 2, got {}", refine.local_window);
        }
        if refine.outlier_threshold_px <= 0.0 || refine.huber_px <= 0.0 {
            bail!("refinement thresholds must be positive");
        }

        if self.selector.min_displacement_px <= 0.0 {
            bail!("selector.min_displacement_px must be positive");
        }
        if let MatcherKind::NearestNeighbor { ratio } = self.matcher.kind {
            if !(ratio > 0.0 && ratio <= 1.0) {
                bail!("matcher.ratio must be in (0, 1], got {}", ratio);
            }
        }
        if self.matcher.max_descriptor_distance <= 0.0 {
            bail!("matcher.max_descriptor_distance must be positive");
        }
        if self.capability.workers == 0 {
            bail!("capability.workers must be at least 1");
        }
        if self.capability.match_timeout_ms == 0 || self.capability.refine_timeout_ms == 0 {
            bail!("capability timeouts must be positive");
        }
        if self.default_intrinsics.fx <= 0.0 || self.default_intrinsics.fy <= 0.0 {
            bail!("default_intrinsics focal lengths must be positive");
        }
        if self.frame_skip == 0 {
            bail!("frame_skip must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.registration.window_recent, 5);
        assert_eq!(config.registration.window_covisible, 5);
        assert_eq!(config.refinement.global_every, 5);
        assert_eq!(config.selector.min_displacement_px, 30.0);
    }

    #[test]
    fn test_partial_yaml_falls_back_to_defaults() {
        let yaml = "
registration:
  window_recent: 3
  triangulation:
    min_parallax_deg: 2.0
matcher:
  kind: mutual_nearest_neighbor
  max_descriptor_distance: 0.4
max_frames: 100
";
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.registration.window_recent, 3);
        assert_eq!(config.registration.window_covisible, 5);
        assert_eq!(config.registration.triangulation.min_parallax_deg, 2.0);
        assert_eq!(config.registration.triangulation.max_reprojection_px, 4.0);
        assert_eq!(config.matcher.kind, MatcherKind::MutualNearestNeighbor);
        assert_eq!(config.matcher.max_descriptor_distance, 0.4);
        assert_eq!(config.max_frames, Some(100));
        assert_eq!(config.frame_skip, 1);
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let err = PipelineConfig::from_yaml_str("registration:\n  window_recent: 0\n").unwrap_err();
        assert!(err.to_string().contains("window_recent"));
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let mut config = PipelineConfig::default();
        config.matcher.kind = MatcherKind::NearestNeighbor { ratio: 1.5 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "refinement:\n  global_every: 3\nframe_skip: 2").unwrap();
        drop(file);

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.refinement.global_every, 3);
        assert_eq!(config.frame_skip, 2);

        let saved = dir.path().join("effective.yaml");
        config.save(&saved).unwrap();
        let reloaded = PipelineConfig::load(&saved).unwrap();
        assert_eq!(reloaded.refinement.global_every, 3);
        assert_eq!(reloaded.matcher.kind, config.matcher.kind);
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = PipelineConfig::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to open config"));
    }
}
