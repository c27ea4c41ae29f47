//! Sparse displacement estimate between the last keyframe and the current frame.

use crate::capability::Correspondence;

/// Motion of the current frame relative to the last admitted keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Displacement {
    /// Mean pixel displacement over `tracked` correspondences.
    Measured { mean_px: f64, tracked: usize },
    /// No estimate (tracking lost, or nothing to compare against).
    Unavailable,
}

impl Displacement {
    /// Mean displacement of matched keypoints.
    ///
    /// An empty correspondence list gives [`Displacement::Unavailable`].
    pub fn from_correspondences(correspondences: &[Correspondence]) -> Self {
        if correspondences.is_empty() {
            return Displacement::Unavailable;
        }
        let total: f64 = correspondences
            .iter()
            .map(|c| (c.pixel_b - c.pixel_a).norm())
            .sum();
        Displacement::Measured {
            mean_px: total / correspondences.len() as f64,
            tracked: correspondences.len(),
        }
    }

    pub fn mean_px(&self) -> Option<f64> {
        match self {
            Displacement::Measured { mean_px, .. } => Some(*mean_px),
            Displacement::Unavailable => None,
        }
    }

    pub fn tracked(&self) -> usize {
        match self {
            Displacement::Measured { tracked, .. } => *tracked,
            Displacement::Unavailable => 0,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Displacement::Measured { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    fn corr(a: (f64, f64), b: (f64, f64)) -> Correspondence {
        Correspondence {
            index_a: 0,
            index_b: 0,
            pixel_a: Vector2::new(a.0, a.1),
            pixel_b: Vector2::new(b.0, b.1),
            confidence: 1.0,
        }
    }

    #[test]
    fn test_mean_displacement() {
        let d = Displacement::from_correspondences(&[
            corr((0.0, 0.0), (3.0, 4.0)),
            corr((10.0, 10.0), (10.0, 20.0)),
        ]);
        assert_relative_eq!(d.mean_px().unwrap(), 7.5, epsilon = 1e-12);
        assert_eq!(d.tracked(), 2);
    }

    #[test]
    fn test_no_correspondences_is_unavailable() {
        let d = Displacement::from_correspondences(&[]);
        assert_eq!(d, Displacement::Unavailable);
        assert!(!d.is_available());
        assert_eq!(d.mean_px(), None);
    }
}
