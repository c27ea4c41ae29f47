//! Model-agnostic RANSAC loop shared by the two-view and PnP solvers.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::GeometryError;

/// RANSAC parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    /// Hard cap on hypotheses.
    pub max_iterations: usize,
    /// Inlier threshold in pixels.
    pub threshold_px: f64,
    /// Confidence used for adaptive termination.
    pub confidence: f64,
    /// Seed for reproducible sampling.
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            threshold_px: 2.0,
            confidence: 0.999,
            seed: 0x5f3d_2c11,
        }
    }
}

/// A model that can be hypothesized from a minimal sample of its data.
pub trait Estimator {
    type Model: Clone;

    /// Minimal sample size.
    const MIN_SAMPLES: usize;

    fn num_data(&self) -> usize;

    /// Fit from a sample of data indices. `None` for degenerate samples.
    fn fit(&self, sample: &[usize]) -> Option<Self::Model>;

    /// Non-negative residual of one datum, in the units of the threshold.
    fn residual(&self, model: &Self::Model, index: usize) -> f64;

    /// Least-squares refit on a consensus set.
    fn refit(&self, _inliers: &[usize]) -> Option<Self::Model> {
        None
    }
}

/// Best consensus found by [`ransac`].
#[derive(Debug, Clone)]
pub struct RansacOutcome<M> {
    pub model: M,
    pub inliers: Vec<usize>,
    pub iterations: usize,
}

/// Iterations needed to draw one all-inlier sample with the given confidence.
fn required_iterations(confidence: f64, inlier_ratio: f64, min_samples: usize, cap: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return cap;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return 1;
    }
    let n = ((1.0 - confidence).ln() / denom).ceil();
    if n.is_finite() {
        (n as usize).clamp(1, cap)
    } else {
        cap
    }
}

fn consensus<E: Estimator>(estimator: &E, model: &E::Model, threshold: f64) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut cost = 0.0;
    for i in 0..estimator.num_data() {
        let r = estimator.residual(model, i);
        if r <= threshold {
            inliers.push(i);
            cost += r;
        } else {
            cost += threshold;
        }
    }
    (inliers, cost)
}

/// Run RANSAC; the winning model is refit on its inliers when the estimator supports it.
pub fn ransac<E: Estimator>(
    estimator: &E,
    config: &RansacConfig,
    threshold: f64,
    min_inliers: usize,
) -> Result<RansacOutcome<E::Model>, GeometryError> {
    let n = estimator.num_data();
    if n < E::MIN_SAMPLES {
        return Err(GeometryError::NotEnoughPoints {
            needed: E::MIN_SAMPLES,
            got: n,
        });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let indices: Vec<usize> = (0..n).collect();

    let mut best: Option<(E::Model, Vec<usize>, f64)> = None;
    let mut max_iterations = config.max_iterations.max(1);
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;
        let sample: Vec<usize> = indices
            .choose_multiple(&mut rng, E::MIN_SAMPLES)
            .copied()
            .collect();

        let Some(model) = estimator.fit(&sample) else {
            continue;
        };
        let (inliers, cost) = consensus(estimator, &model, threshold);

        let better = match &best {
            None => true,
            Some((_, best_inliers, best_cost)) => {
                inliers.len() > best_inliers.len()
                    || (inliers.len() == best_inliers.len() && cost < *best_cost)
            }
        };
        if better {
            let ratio = inliers.len() as f64 / n as f64;
            max_iterations = max_iterations.min(required_iterations(
                config.confidence,
                ratio,
                E::MIN_SAMPLES,
                config.max_iterations.max(1),
            ));
            best = Some((model, inliers, cost));
        }
    }

    let Some((mut model, mut inliers, _)) = best else {
        return Err(GeometryError::RansacFailed { inliers: 0 });
    };

    if let Some(refit) = estimator.refit(&inliers) {
        let (refit_inliers, _) = consensus(estimator, &refit, threshold);
        if refit_inliers.len() >= inliers.len() {
            model = refit;
            inliers = refit_inliers;
        }
    }

    if inliers.len() < min_inliers.max(E::MIN_SAMPLES) {
        return Err(GeometryError::RansacFailed {
            inliers: inliers.len(),
        });
    }

    Ok(RansacOutcome {
        model,
        inliers,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fits y = a*x + b.
    struct LineEstimator {
        points: Vec<(f64, f64)>,
    }

    impl Estimator for LineEstimator {
        type Model = (f64, f64);
        const MIN_SAMPLES: usize = 2;

        fn num_data(&self) -> usize {
            self.points.len()
        }

        fn fit(&self, sample: &[usize]) -> Option<(f64, f64)> {
            let (x0, y0) = self.points[sample[0]];
            let (x1, y1) = self.points[sample[1]];
            if (x1 - x0).abs() < 1e-12 {
                return None;
            }
            let a = (y1 - y0) / (x1 - x0);
            Some((a, y0 - a * x0))
        }

        fn residual(&self, model: &(f64, f64), index: usize) -> f64 {
            let (x, y) = self.points[index];
            (model.0 * x + model.1 - y).abs()
        }
    }

    #[test]
    fn test_ransac_ignores_outliers() {
        let mut points: Vec<(f64, f64)> = (0..30).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        points.extend([(3.0, 40.0), (7.0, -20.0), (12.0, 3.0), (20.0, 100.0)]);
        let estimator = LineEstimator { points };

        let outcome = ransac(&estimator, &RansacConfig::default(), 1e-6, 10).unwrap();
        assert_eq!(outcome.inliers.len(), 30);
        assert!((outcome.model.0 - 2.0).abs() < 1e-9);
        assert!((outcome.model.1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ransac_reports_missing_consensus() {
        let estimator = LineEstimator {
            points: vec![(0.0, 0.0)],
        };
        let err = ransac(&estimator, &RansacConfig::default(), 1.0, 1).unwrap_err();
        assert_eq!(err, GeometryError::NotEnoughPoints { needed: 2, got: 1 });
    }

    #[test]
    fn test_required_iterations_shrinks_with_inlier_ratio() {
        let high = required_iterations(0.99, 0.9, 8, 1000);
        let low = required_iterations(0.99, 0.3, 8, 1000);
        assert!(high < low);
        assert_eq!(required_iterations(0.99, 0.0, 8, 1000), 1000);
    }
}
