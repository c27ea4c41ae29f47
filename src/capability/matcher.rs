//! Brute-force descriptor matching.

use serde::{Deserialize, Serialize};

use crate::error::MatchError;
use crate::tracking::FeatureSet;

use super::{Correspondence, CorrespondenceProvider};

/// Lowe ratio used when none is configured.
pub const NN_RATIO: f32 = 0.8;

/// Matching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatcherKind {
    /// Nearest neighbor with the ratio test (best / second best).
    NearestNeighbor { ratio: f32 },
    /// Keep pairs that are each other's nearest neighbor.
    MutualNearestNeighbor,
}

impl Default for MatcherKind {
    fn default() -> Self {
        MatcherKind::NearestNeighbor { ratio: NN_RATIO }
    }
}

/// L2 descriptor matcher.
#[derive(Debug, Clone)]
pub struct DescriptorMatcher {
    kind: MatcherKind,
    /// Max descriptor distance for acceptance.
    max_distance: f32,
}

impl DescriptorMatcher {
    pub fn new(kind: MatcherKind, max_distance: f32) -> Self {
        Self { kind, max_distance }
    }

    pub fn kind(&self) -> MatcherKind {
        self.kind
    }

    /// For every descriptor in `a`, the two closest in `b`: (best idx, best dist, second dist).
    fn nearest_two(a: &FeatureSet, b: &FeatureSet) -> Vec<Option<(usize, f32, f32)>> {
        a.keypoints
            .iter()
            .map(|ka| {
                let mut best: Option<(usize, f32)> = None;
                let mut second = f32::INFINITY;
                for (j, kb) in b.keypoints.iter().enumerate() {
                    let d = descriptor_distance(&ka.descriptor, &kb.descriptor);
                    match best {
                        Some((_, bd)) if d >= bd => second = second.min(d),
                        Some((_, bd)) => {
                            second = bd;
                            best = Some((j, d));
                        }
                        None => best = Some((j, d)),
                    }
                }
                best.map(|(j, d)| (j, d, second))
            })
            .collect()
    }

    fn correspondence(&self, a: &FeatureSet, b: &FeatureSet, i: usize, j: usize, dist: f32) -> Correspondence {
        let confidence = if self.max_distance > 0.0 {
            (1.0 - dist / self.max_distance).clamp(0.0, 1.0) as f64
        } else {
            1.0
        };
        Correspondence {
            index_a: i,
            index_b: j,
            pixel_a: a.keypoints[i].pixel,
            pixel_b: b.keypoints[j].pixel,
            confidence,
        }
    }
}

impl Default for DescriptorMatcher {
    fn default() -> Self {
        Self::new(MatcherKind::default(), 0.7)
    }
}

/// Euclidean distance between two float descriptors.
///
/// Descriptors of different length compare over their common prefix.
pub fn descriptor_distance(d1: &[f32], d2: &[f32]) -> f32 {
    d1.iter()
        .zip(d2)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

impl CorrespondenceProvider for DescriptorMatcher {
    fn match_features(&self, a: &FeatureSet, b: &FeatureSet) -> Result<Vec<Correspondence>, MatchError> {
        if a.is_empty() || b.is_empty() {
            return Err(MatchError::NoCorrespondence);
        }

        let forward = Self::nearest_two(a, b);
        let mut candidates: Vec<(usize, usize, f32)> = Vec::new();

        match self.kind {
            MatcherKind::NearestNeighbor { ratio } => {
                for (i, nn) in forward.iter().enumerate() {
                    let Some((j, best, second)) = *nn else { continue };
                    if best <= self.max_distance && best < ratio * second {
                        candidates.push((i, j, best));
                    }
                }
                // One match per target keypoint: keep the closest.
                candidates.sort_by(|x, y| x.2.total_cmp(&y.2));
                let mut taken = vec![false; b.len()];
                candidates.retain(|&(_, j, _)| !std::mem::replace(&mut taken[j], true));
            }
            MatcherKind::MutualNearestNeighbor => {
                let backward = Self::nearest_two(b, a);
                for (i, nn) in forward.iter().enumerate() {
                    let Some((j, best, _)) = *nn else { continue };
                    let mutual = matches!(backward[j], Some((back, _, _)) if back == i);
                    if mutual && best <= self.max_distance {
                        candidates.push((i, j, best));
                    }
                }
            }
        }

        if candidates.is_empty() {
            return Err(MatchError::NoCorrespondence);
        }

        candidates.sort_by_key(|&(i, _, _)| i);
        Ok(candidates
            .into_iter()
            .map(|(i, j, d)| self.correspondence(a, b, i, j, d))
            .collect())
    }

    fn name(&self) -> &str {
        match self.kind {
            MatcherKind::NearestNeighbor { .. } => "nearest-neighbor",
            MatcherKind::MutualNearestNeighbor => "mutual-nearest-neighbor",
        }
    }
}
