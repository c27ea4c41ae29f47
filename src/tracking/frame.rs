//! Frame-level data: input frames, extracted features, promoted keyframes.

use std::sync::Arc;

use nalgebra::Vector2;

use crate::geometry::Intrinsics;
use crate::tracking::motion::Displacement;

/// Opaque reference to an image owned by the frame source (a path or URI).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef(pub String);

impl ImageRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An input frame. Immutable once created by the frame source.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic position in the input sequence.
    pub index: u64,
    /// Capture time in seconds.
    pub timestamp: f64,
    pub image: ImageRef,
    /// Per-frame intrinsics, when the source knows them.
    pub intrinsics: Option<Intrinsics>,
}

impl Frame {
    pub fn new(index: u64, timestamp: f64, image: ImageRef) -> Self {
        Self {
            index,
            timestamp,
            image,
            intrinsics: None,
        }
    }

    pub fn with_intrinsics(mut self, intrinsics: Intrinsics) -> Self {
        self.intrinsics = Some(intrinsics);
        self
    }
}

/// A detected keypoint with its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoint {
    /// Pixel position (distorted, as detected).
    pub pixel: Vector2<f64>,
    /// Float descriptor compared by L2 distance.
    pub descriptor: Vec<f32>,
    /// Image color at the keypoint, if the extractor sampled it.
    pub color: Option<[u8; 3]>,
}

impl Keypoint {
    pub fn new(pixel: Vector2<f64>, descriptor: Vec<f32>) -> Self {
        Self {
            pixel,
            descriptor,
            color: None,
        }
    }
}

/// Keypoints extracted from one frame. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<Keypoint>) -> Self {
        Self { keypoints }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn pixel(&self, idx: usize) -> Option<Vector2<f64>> {
        self.keypoints.get(idx).map(|kp| kp.pixel)
    }

    pub fn color(&self, idx: usize) -> Option<[u8; 3]> {
        self.keypoints.get(idx).and_then(|kp| kp.color)
    }
}

/// A frame promoted by the keyframe selector.
///
/// Holds the extracted features and the motion estimate relative to the
/// previous keyframe. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct Keyframe {
    pub frame: Frame,
    pub features: Arc<FeatureSet>,
    pub motion: Displacement,
}

impl Keyframe {
    pub fn new(frame: Frame, features: Arc<FeatureSet>, motion: Displacement) -> Self {
        Self {
            frame,
            features,
            motion,
        }
    }

    pub fn index(&self) -> u64 {
        self.frame.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_set_accessors() {
        let mut kp = Keypoint::new(Vector2::new(10.0, 20.0), vec![0.5; 4]);
        kp.color = Some([255, 0, 0]);
        let features = FeatureSet::new(vec![kp, Keypoint::new(Vector2::new(1.0, 2.0), vec![0.0; 4])]);

        assert_eq!(features.len(), 2);
        assert_eq!(features.pixel(0), Some(Vector2::new(10.0, 20.0)));
        assert_eq!(features.color(0), Some([255, 0, 0]));
        assert_eq!(features.color(1), None);
        assert_eq!(features.pixel(5), None);
    }

    #[test]
    fn test_image_ref_display() {
        let frame = Frame::new(3, 0.1, ImageRef::new("frame_000003.png"));
        assert_eq!(frame.image.to_string(), "frame_000003.png");
        assert!(frame.intrinsics.is_none());
    }
}
