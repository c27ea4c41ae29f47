//! Camera intrinsics with a closed set of lens distortion models.
//!
//! All geometry in the pipeline runs on undistorted normalized image
//! coordinates; pixels are converted once, at the boundary, with
//! [`Intrinsics::pixel_to_normalized`].

use nalgebra::{Matrix3, Unit, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Fixed-point iterations used to invert the distortion function.
const UNDISTORT_ITERATIONS: usize = 20;

/// Minimum depth for a point to be considered in front of the camera.
pub const MIN_DEPTH: f64 = 1e-6;

/// Lens distortion model, applied to normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum DistortionModel {
    /// Ideal pinhole, no distortion.
    Pinhole,
    /// One radial coefficient.
    SimpleRadial { k: f64 },
    /// Two radial coefficients.
    Radial { k1: f64, k2: f64 },
    /// Brown-Conrady: three radial and two tangential coefficients.
    Full {
        k1: f64,
        k2: f64,
        p1: f64,
        p2: f64,
        k3: f64,
    },
}

impl DistortionModel {
    pub fn name(&self) -> &'static str {
        match self {
            DistortionModel::Pinhole => "pinhole",
            DistortionModel::SimpleRadial { .. } => "simple_radial",
            DistortionModel::Radial { .. } => "radial",
            DistortionModel::Full { .. } => "full",
        }
    }

    /// Apply distortion to an undistorted normalized point.
    pub fn distort(&self, p: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        match *self {
            DistortionModel::Pinhole => *p,
            DistortionModel::SimpleRadial { k } => p * (1.0 + k * r2),
            DistortionModel::Radial { k1, k2 } => p * (1.0 + k1 * r2 + k2 * r2 * r2),
            DistortionModel::Full { k1, k2, p1, p2, k3 } => {
                let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
                Vector2::new(
                    x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
                    y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
                )
            }
        }
    }

    /// Invert [`distort`](Self::distort) by fixed-point iteration.
    pub fn undistort(&self, distorted: &Vector2<f64>) -> Vector2<f64> {
        if matches!(self, DistortionModel::Pinhole) {
            return *distorted;
        }

        let mut p = *distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            let (x, y) = (p.x, p.y);
            let r2 = x * x + y * y;
            let (radial, tangential) = match *self {
                DistortionModel::Pinhole => (1.0, Vector2::zeros()),
                DistortionModel::SimpleRadial { k } => (1.0 + k * r2, Vector2::zeros()),
                DistortionModel::Radial { k1, k2 } => (1.0 + k1 * r2 + k2 * r2 * r2, Vector2::zeros()),
                DistortionModel::Full { k1, k2, p1, p2, k3 } => (
                    1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2,
                    Vector2::new(
                        2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
                        p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
                    ),
                ),
            };
            if radial.abs() < 1e-12 {
                break;
            }
            p = (distorted - tangential) / radial;
        }
        p
    }
}

impl Default for DistortionModel {
    fn default() -> Self {
        DistortionModel::Pinhole
    }
}

/// Camera intrinsics record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub distortion: DistortionModel,
}

impl Intrinsics {
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: DistortionModel::Pinhole,
        }
    }

    /// Guess intrinsics from image size: focal length 1.2x the larger side,
    /// principal point at the image center.
    pub fn from_image_size(width: u32, height: u32) -> Self {
        let f = 1.2 * width.max(height) as f64;
        Self::pinhole(f, f, width as f64 / 2.0, height as f64 / 2.0)
    }

    pub fn with_distortion(mut self, distortion: DistortionModel) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Pixel to undistorted normalized coordinates.
    pub fn pixel_to_normalized(&self, uv: &Vector2<f64>) -> Vector2<f64> {
        let distorted = Vector2::new((uv.x - self.cx) / self.fx, (uv.y - self.cy) / self.fy);
        self.distortion.undistort(&distorted)
    }

    /// Undistorted normalized coordinates to pixel.
    pub fn normalized_to_pixel(&self, xn: &Vector2<f64>) -> Vector2<f64> {
        let d = self.distortion.distort(xn);
        Vector2::new(self.fx * d.x + self.cx, self.fy * d.y + self.cy)
    }

    /// Project a camera-frame point to pixels. `None` behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        Some(self.normalized_to_pixel(&Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z)))
    }

    /// Unit bearing vector in the camera frame for a pixel.
    pub fn bearing(&self, uv: &Vector2<f64>) -> Unit<Vector3<f64>> {
        let xn = self.pixel_to_normalized(uv);
        Unit::new_normalize(Vector3::new(xn.x, xn.y, 1.0))
    }

    /// Mean focal length, used to express normalized errors in pixels.
    pub fn mean_focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pinhole_projection() {
        let cam = Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0);
        let uv = cam.project(&Vector3::new(0.2, -0.1, 2.0)).unwrap();
        assert_relative_eq!(uv, Vector2::new(370.0, 215.0), epsilon = 1e-10);
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_undistort_inverts_distort_for_every_model() {
        let models = [
            DistortionModel::Pinhole,
            DistortionModel::SimpleRadial { k: -0.12 },
            DistortionModel::Radial { k1: -0.2, k2: 0.05 },
            DistortionModel::Full {
                k1: -0.25,
                k2: 0.07,
                p1: 1e-3,
                p2: -5e-4,
                k3: 0.0,
            },
        ];
        let p = Vector2::new(0.21, -0.14);
        for model in models {
            let back = model.undistort(&model.distort(&p));
            assert_relative_eq!(back, p, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_pixel_normalized_roundtrip() {
        let cam = Intrinsics::pinhole(600.0, 610.0, 300.0, 200.0)
            .with_distortion(DistortionModel::Radial { k1: -0.1, k2: 0.01 });
        let uv = Vector2::new(412.5, 88.0);
        let back = cam.normalized_to_pixel(&cam.pixel_to_normalized(&uv));
        assert_relative_eq!(back, uv, epsilon = 1e-6);
    }

    #[test]
    fn test_distortion_yaml_tagging() {
        let yaml = "fx: 500.0\nfy: 500.0\ncx: 320.0\ncy: 240.0\ndistortion:\n  model: simple_radial\n  k: -0.05\n";
        let cam: Intrinsics = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cam.distortion, DistortionModel::SimpleRadial { k: -0.05 });
        assert_eq!(cam.distortion.name(), "simple_radial");
    }
}
