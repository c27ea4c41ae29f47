//! Sim3: 7-DOF similarity transformation (rotation + translation + uniform scale).
//!
//! A monocular reconstruction is only defined up to a similarity, so the
//! store-to-metric mapping produced by scale calibration is a `Sim3`.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

use super::SE3;

/// Similarity transformation, applied as p' = s * R * p + t.
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from rotation matrix, translation, and scale.
    ///
    /// `rotation` must already be orthonormal with determinant +1.
    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    /// Pure scaling about the origin.
    pub fn from_scale(scale: f64) -> Self {
        Self {
            scale,
            ..Self::identity()
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Homogeneous form [s*R | t; 0 0 0 1].
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(self.rotation_matrix() * self.scale));
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// S^{-1} = [(1/s) R^T | -(1/s) R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// Compose: (self ∘ other)(p) = self(other(p)).
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Map a camera-to-world pose into the target frame.
    ///
    /// The camera center is transformed as a point and the orientation is
    /// rotated; scale does not affect orientation.
    pub fn transform_pose(&self, pose_wc: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * pose_wc.rotation,
            translation: self.transform_point(&pose_wc.translation),
        }
    }

    /// True when the transform is numerically the identity.
    pub fn is_identity(&self, tolerance: f64) -> bool {
        (self.scale - 1.0).abs() < tolerance
            && self.translation.norm() < tolerance
            && self.rotation.angle() < tolerance
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Unit;

    fn sample() -> Sim3 {
        Sim3 {
            rotation: UnitQuaternion::from_axis_angle(
                &Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                std::f64::consts::FRAC_PI_2,
            ),
            translation: Vector3::new(1.0, 2.0, 3.0),
            scale: 2.0,
        }
    }

    #[test]
    fn test_inverse() {
        let sim3 = sample();
        let composed = sim3.compose(&sim3.inverse());

        assert_relative_eq!(composed.scale, 1.0, epsilon = 1e-10);
        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-10);

        let p = Vector3::new(1.0, 2.0, 3.0);
        let p_back = sim3.inverse().transform_point(&sim3.transform_point(&p));
        assert_relative_eq!(p_back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_transform_point_with_scale() {
        let sim3 = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
            scale: 2.0,
        };
        // 2 * (1,1,1) + (1,0,0)
        assert_relative_eq!(
            sim3.transform_point(&Vector3::new(1.0, 1.0, 1.0)),
            Vector3::new(3.0, 2.0, 2.0),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_transform_pose_keeps_points_consistent() {
        let sim3 = sample();
        let pose = SE3::from_quaternion(0.9, 0.1, -0.3, 0.2, Vector3::new(0.5, -1.0, 2.0));
        let p_cam = Vector3::new(0.1, 0.2, 1.5);

        // Rotation of the mapped pose applied to a scaled camera-frame point
        // lands on the mapped world point.
        let mapped = sim3.transform_pose(&pose);
        let via_pose = mapped.rotation * (p_cam * sim3.scale) + mapped.translation;
        let via_point = sim3.transform_point(&pose.transform_point(&p_cam));
        assert_relative_eq!(via_pose, via_point, epsilon = 1e-10);
    }

    #[test]
    fn test_matrix_form() {
        let sim3 = sample();
        let p = Vector3::new(-0.5, 0.25, 4.0);
        let h = sim3.to_matrix() * p.push(1.0);
        assert_relative_eq!(h.xyz(), sim3.transform_point(&p), epsilon = 1e-10);
    }

    #[test]
    fn test_is_identity() {
        assert!(Sim3::identity().is_identity(1e-12));
        assert!(!Sim3::from_scale(1.5).is_identity(1e-3));
    }
}
