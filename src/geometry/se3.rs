//! SE3: rigid-body transformation (rotation + translation).
//!
//! Camera poses in the pose graph are stored as T_wc (camera-to-world):
//! `p_world = pose.transform_point(&p_cam)`. Solvers that work in the camera
//! frame use the inverse, T_cw.

use std::ops::Mul;

use nalgebra::{Matrix3, Matrix4, Rotation3, Unit, UnitQuaternion, Vector3, Vector6};

/// Rigid transformation: p' = R * p + t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Construct from a rotation matrix and translation.
    ///
    /// The matrix is re-orthonormalized, so slightly noisy solver output is accepted.
    pub fn from_rt(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    /// Construct from quaternion components (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a homogeneous 4x4 matrix [R | t; 0 | 1].
    pub fn from_matrix(mat: &Matrix4<f64>) -> Self {
        let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(&r, t)
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Inverse transformation: [R^T | -R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose: (self ∘ other)(p) = self(other(p)).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Left-multiplicative update: exp(delta) ∘ self.
    ///
    /// `delta` is ordered [rotation (3), translation (3)] and uses the decoupled
    /// exponential (rotation vector, plain translation). This is the perturbation
    /// the bundle-adjustment Jacobians are derived for.
    pub fn retract_left(&self, delta: &Vector6<f64>) -> Self {
        let omega = Vector3::new(delta[0], delta[1], delta[2]);
        let upsilon = Vector3::new(delta[3], delta[4], delta[5]);
        let dq = UnitQuaternion::from_scaled_axis(omega);
        Self {
            rotation: dq * self.rotation,
            translation: dq * self.translation + upsilon,
        }
    }

    /// Rotation angle (radians) between two poses.
    pub fn angular_distance(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }

    /// Rotation about `axis` by `angle`, no translation.
    pub fn from_axis_angle(axis: &Vector3<f64>, angle: f64) -> Self {
        Self {
            rotation: UnitQuaternion::from_axis_angle(&Unit::new_normalize(*axis), angle),
            translation: Vector3::zeros(),
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

impl Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        self.compose(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &Unit::new_normalize(Vector3::new(0.3, -1.0, 0.2)),
                0.7,
            ),
            translation: Vector3::new(1.0, -2.0, 0.5),
        }
    }

    #[test]
    fn test_inverse_roundtrip() {
        let pose = sample_pose();
        let p = Vector3::new(0.4, 1.5, 3.0);
        let back = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_matrix_product() {
        let a = sample_pose();
        let b = SE3::from_axis_angle(&Vector3::z(), 0.3);
        let composed = (a * b).to_matrix();
        let expected = a.to_matrix() * b.to_matrix();
        assert_relative_eq!(composed, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_roundtrip() {
        let pose = sample_pose();
        let rebuilt = SE3::from_matrix(&pose.to_matrix());
        assert_relative_eq!(rebuilt.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(rebuilt.angular_distance(&pose), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_retract_left_first_order() {
        let pose = sample_pose();
        let p = Vector3::new(0.2, 0.1, 4.0);
        let delta = Vector6::new(1e-6, -2e-6, 3e-6, 1e-6, 1e-6, -1e-6);
        let moved = pose.retract_left(&delta).transform_point(&p);

        let q = pose.transform_point(&p);
        let omega = Vector3::new(delta[0], delta[1], delta[2]);
        let upsilon = Vector3::new(delta[3], delta[4], delta[5]);
        let predicted = q + omega.cross(&q) + upsilon;
        assert_relative_eq!(moved, predicted, epsilon = 1e-10);
    }
}
