//! Per-view extrinsics stored as a rotation vector and a translation.

use nalgebra::{Isometry3, RealField, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Pose of the board in the camera frame: `p_cam = R(rotation) * p_board + translation`.
///
/// `rotation` is an axis-angle vector whose norm is the angle in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewPose {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl ViewPose {
    pub fn new(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        ViewPose {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        ViewPose::new(Vector3::zeros(), Vector3::zeros())
    }

    /// Builds a pose from a rotation matrix and a translation.
    pub fn from_rotation(rotation: &Rotation3<f64>, translation: Vector3<f64>) -> Self {
        ViewPose::new(rotation.scaled_axis(), translation)
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        ViewPose::new(iso.rotation.scaled_axis(), iso.translation.vector)
    }

    pub fn rotation_matrix(&self) -> Rotation3<f64> {
        Rotation3::new(self.rotation)
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::new(self.rotation),
        )
    }

    /// Maps a board point into the camera frame.
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation_matrix() * point + self.translation
    }

    /// `[rx, ry, rz, tx, ty, tz]`, the layout of one extrinsic record row.
    pub fn to_row(&self) -> [f64; 6] {
        [
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    pub fn from_row(row: &[f64]) -> Option<Self> {
        if row.len() != 6 {
            return None;
        }
        Some(ViewPose::new(
            Vector3::new(row[0], row[1], row[2]),
            Vector3::new(row[3], row[4], row[5]),
        ))
    }
}

/// Rotates `point` by the rotation vector `r` with the Rodrigues formula.
///
/// Generic over [`RealField`] for automatic differentiation. Below a tiny
/// angle the first-order form `p + r × p` is used, which keeps the
/// derivatives finite at the identity.
pub fn rotate_generic<T: RealField>(r: &Vector3<T>, point: &Vector3<T>) -> Vector3<T> {
    let theta2 = r.dot(r);
    let threshold = T::from_f64(1e-14).unwrap();

    if theta2 > threshold {
        let theta = theta2.sqrt();
        let axis = r / theta.clone();
        let cos_theta = theta.clone().cos();
        let sin_theta = theta.sin();
        let k_dot_p = axis.dot(point);
        point * cos_theta.clone()
            + axis.cross(point) * sin_theta
            + axis * (k_dot_p * (T::one() - cos_theta))
    } else {
        point + r.cross(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rotate_generic_matches_rotation_matrix() {
        let r = Vector3::new(0.3, -0.2, 0.1);
        let p = Vector3::new(0.05, 0.075, 0.0);
        let expected = Rotation3::new(r) * p;
        let actual = rotate_generic(&r, &p);
        assert_relative_eq!(actual, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_rotate_generic_near_identity() {
        let r = Vector3::new(1e-9, 0.0, 0.0);
        let p = Vector3::new(1.0, 2.0, 3.0);
        let actual = rotate_generic(&r, &p);
        assert_relative_eq!(actual, p, epsilon = 1e-8);
    }

    #[test]
    fn test_row_layout() {
        let pose = ViewPose::new(Vector3::new(0.1, 0.2, 0.3), Vector3::new(1.0, 2.0, 3.0));
        let row = pose.to_row();
        assert_eq!(row, [0.1, 0.2, 0.3, 1.0, 2.0, 3.0]);
        assert_eq!(ViewPose::from_row(&row), Some(pose));
        assert_eq!(ViewPose::from_row(&row[..5]), None);
    }

    #[test]
    fn test_isometry_round_trip() {
        let pose = ViewPose::new(Vector3::new(0.2, -0.1, 0.05), Vector3::new(0.0, 0.1, 0.5));
        let back = ViewPose::from_isometry(&pose.to_isometry());
        assert_relative_eq!(back.rotation, pose.rotation, epsilon = 1e-12);
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        let p = Vector3::new(0.025, 0.05, 0.0);
        assert_relative_eq!(
            pose.transform_point(&p),
            (pose.to_isometry() * nalgebra::Point3::from(p)).coords,
            epsilon = 1e-12
        );
    }
}
