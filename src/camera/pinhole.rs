//! Pinhole projection of board points through a view pose.
//!
//! A board point `P` is mapped to the camera frame by the view pose, divided
//! by its depth, distorted with the rational model from
//! [`crate::camera::distortion`] and finally scaled by the intrinsics:
//!
//! ```text
//! X = R(r) P + t
//! (x, y) = (X.x / X.z, X.y / X.z)
//! (x', y') = distort(x, y)
//! u = fx x' + cx,  v = fy y' + cy
//! ```

use crate::camera::distortion::{distort_generic, DISTORTION_COEFFICIENT_COUNT};
use crate::camera::pose::rotate_generic;
use crate::camera::{Distortion, Intrinsics, ViewPose};
use nalgebra::{RealField, Vector2, Vector3};

/// Projects a board point into pixel coordinates.
///
/// Points that land exactly on the camera plane (`X.z == 0`) are divided by
/// one instead, so the result is always finite for finite input. No image
/// bounds check is made; the evaluator needs residuals for every point.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use pinhole_calib::camera::{project_point, Distortion, Intrinsics, ViewPose};
///
/// let intrinsics = Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 };
/// let pose = ViewPose::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 1.0));
/// let uv = project_point(&intrinsics, &Distortion::zero(), &pose, &Vector3::new(0.1, 0.2, 0.0));
/// assert!((uv.x - 370.0).abs() < 1e-9);
/// assert!((uv.y - 340.0).abs() < 1e-9);
/// ```
pub fn project_point(
    intrinsics: &Intrinsics,
    distortion: &Distortion,
    pose: &ViewPose,
    point: &Vector3<f64>,
) -> Vector2<f64> {
    project_point_generic(
        &intrinsics.as_array(),
        &distortion.coefficients,
        &pose.rotation,
        &pose.translation,
        point,
    )
}

/// Generic projection used by the optimizer's residual.
///
/// `intrinsics` is `[fx, fy, cx, cy]` and `coefficients` holds the eight
/// distortion values in `[k1, k2, p1, p2, k3, k4, k5, k6]` order.
pub fn project_point_generic<T: RealField>(
    intrinsics: &[T],
    coefficients: &[T],
    rotation: &Vector3<T>,
    translation: &Vector3<T>,
    point: &Vector3<T>,
) -> Vector2<T> {
    debug_assert!(intrinsics.len() >= 4);
    debug_assert!(coefficients.len() >= DISTORTION_COEFFICIENT_COUNT);

    let p_cam = rotate_generic(rotation, point) + translation;

    let z = if p_cam.z == T::zero() {
        T::one()
    } else {
        p_cam.z.clone()
    };
    let x = p_cam.x.clone() / z.clone();
    let y = p_cam.y.clone() / z;

    let (xd, yd) = distort_generic(x, y, coefficients);

    Vector2::new(
        intrinsics[0].clone() * xd + intrinsics[2].clone(),
        intrinsics[1].clone() * yd + intrinsics[3].clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 600.0,
            fy: 590.0,
            cx: 320.0,
            cy: 240.0,
        }
    }

    #[test]
    fn test_pinhole_project_without_distortion() {
        let pose = ViewPose::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 0.5));
        let uv = project_point(
            &sample_intrinsics(),
            &Distortion::zero(),
            &pose,
            &Vector3::new(0.05, -0.025, 0.0),
        );
        assert_relative_eq!(uv.x, 600.0 * 0.1 + 320.0, epsilon = 1e-10);
        assert_relative_eq!(uv.y, 590.0 * -0.05 + 240.0, epsilon = 1e-10);
    }

    #[test]
    fn test_pinhole_project_with_distortion() {
        let distortion = Distortion::from_rad_tan(-0.2, 0.05, 0.001, -0.0005, 0.01);
        let pose = ViewPose::new(Vector3::new(0.1, -0.2, 0.05), Vector3::new(-0.03, 0.02, 0.4));
        let point = Vector3::new(0.075, 0.05, 0.0);

        let uv = project_point(&sample_intrinsics(), &distortion, &pose, &point);

        let p_cam = pose.transform_point(&point);
        let (xd, yd) = distortion.distort(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
        assert_relative_eq!(uv.x, 600.0 * xd + 320.0, epsilon = 1e-9);
        assert_relative_eq!(uv.y, 590.0 * yd + 240.0, epsilon = 1e-9);
    }

    #[test]
    fn test_point_on_camera_plane_stays_finite() {
        let uv = project_point(
            &sample_intrinsics(),
            &Distortion::zero(),
            &ViewPose::identity(),
            &Vector3::new(0.01, 0.02, 0.0),
        );
        assert!(uv.x.is_finite() && uv.y.is_finite());
        assert_relative_eq!(uv.x, 600.0 * 0.01 + 320.0, epsilon = 1e-10);
    }
}
