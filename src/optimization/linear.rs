//! Closed-form initialisation for the joint refinement.
//!
//! * [`find_homography`]: normalized DLT between board plane and image.
//! * [`initial_intrinsics`]: focal lengths from the orthogonality constraints
//!   that every plane homography puts on the image of the absolute conic,
//!   with the principal point pinned to the image centre.
//! * [`pose_from_homography`]: board pose from `K⁻¹ H`.

use crate::camera::{Intrinsics, Resolution, ViewPose};
use crate::optimization::SolverError;
use log::debug;
use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Vector2, Vector3};

/// Similarity transform moving the centroid to the origin with mean distance √2.
fn normalization_transform(points: &[Vector2<f64>]) -> Result<Matrix3<f64>, SolverError> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_distance = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;

    if !mean_distance.is_finite() || mean_distance < f64::EPSILON {
        return Err(SolverError::NumericalError(
            "Degenerate point configuration for homography".to_string(),
        ));
    }

    let scale = std::f64::consts::SQRT_2 / mean_distance;
    Ok(Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

fn apply(t: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let h = t * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(h.x / h.z, h.y / h.z)
}

/// Estimates `H` with `dst ~ H src` from at least four correspondences.
pub fn find_homography(
    src: &[Vector2<f64>],
    dst: &[Vector2<f64>],
) -> Result<Matrix3<f64>, SolverError> {
    if src.len() != dst.len() {
        return Err(SolverError::NumericalError(
            "Homography needs paired point sets".to_string(),
        ));
    }
    if src.len() < 4 {
        return Err(SolverError::NotEnoughPoints { found: src.len() });
    }

    let t_src = normalization_transform(src)?;
    let t_dst = normalization_transform(dst)?;

    let mut a = DMatrix::<f64>::zeros(src.len() * 2, 9);
    for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
        let s = apply(&t_src, s);
        let d = apply(&t_dst, d);
        let r = 2 * i;

        a[(r, 0)] = -s.x;
        a[(r, 1)] = -s.y;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = d.x * s.x;
        a[(r, 7)] = d.x * s.y;
        a[(r, 8)] = d.x;

        a[(r + 1, 3)] = -s.x;
        a[(r + 1, 4)] = -s.y;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = d.y * s.x;
        a[(r + 1, 7)] = d.y * s.y;
        a[(r + 1, 8)] = d.y;
    }

    // The null vector of A is the eigenvector of AᵀA with the smallest
    // eigenvalue; AᵀA is always 9×9 so the full basis is available.
    let ata = a.transpose() * &a;
    let svd = ata.svd(false, true);
    let v_t = svd.v_t.ok_or_else(|| {
        SolverError::NumericalError("SVD failed while estimating homography".to_string())
    })?;
    let (min_index, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &s)| {
            if s < best.1 {
                (i, s)
            } else {
                best
            }
        });

    let h = v_t.row(min_index);
    let h_normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst.try_inverse().ok_or_else(|| {
        SolverError::NumericalError("Normalization transform is singular".to_string())
    })?;
    let homography = t_dst_inv * h_normalized * t_src;

    let scale = homography[(2, 2)];
    if !scale.is_finite() || scale.abs() < f64::EPSILON {
        return Err(SolverError::NumericalError(
            "Homography is degenerate".to_string(),
        ));
    }
    Ok(homography / scale)
}

/// Focal lengths from a set of plane homographies, principal point at the
/// image centre.
///
/// With `aspect_ratio` set, the two focal lengths are rebalanced so that
/// `fx / fy == aspect_ratio`.
pub fn initial_intrinsics(
    homographies: &[Matrix3<f64>],
    resolution: &Resolution,
    aspect_ratio: Option<f64>,
) -> Result<Intrinsics, SolverError> {
    if homographies.is_empty() {
        return Err(SolverError::NoViews);
    }

    let center = resolution.center();
    let mut a = DMatrix::<f64>::zeros(homographies.len() * 2, 2);
    let mut b = DVector::<f64>::zeros(homographies.len() * 2);

    for (i, h) in homographies.iter().enumerate() {
        let mut h = *h;
        for col in 0..3 {
            h[(0, col)] -= h[(2, col)] * center.x;
            h[(1, col)] -= h[(2, col)] * center.y;
        }

        let mut h1 = h.column(0).into_owned();
        let mut h2 = h.column(1).into_owned();
        let mut d1 = (h1 + h2) * 0.5;
        let mut d2 = (h1 - h2) * 0.5;
        for v in [&mut h1, &mut h2, &mut d1, &mut d2] {
            let norm = v.norm();
            if norm > f64::EPSILON {
                *v /= norm;
            }
        }

        let r = 2 * i;
        a[(r, 0)] = h1.x * h2.x;
        a[(r, 1)] = h1.y * h2.y;
        b[r] = -h1.z * h2.z;
        a[(r + 1, 0)] = d1.x * d2.x;
        a[(r + 1, 1)] = d1.y * d2.y;
        b[r + 1] = -d1.z * d2.z;
    }

    let svd = a.svd(true, true);
    let f = svd
        .solve(&b, 1e-12)
        .map_err(|e| SolverError::NumericalError(e.to_string()))?;

    let mut fx = (1.0 / f[0]).abs().sqrt();
    let mut fy = (1.0 / f[1]).abs().sqrt();
    if !fx.is_finite() || !fy.is_finite() || fx <= 0.0 || fy <= 0.0 {
        return Err(SolverError::NumericalError(format!(
            "Linear focal length estimate is degenerate (fx = {fx}, fy = {fy})"
        )));
    }

    if let Some(aspect) = aspect_ratio {
        let tf = (fx + fy) / (aspect + 1.0);
        fx = aspect * tf;
        fy = tf;
    }

    debug!(
        "Linear initialisation: fx = {fx:.3}, fy = {fy:.3}, c = ({}, {})",
        center.x, center.y
    );

    Ok(Intrinsics {
        fx,
        fy,
        cx: center.x,
        cy: center.y,
    })
}

/// Board pose from a plane-to-image homography and known intrinsics.
///
/// The board is kept in front of the camera (`t.z > 0`) and the rotation is
/// projected onto SO(3).
pub fn pose_from_homography(
    intrinsics: &Intrinsics,
    homography: &Matrix3<f64>,
) -> Result<ViewPose, SolverError> {
    let k_inv = intrinsics.matrix().try_inverse().ok_or_else(|| {
        SolverError::NumericalError("Intrinsic matrix is singular".to_string())
    })?;
    let m = k_inv * homography;

    let mut h1 = m.column(0).into_owned();
    let mut h2 = m.column(1).into_owned();
    let n1 = h1.norm();
    let n2 = h2.norm();
    if n1 < f64::EPSILON || n2 < f64::EPSILON {
        return Err(SolverError::NumericalError(
            "Homography columns vanish, cannot recover pose".to_string(),
        ));
    }

    let mut t = m.column(2) * (2.0 / (n1 + n2));
    h1 /= n1;
    h2 /= n2;
    if t.z < 0.0 {
        h1 = -h1;
        h2 = -h2;
        t = -t;
    }

    let r = Matrix3::from_columns(&[h1, h2, h1.cross(&h2)]);
    let svd = r.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(SolverError::NumericalError(
                "SVD failed while orthonormalizing rotation".to_string(),
            ))
        }
    };
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        rotation = -rotation;
    }

    Ok(ViewPose::from_rotation(
        &Rotation3::from_matrix_unchecked(rotation),
        t,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{project_point, Distortion};
    use approx::assert_relative_eq;

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 600.0,
            fy: 590.0,
            cx: 319.5,
            cy: 239.5,
        }
    }

    fn board() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for row in 0..5 {
            for col in 0..4 {
                points.push(Vector3::new(col as f64 * 0.025, row as f64 * 0.025, 0.0));
            }
        }
        points
    }

    fn poses() -> Vec<ViewPose> {
        vec![
            ViewPose::new(Vector3::new(0.3, -0.2, 0.1), Vector3::new(-0.04, -0.05, 0.3)),
            ViewPose::new(Vector3::new(-0.25, 0.3, -0.05), Vector3::new(-0.03, -0.06, 0.32)),
            ViewPose::new(Vector3::new(0.1, 0.35, 0.2), Vector3::new(-0.05, -0.04, 0.28)),
        ]
    }

    fn image_points(pose: &ViewPose) -> Vec<Vector2<f64>> {
        board()
            .iter()
            .map(|p| project_point(&intrinsics(), &Distortion::zero(), pose, p))
            .collect()
    }

    fn plane_points() -> Vec<Vector2<f64>> {
        board().iter().map(|p| p.xy()).collect()
    }

    #[test]
    fn test_homography_maps_board_to_image() {
        let pose = poses()[0];
        let image = image_points(&pose);
        let h = find_homography(&plane_points(), &image).unwrap();
        for (p, uv) in plane_points().iter().zip(image.iter()) {
            let mapped = apply(&h, p);
            assert_relative_eq!(mapped, *uv, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_homography_needs_four_points() {
        let points = plane_points();
        let result = find_homography(&points[..3], &points[..3]);
        assert!(matches!(result, Err(SolverError::NotEnoughPoints { found: 3 })));
    }

    #[test]
    fn test_initial_intrinsics_close_to_truth() {
        let homographies: Vec<_> = poses()
            .iter()
            .map(|pose| find_homography(&plane_points(), &image_points(pose)).unwrap())
            .collect();
        let estimate =
            initial_intrinsics(&homographies, &Resolution::new(640, 480), None).unwrap();
        assert_relative_eq!(estimate.cx, 319.5);
        assert_relative_eq!(estimate.cy, 239.5);
        assert_relative_eq!(estimate.fx, 600.0, max_relative = 1e-6);
        assert_relative_eq!(estimate.fy, 590.0, max_relative = 1e-6);

        let balanced =
            initial_intrinsics(&homographies, &Resolution::new(640, 480), Some(1.0)).unwrap();
        assert_relative_eq!(balanced.fx, balanced.fy);
        assert_relative_eq!(balanced.fx, 595.0, max_relative = 1e-6);
    }

    #[test]
    fn test_initial_intrinsics_rebalances_non_unit_aspect() {
        let homographies: Vec<_> = poses()
            .iter()
            .map(|pose| find_homography(&plane_points(), &image_points(pose)).unwrap())
            .collect();
        let estimate =
            initial_intrinsics(&homographies, &Resolution::new(640, 480), Some(1.2)).unwrap();
        assert_relative_eq!(estimate.fx / estimate.fy, 1.2, max_relative = 1e-12);
        assert_relative_eq!(estimate.fy, (600.0 + 590.0) / 2.2, max_relative = 1e-6);
        assert!(estimate.fx > estimate.fy);
    }

    #[test]
    fn test_pose_from_homography_recovers_pose() {
        for pose in poses() {
            let h = find_homography(&plane_points(), &image_points(&pose)).unwrap();
            let recovered = pose_from_homography(&intrinsics(), &h).unwrap();
            assert_relative_eq!(recovered.rotation, pose.rotation, epsilon = 1e-6);
            assert_relative_eq!(recovered.translation, pose.translation, epsilon = 1e-6);
        }
    }
}
