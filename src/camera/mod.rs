//! Camera parameters shared by the solver, the evaluator and the record.
//!
//! The camera is a pinhole with zero skew and the 8-coefficient rational
//! radial + tangential distortion model. Every view additionally carries a
//! [`ViewPose`] that maps board coordinates into the camera frame.

pub mod distortion;
pub mod pinhole;
pub mod pose;

pub use distortion::{Distortion, ALWAYS_FIXED_COEFFICIENTS, DISTORTION_COEFFICIENT_COUNT};
pub use pinhole::{project_point, project_point_generic};
pub use pose::ViewPose;

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Focal lengths and principal point in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Identity intrinsic matrix, the starting point before any estimation.
    pub fn identity() -> Self {
        Intrinsics {
            fx: 1.0,
            fy: 1.0,
            cx: 0.0,
            cy: 0.0,
        }
    }

    /// Builds the 3×3 intrinsic matrix `[fx 0 cx; 0 fy cy; 0 0 1]`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Reads fx, fy, cx, cy back from an intrinsic matrix. Skew is ignored.
    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Intrinsics {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.fx, self.fy, self.cx, self.cy]
    }

    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite())
    }
}

/// Image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }

    /// Pixel centre of the image, `((w - 1) / 2, (h - 1) / 2)`.
    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(
            (self.width as f64 - 1.0) * 0.5,
            (self.height as f64 - 1.0) * 0.5,
        )
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraModelError {
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Principal point ({cx}, {cy}) lies outside the {width}x{height} image")]
    PrincipalPointOutsideImage {
        cx: f64,
        cy: f64,
        width: u32,
        height: u32,
    },
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
}

/// Solver output: shared intrinsics and distortion plus one pose per view.
///
/// Poses are stored in the order of the views that were solved for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    pub poses: Vec<ViewPose>,
}

impl CameraModel {
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.matrix()
    }

    pub fn view_count(&self) -> usize {
        self.poses.len()
    }

    /// Range check on the intrinsic matrix and the distortion vector.
    pub fn is_finite(&self) -> bool {
        self.intrinsics.is_finite() && self.distortion.is_finite()
    }

    /// Projects board points through the pose of view `view`.
    ///
    /// Returns `None` when `view` is out of range.
    pub fn project_view(&self, view: usize, points: &[Vector3<f64>]) -> Option<Vec<Vector2<f64>>> {
        let pose = self.poses.get(view)?;
        Some(
            points
                .iter()
                .map(|p| project_point(&self.intrinsics, &self.distortion, pose, p))
                .collect(),
        )
    }
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        let focal_ok = |f: f64| f.is_finite() && f > 0.0;
        if !focal_ok(intrinsics.fx) || !focal_ok(intrinsics.fy) {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    /// Checks an intrinsic guess against the image it is supposed to describe.
    pub fn validate_guess(
        intrinsics: &Intrinsics,
        resolution: &Resolution,
    ) -> Result<(), CameraModelError> {
        validate_intrinsics(intrinsics)?;
        if intrinsics.cx < 0.0
            || intrinsics.cx >= resolution.width as f64
            || intrinsics.cy < 0.0
            || intrinsics.cy >= resolution.height as f64
        {
            return Err(CameraModelError::PrincipalPointOutsideImage {
                cx: intrinsics.cx,
                cy: intrinsics.cy,
                width: resolution.width,
                height: resolution.height,
            });
        }
        Ok(())
    }
}
