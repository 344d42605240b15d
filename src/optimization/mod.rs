//! The `optimization` module estimates a [`CameraModel`] from planar views.
//!
//! Calibration runs in two stages:
//! 1. A linear estimation step ([`linear`]) seeds the intrinsics from the
//!    plane homographies and recovers one pose per view.
//! 2. A joint Levenberg-Marquardt refinement ([`pinhole`]) adjusts the shared
//!    intrinsics, the distortion and every pose together, honouring the
//!    constraint flags.
//!
//! Both stages sit behind the [`Optimizer`] trait so the non-linear backend
//! can be swapped without touching the callers of [`solve`].

use crate::board::ModelPointSet;
use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use crate::observation::ViewObservation;
use crate::reprojection::{self, ReprojectionErrors};
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub mod linear;
pub mod pinhole;

pub use pinhole::PinholeOptimizationCost;

/// Iteration budget used when the caller does not set one.
pub const DEFAULT_MAX_ITERATIONS: usize = 200;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("No views to calibrate from")]
    NoViews,
    #[error("View {view} has {found} image points but the board has {expected}")]
    CorrespondenceMismatch {
        view: usize,
        expected: usize,
        found: usize,
    },
    #[error("At least 4 board points are required, found {found}")]
    NotEnoughPoints { found: usize },
    #[error("Invalid intrinsic guess: {0}")]
    InvalidIntrinsicGuess(CameraModelError),
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error("Optimization failed: {0}")]
    OptimizationFailed(String),
    #[error("Calibration did not converge (reprojection error {aggregate_error})")]
    DidNotConverge { aggregate_error: f64 },
}

/// Constraints applied to the calibration.
///
/// The integer encoding follows the usual calibration flag values, see
/// [`CalibrationFlags::bits`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationFlags {
    /// Start from the caller's intrinsics instead of the linear estimate.
    pub use_intrinsic_guess: bool,
    /// Keep `fx / fy` at the configured aspect ratio.
    pub fix_aspect_ratio: bool,
    /// Keep the principal point at its initial value.
    pub fix_principal_point: bool,
    /// Force `p1 = p2 = 0`.
    pub zero_tangent_dist: bool,
    /// Keep `k3` at zero.
    pub fix_k3: bool,
}

impl CalibrationFlags {
    pub const USE_INTRINSIC_GUESS: u32 = 1;
    pub const FIX_ASPECT_RATIO: u32 = 2;
    pub const FIX_PRINCIPAL_POINT: u32 = 4;
    pub const ZERO_TANGENT_DIST: u32 = 8;
    pub const FIX_K3: u32 = 128;

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.use_intrinsic_guess {
            bits |= Self::USE_INTRINSIC_GUESS;
        }
        if self.fix_aspect_ratio {
            bits |= Self::FIX_ASPECT_RATIO;
        }
        if self.fix_principal_point {
            bits |= Self::FIX_PRINCIPAL_POINT;
        }
        if self.zero_tangent_dist {
            bits |= Self::ZERO_TANGENT_DIST;
        }
        if self.fix_k3 {
            bits |= Self::FIX_K3;
        }
        bits
    }

    /// Decodes a bitmask. Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        CalibrationFlags {
            use_intrinsic_guess: bits & Self::USE_INTRINSIC_GUESS != 0,
            fix_aspect_ratio: bits & Self::FIX_ASPECT_RATIO != 0,
            fix_principal_point: bits & Self::FIX_PRINCIPAL_POINT != 0,
            zero_tangent_dist: bits & Self::ZERO_TANGENT_DIST != 0,
            fix_k3: bits & Self::FIX_K3 != 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits() == 0
    }

    /// Human-readable form, e.g. `+fix_aspectRatio+zero_tangent_dist`.
    pub fn description(&self) -> String {
        let mut description = String::new();
        if self.use_intrinsic_guess {
            description.push_str("+use_intrinsic_guess");
        }
        if self.fix_aspect_ratio {
            description.push_str("+fix_aspectRatio");
        }
        if self.fix_principal_point {
            description.push_str("+fix_principal_point");
        }
        if self.zero_tangent_dist {
            description.push_str("+zero_tangent_dist");
        }
        if self.fix_k3 {
            description.push_str("+fix_k3");
        }
        description
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    /// `fx / fy`, only used with `fix_aspect_ratio`.
    pub aspect_ratio: f64,
    /// Starting intrinsics, required with `use_intrinsic_guess`.
    pub intrinsic_guess: Option<Intrinsics>,
    pub max_iterations: usize,
    /// Log solver progress at info level.
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            aspect_ratio: 1.0,
            intrinsic_guess: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            verbose: false,
        }
    }
}

/// A trait for camera calibration backends.
///
/// Types implementing `Optimizer` own a working [`CameraModel`] and refine it
/// in place from the 3D-2D correspondences they were built with.
pub trait Optimizer {
    /// Performs non-linear optimization of all free parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress is logged at info level.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The working model holds the refined parameters.
    /// * `Err(SolverError)` - The backend produced no solution.
    fn optimize(&mut self, verbose: bool) -> Result<(), SolverError>;

    /// Seeds the working model with closed-form estimates.
    ///
    /// This provides the starting point of [`Optimizer::optimize`]: initial
    /// intrinsics (unless a guess is used) and one pose per view.
    fn linear_estimation(&mut self) -> Result<(), SolverError>
    where
        Self: Sized;

    /// Retrieves the current intrinsic parameters.
    fn get_intrinsics(&self) -> Intrinsics;

    /// Retrieves the image resolution the model is calibrated for.
    fn get_resolution(&self) -> Resolution;

    /// Retrieves the current distortion coefficients.
    fn get_distortion(&self) -> Vec<f64>;

    /// Retrieves the whole working model.
    fn get_model(&self) -> &CameraModel;
}

/// Estimates intrinsics, distortion and one pose per view.
///
/// `observations` must be aligned index-for-index with `model_points`. The
/// returned poses follow the order of `observations`.
///
/// # Errors
///
/// * [`SolverError::NoViews`] when `observations` is empty.
/// * [`SolverError::CorrespondenceMismatch`] when a view has the wrong length.
/// * [`SolverError::NotEnoughPoints`] when the board has fewer than 4 corners.
/// * [`SolverError::InvalidIntrinsicGuess`] when `use_intrinsic_guess` is set
///   and the guess is missing or unusable.
/// * [`SolverError::DidNotConverge`] when the refined model is not finite.
pub fn solve(
    observations: &[ViewObservation],
    model_points: &ModelPointSet,
    resolution: Resolution,
    flags: CalibrationFlags,
    options: &SolverOptions,
) -> Result<CameraModel, SolverError> {
    if observations.is_empty() {
        return Err(SolverError::NoViews);
    }
    if model_points.len() < 4 {
        return Err(SolverError::NotEnoughPoints {
            found: model_points.len(),
        });
    }
    if let Some((view, observation)) = observations
        .iter()
        .enumerate()
        .find(|(_, o)| o.len() != model_points.len())
    {
        return Err(SolverError::CorrespondenceMismatch {
            view,
            expected: model_points.len(),
            found: observation.len(),
        });
    }
    if flags.fix_aspect_ratio && !(options.aspect_ratio.is_finite() && options.aspect_ratio > 0.0)
    {
        return Err(SolverError::InvalidIntrinsicGuess(
            CameraModelError::InvalidParams(format!(
                "aspect ratio must be positive, got {}",
                options.aspect_ratio
            )),
        ));
    }

    let mut cost = PinholeOptimizationCost::new(
        model_points.points().to_vec(),
        observations.iter().map(|o| o.image_points.clone()).collect(),
        resolution,
        flags,
        options,
    );

    if flags.use_intrinsic_guess {
        let guess = options.intrinsic_guess.ok_or_else(|| {
            SolverError::InvalidIntrinsicGuess(CameraModelError::InvalidParams(
                "use_intrinsic_guess is set but no guess was given".to_string(),
            ))
        })?;
        validation::validate_guess(&guess, &resolution)
            .map_err(SolverError::InvalidIntrinsicGuess)?;
        cost.set_intrinsics(guess);
    }

    cost.linear_estimation()?;
    cost.optimize(options.verbose)?;

    let model = cost.into_model();
    let errors = range_check(&model, observations, model_points)?;

    info!(
        "Calibrated {} views, RMS reprojection error {:.6} px",
        model.view_count(),
        errors.aggregate
    );
    Ok(model)
}

/// Rejects a model whose intrinsics or distortion are not finite.
///
/// The error carries the reprojection error of the rejected model. On success
/// the errors of the accepted model are returned.
pub fn range_check(
    model: &CameraModel,
    observations: &[ViewObservation],
    model_points: &ModelPointSet,
) -> Result<ReprojectionErrors, SolverError> {
    let errors = reprojection::evaluate(observations, model_points, model);
    if !model.is_finite() {
        warn!(
            "Calibration produced non-finite parameters (reprojection error {})",
            errors.aggregate
        );
        return Err(SolverError::DidNotConverge {
            aggregate_error: errors.aggregate,
        });
    }
    Ok(errors)
}
