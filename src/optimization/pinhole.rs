//! This module provides the cost function and optimization routines
//! for calibrating a pinhole camera with rational distortion from planar views.
//!
//! It uses the `tiny_solver` crate for non-linear optimization. One residual
//! block is added per view; all blocks share the `intrinsics` and `distortion`
//! variables and each owns a `pose_{i}` variable.

use crate::camera::distortion::{K3, K6, P1, P2};
use crate::camera::{
    project_point_generic, CameraModel, Distortion, Intrinsics, Resolution, ViewPose,
    ALWAYS_FIXED_COEFFICIENTS,
};
use crate::optimization::linear::{find_homography, initial_intrinsics, pose_from_homography};
use crate::optimization::{CalibrationFlags, Optimizer, SolverError, SolverOptions};

use log::{debug, info};
use nalgebra::{DVector, Vector2, Vector3};
use std::collections::HashMap;
use std::fmt;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer, OptimizerOptions};

const INTRINSICS: &str = "intrinsics";
const DISTORTION: &str = "distortion";

fn pose_name(view: usize) -> String {
    format!("pose_{view}")
}

/// Working state for the joint calibration of one run.
///
/// Holds the board points, the per-view detections and the camera model
/// being refined. It implements the [`Optimizer`] trait.
#[derive(Clone)]
pub struct PinholeOptimizationCost {
    model: CameraModel,
    resolution: Resolution,
    flags: CalibrationFlags,
    aspect_ratio: f64,
    max_iterations: usize,
    /// Board corners in the board frame, shared by every view.
    points3d: Vec<Vector3<f64>>,
    /// Detected corners, one vector per view.
    points2d: Vec<Vec<Vector2<f64>>>,
    /// Set once the intrinsics come from the caller.
    has_guess: bool,
}

/// Residual of one view for `tiny_solver`.
///
/// Parameters are `[intrinsics (fx, fy, cx, cy), distortion (8), pose (rx, ry, rz, tx, ty, tz)]`.
/// The residual is `projected - observed` for every corner, two entries per corner.
#[derive(Debug, Clone)]
struct PinholeViewCost {
    points3d: Vec<Vector3<f64>>,
    points2d: Vec<Vector2<f64>>,
    /// When set, `fx` is not read from the parameters but derived as `aspect * fy`.
    aspect_ratio: Option<f64>,
}

impl<T: nalgebra::RealField> Factor<T> for PinholeViewCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let cam_params = &params[0];
        let distortion = &params[1];
        let pose = &params[2];

        let fy = cam_params[1].clone();
        let fx = match self.aspect_ratio {
            Some(aspect) => T::from_f64(aspect).unwrap() * fy.clone(),
            None => cam_params[0].clone(),
        };
        let intrinsics = [fx, fy, cam_params[2].clone(), cam_params[3].clone()];

        let rotation = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let translation = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());

        let mut residuals = DVector::zeros(self.points2d.len() * 2);
        for (i, (p3d, p2d)) in self.points3d.iter().zip(self.points2d.iter()).enumerate() {
            let point = Vector3::new(
                T::from_f64(p3d.x).unwrap(),
                T::from_f64(p3d.y).unwrap(),
                T::from_f64(p3d.z).unwrap(),
            );
            let projected = project_point_generic(
                &intrinsics,
                distortion.as_slice(),
                &rotation,
                &translation,
                &point,
            );
            residuals[i * 2] = projected.x.clone() - T::from_f64(p2d.x).unwrap();
            residuals[i * 2 + 1] = projected.y.clone() - T::from_f64(p2d.y).unwrap();
        }
        residuals
    }
}

impl PinholeOptimizationCost {
    /// Creates the working state with identity intrinsics and zero distortion.
    ///
    /// With `fix_aspect_ratio`, entry `fx` of the starting matrix is the
    /// aspect ratio.
    pub fn new(
        points3d: Vec<Vector3<f64>>,
        points2d: Vec<Vec<Vector2<f64>>>,
        resolution: Resolution,
        flags: CalibrationFlags,
        options: &SolverOptions,
    ) -> Self {
        let mut intrinsics = Intrinsics::identity();
        if flags.fix_aspect_ratio {
            intrinsics.fx = options.aspect_ratio;
        }
        let poses = vec![ViewPose::identity(); points2d.len()];

        Self {
            model: CameraModel {
                intrinsics,
                distortion: Distortion::zero(),
                poses,
            },
            resolution,
            flags,
            aspect_ratio: options.aspect_ratio,
            max_iterations: options.max_iterations,
            points3d,
            points2d,
            has_guess: false,
        }
    }

    /// Replaces the starting intrinsics; the linear step then keeps them.
    pub fn set_intrinsics(&mut self, intrinsics: Intrinsics) {
        self.model.intrinsics = intrinsics;
        self.has_guess = true;
    }

    pub fn into_model(self) -> CameraModel {
        self.model
    }

    fn plane_points(&self) -> Vec<Vector2<f64>> {
        self.points3d.iter().map(|p| p.xy()).collect()
    }

    /// Distortion indices held constant during refinement.
    fn fixed_distortion_indices(&self) -> Vec<usize> {
        let mut fixed: Vec<usize> = ALWAYS_FIXED_COEFFICIENTS.to_vec();
        fixed.push(K6);
        if self.flags.zero_tangent_dist {
            fixed.push(P1);
            fixed.push(P2);
        }
        if self.flags.fix_k3 {
            fixed.push(K3);
        }
        fixed
    }

    fn solver_options(&self) -> OptimizerOptions {
        OptimizerOptions {
            max_iteration: self.max_iterations,
            min_abs_error_decrease_threshold: 1e-14,
            min_rel_error_decrease_threshold: 1e-12,
            min_error_threshold: 1e-16,
            ..Default::default()
        }
    }
}

impl fmt::Debug for PinholeOptimizationCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PinholeOptimizationCost Summary:\n intrinsics: {:?}\n flags: {}\n views: {}, points per view: {} ",
            self.model.intrinsics,
            self.flags.bits(),
            self.points2d.len(),
            self.points3d.len(),
        )
    }
}

impl Optimizer for PinholeOptimizationCost {
    /// Jointly refines intrinsics, distortion and poses with Levenberg-Marquardt.
    ///
    /// Constraint flags become fixed variables:
    /// * `fix_aspect_ratio`: `fx` is fixed and derived from `fy` inside the residual.
    /// * `fix_principal_point`: `cx`, `cy` fixed.
    /// * `zero_tangent_dist`: `p1`, `p2` fixed at zero.
    /// * `fix_k3`: `k3` fixed at zero.
    /// * always: `k4`, `k5`, `k6` fixed at zero.
    fn optimize(&mut self, verbose: bool) -> Result<(), SolverError> {
        if self.points2d.is_empty() {
            return Err(SolverError::NoViews);
        }

        if verbose {
            info!("Starting pinhole calibration optimization...");
            info!("Initial model: {:?}", self.model.intrinsics);
            info!(
                "Number of views: {}, correspondences per view: {}",
                self.points2d.len(),
                self.points3d.len()
            );
        }

        let mut problem = tiny_solver::Problem::new();
        let aspect_ratio = self.flags.fix_aspect_ratio.then_some(self.aspect_ratio);

        let mut initial_values = HashMap::new();
        initial_values.insert(
            INTRINSICS.to_string(),
            DVector::from_row_slice(&self.model.intrinsics.as_array()),
        );
        initial_values.insert(
            DISTORTION.to_string(),
            DVector::from_row_slice(&self.model.distortion.coefficients),
        );

        for (view, points2d) in self.points2d.iter().enumerate() {
            let name = pose_name(view);
            let cost = PinholeViewCost {
                points3d: self.points3d.clone(),
                points2d: points2d.clone(),
                aspect_ratio,
            };
            problem.add_residual_block(
                points2d.len() * 2,
                &[INTRINSICS, DISTORTION, name.as_str()],
                Box::new(cost),
                None,
            );
            initial_values.insert(
                name,
                DVector::from_row_slice(&self.model.poses[view].to_row()),
            );
        }

        if self.flags.fix_aspect_ratio {
            problem.fix_variable(INTRINSICS, 0);
        }
        if self.flags.fix_principal_point {
            problem.fix_variable(INTRINSICS, 2);
            problem.fix_variable(INTRINSICS, 3);
        }
        for index in self.fixed_distortion_indices() {
            problem.fix_variable(DISTORTION, index);
        }

        if verbose {
            info!("Starting joint optimization with tiny_solver Levenberg-Marquardt...");
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, Some(self.solver_options()))
            .ok_or_else(|| {
                SolverError::OptimizationFailed("Solver returned no solution".to_string())
            })?;

        let missing =
            |name: &str| SolverError::OptimizationFailed(format!("Solution lacks `{name}`"));

        let cam_params = result.get(INTRINSICS).ok_or_else(|| missing(INTRINSICS))?;
        self.model.intrinsics = Intrinsics {
            fx: match aspect_ratio {
                Some(aspect) => aspect * cam_params[1],
                None => cam_params[0],
            },
            fy: cam_params[1],
            cx: cam_params[2],
            cy: cam_params[3],
        };

        let coefficients = result.get(DISTORTION).ok_or_else(|| missing(DISTORTION))?;
        for (target, value) in self
            .model
            .distortion
            .coefficients
            .iter_mut()
            .zip(coefficients.iter())
        {
            *target = *value;
        }

        for view in 0..self.points2d.len() {
            let name = pose_name(view);
            let row = result.get(&name).ok_or_else(|| missing(&name))?;
            self.model.poses[view] = ViewPose::from_row(row.as_slice())
                .ok_or_else(|| missing(&name))?;
        }

        if verbose {
            info!("Pinhole optimization finished");
            info!("Optimized intrinsics: {:?}", self.model.intrinsics);
            info!("Optimized distortion: {:?}", self.model.distortion.coefficients);
        }

        Ok(())
    }

    /// Seeds intrinsics and per-view poses from plane homographies.
    ///
    /// Without an intrinsic guess, the focal lengths come from the linear
    /// constraints of all views and the principal point is the image centre.
    /// With a guess, only the poses are estimated.
    fn linear_estimation(&mut self) -> Result<(), SolverError> {
        if self.points2d.is_empty() {
            return Err(SolverError::NoViews);
        }
        if self.points3d.len() < 4 {
            return Err(SolverError::NotEnoughPoints {
                found: self.points3d.len(),
            });
        }

        let plane = self.plane_points();
        let homographies = self
            .points2d
            .iter()
            .map(|image| find_homography(&plane, image))
            .collect::<Result<Vec<_>, _>>()?;

        let aspect_ratio = self.flags.fix_aspect_ratio.then_some(self.aspect_ratio);
        if self.has_guess {
            if let Some(aspect) = aspect_ratio {
                self.model.intrinsics.fx = aspect * self.model.intrinsics.fy;
            }
        } else {
            self.model.intrinsics =
                initial_intrinsics(&homographies, &self.resolution, aspect_ratio)?;
        }

        self.model.poses = homographies
            .iter()
            .map(|h| pose_from_homography(&self.model.intrinsics, h))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Linear estimation: {:?} with {} poses",
            self.model.intrinsics,
            self.model.poses.len()
        );

        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.model.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    /// For the pinhole model these are `[k1, k2, p1, p2, k3, k4, k5, k6]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.model.distortion.coefficients.to_vec()
    }

    fn get_model(&self) -> &CameraModel {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::project_point;
    use approx::assert_relative_eq;

    fn ground_truth() -> Intrinsics {
        Intrinsics {
            fx: 600.0,
            fy: 590.0,
            cx: 320.0,
            cy: 240.0,
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

    fn observe(intrinsics: &Intrinsics, distortion: &Distortion) -> Vec<Vec<Vector2<f64>>> {
        poses()
            .iter()
            .map(|pose| {
                board()
                    .iter()
                    .map(|p| project_point(intrinsics, distortion, pose, p))
                    .collect()
            })
            .collect()
    }

    fn rms(cost: &PinholeOptimizationCost) -> f64 {
        let model = cost.get_model();
        let mut sum = 0.0;
        let mut count = 0;
        for (pose, view) in model.poses.iter().zip(cost.points2d.iter()) {
            for (p3d, p2d) in cost.points3d.iter().zip(view.iter()) {
                let uv = project_point(&model.intrinsics, &model.distortion, pose, p3d);
                sum += (uv - p2d).norm_squared();
                count += 1;
            }
        }
        (sum / count as f64).sqrt()
    }

    #[test]
    fn test_residual_vanishes_at_ground_truth() {
        let truth = ground_truth();
        let observations = observe(&truth, &Distortion::zero());
        let cost = PinholeViewCost {
            points3d: board(),
            points2d: observations[0].clone(),
            aspect_ratio: None,
        };
        let params = vec![
            DVector::from_row_slice(&truth.as_array()),
            DVector::from_row_slice(&Distortion::zero().coefficients),
            DVector::from_row_slice(&poses()[0].to_row()),
        ];
        let residuals = <PinholeViewCost as Factor<f64>>::residual_func(&cost, &params);
        assert_eq!(residuals.len(), 40);
        assert!(residuals.amax() < 1e-9);
    }

    #[test]
    fn test_linear_estimation_seeds_model() {
        let truth = ground_truth();
        let mut cost = PinholeOptimizationCost::new(
            board(),
            observe(&truth, &Distortion::zero()),
            Resolution::new(640, 480),
            CalibrationFlags::default(),
            &SolverOptions::default(),
        );
        cost.linear_estimation().unwrap();
        assert_eq!(cost.get_model().poses.len(), 3);
        assert_relative_eq!(cost.get_intrinsics().cx, 319.5);
        assert_relative_eq!(cost.get_intrinsics().fx, 600.0, max_relative = 0.05);
        assert_relative_eq!(cost.get_intrinsics().fy, 590.0, max_relative = 0.05);
    }

    #[test]
    fn test_optimization_recovers_intrinsics() {
        let truth = ground_truth();
        let mut cost = PinholeOptimizationCost::new(
            board(),
            observe(&truth, &Distortion::zero()),
            Resolution::new(640, 480),
            CalibrationFlags {
                zero_tangent_dist: true,
                fix_k3: true,
                ..Default::default()
            },
            &SolverOptions::default(),
        );
        cost.linear_estimation().unwrap();
        cost.optimize(false).unwrap();

        let intrinsics = cost.get_intrinsics();
        assert!(rms(&cost) < 1e-3);
        assert_relative_eq!(intrinsics.fx, truth.fx, max_relative = 0.01);
        assert_relative_eq!(intrinsics.fy, truth.fy, max_relative = 0.01);
        assert_relative_eq!(intrinsics.cx, truth.cx, max_relative = 0.01);
        assert_relative_eq!(intrinsics.cy, truth.cy, max_relative = 0.01);

        let distortion = cost.get_distortion();
        assert_eq!(distortion[P1], 0.0);
        assert_eq!(distortion[P2], 0.0);
        assert_eq!(distortion[K3], 0.0);
        for index in ALWAYS_FIXED_COEFFICIENTS {
            assert_eq!(distortion[index], 0.0);
        }
    }

    #[test]
    fn test_non_unit_aspect_ratio_is_kept() {
        let truth = Intrinsics {
            fx: 708.0,
            fy: 590.0,
            cx: 320.0,
            cy: 240.0,
        };
        let options = SolverOptions {
            aspect_ratio: 1.2,
            ..Default::default()
        };
        let mut cost = PinholeOptimizationCost::new(
            board(),
            observe(&truth, &Distortion::zero()),
            Resolution::new(640, 480),
            CalibrationFlags {
                fix_aspect_ratio: true,
                zero_tangent_dist: true,
                fix_k3: true,
                ..Default::default()
            },
            &options,
        );
        cost.linear_estimation().unwrap();
        let seeded = cost.get_intrinsics();
        assert_relative_eq!(seeded.fx / seeded.fy, 1.2, max_relative = 1e-12);

        cost.optimize(false).unwrap();
        let intrinsics = cost.get_intrinsics();
        assert_relative_eq!(intrinsics.fx / intrinsics.fy, 1.2, max_relative = 1e-12);
        assert_relative_eq!(intrinsics.fx, truth.fx, max_relative = 0.01);
        assert_relative_eq!(intrinsics.fy, truth.fy, max_relative = 0.01);
        assert!(rms(&cost) < 1e-3);
    }

    #[test]
    fn test_fixed_principal_point_and_aspect_ratio() {
        let truth = Intrinsics {
            fx: 590.0,
            fy: 590.0,
            cx: 319.5,
            cy: 239.5,
        };
        let options = SolverOptions {
            aspect_ratio: 1.0,
            ..Default::default()
        };
        let mut cost = PinholeOptimizationCost::new(
            board(),
            observe(&truth, &Distortion::zero()),
            Resolution::new(640, 480),
            CalibrationFlags {
                fix_aspect_ratio: true,
                fix_principal_point: true,
                zero_tangent_dist: true,
                fix_k3: true,
                ..Default::default()
            },
            &options,
        );
        cost.linear_estimation().unwrap();
        cost.optimize(false).unwrap();

        let intrinsics = cost.get_intrinsics();
        assert_eq!(intrinsics.cx, 319.5);
        assert_eq!(intrinsics.cy, 239.5);
        assert_relative_eq!(intrinsics.fx, intrinsics.fy, max_relative = 1e-12);
        assert_relative_eq!(intrinsics.fy, 590.0, max_relative = 0.01);
        assert!(rms(&cost) < 1e-3);
    }
}
