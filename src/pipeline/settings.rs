//! Run configuration loaded from YAML.

use crate::board::{BoardError, BoardSpec};
use crate::camera::Intrinsics;
use crate::optimization::{CalibrationFlags, SolverOptions, DEFAULT_MAX_ITERATIONS};
use crate::pipeline::CalibrationError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_square_size() -> f64 {
    1.0
}

fn default_output() -> PathBuf {
    PathBuf::from("out_camera_data.yml")
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

/// Everything a calibration run needs besides the images.
///
/// ```yaml
/// board_width: 9
/// board_height: 6
/// square_size: 0.025
/// aspect_ratio: 1.0        # presence fixes fx / fy
/// zero_tangent_dist: true
/// output: camera.yml
/// write_extrinsics: true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    pub board_width: u32,
    pub board_height: u32,
    #[serde(default = "default_square_size")]
    pub square_size: f64,
    #[serde(default)]
    pub aspect_ratio: Option<f64>,
    #[serde(default)]
    pub zero_tangent_dist: bool,
    #[serde(default)]
    pub fix_principal_point: bool,
    #[serde(default)]
    pub fix_k3: bool,
    #[serde(default)]
    pub use_intrinsic_guess: bool,
    #[serde(default)]
    pub intrinsic_guess: Option<Intrinsics>,
    #[serde(default = "default_output")]
    pub output: PathBuf,
    #[serde(default)]
    pub write_extrinsics: bool,
    #[serde(default)]
    pub write_points: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub verbose: bool,
}

impl CalibrationSettings {
    /// Settings for a board with every option at its default.
    pub fn new(board_width: u32, board_height: u32, square_size: f64) -> Self {
        CalibrationSettings {
            board_width,
            board_height,
            square_size,
            aspect_ratio: None,
            zero_tangent_dist: false,
            fix_principal_point: false,
            fix_k3: false,
            use_intrinsic_guess: false,
            intrinsic_guess: None,
            output: default_output(),
            write_extrinsics: false,
            write_points: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            verbose: false,
        }
    }

    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| CalibrationError::Settings(format!("{}: {e}", path.display())))?;
        let settings: CalibrationSettings = serde_yaml::from_str(&contents)
            .map_err(|e| CalibrationError::Settings(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks the settings before any image is processed.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        self.board()?;
        if let Some(aspect) = self.aspect_ratio {
            if !aspect.is_finite() || aspect <= 0.0 {
                return Err(CalibrationError::Settings(format!(
                    "invalid aspect ratio {aspect}"
                )));
            }
        }
        if self.max_iterations == 0 {
            return Err(CalibrationError::Settings(
                "max_iterations must be positive".to_string(),
            ));
        }
        if self.use_intrinsic_guess && self.intrinsic_guess.is_none() {
            return Err(CalibrationError::Settings(
                "use_intrinsic_guess requires intrinsic_guess".to_string(),
            ));
        }
        Ok(())
    }

    pub fn board(&self) -> Result<BoardSpec, BoardError> {
        BoardSpec::new(self.board_width, self.board_height, self.square_size)
    }

    pub fn flags(&self) -> CalibrationFlags {
        CalibrationFlags {
            use_intrinsic_guess: self.use_intrinsic_guess,
            fix_aspect_ratio: self.aspect_ratio.is_some(),
            fix_principal_point: self.fix_principal_point,
            zero_tangent_dist: self.zero_tangent_dist,
            fix_k3: self.fix_k3,
        }
    }

    pub fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            aspect_ratio: self.aspect_ratio.unwrap_or(1.0),
            intrinsic_guess: self.intrinsic_guess,
            max_iterations: self.max_iterations,
            verbose: self.verbose,
        }
    }
}
