//! Pinhole Calibration Library
//!
//! Estimates the intrinsics, lens distortion and per-view poses of a pinhole
//! camera from several views of a planar chessboard-style target.
//! The library provides:
//! - The board geometry model and an append-only observation store
//! - Linear initialisation and joint Levenberg-Marquardt refinement
//!   using the tiny-solver optimization framework
//! - Per-view and global RMS reprojection error
//! - A versioned YAML/JSON calibration record and an image file-list reader
//! - A pipeline tying these together behind a pluggable feature extractor

pub mod board;
pub mod camera;
pub mod observation;
pub mod optimization;
pub mod pipeline;
pub mod record;
pub mod reprojection;

// Re-export commonly used types
pub use board::{generate_model_points, BoardError, BoardSpec, ModelPointSet};
pub use camera::{
    CameraModel, CameraModelError, Distortion, Intrinsics, Resolution, ViewPose,
    ALWAYS_FIXED_COEFFICIENTS,
};
pub use observation::{ObservationError, ObservationStore, ViewObservation};
pub use optimization::{solve, CalibrationFlags, Optimizer, SolverError, SolverOptions};
pub use pipeline::{
    calibrate, calibrate_and_save, collect_observations, run_calibration, CalibrationError,
    CalibrationResult, CalibrationSettings, Detection, FeatureExtractor,
};
pub use record::{read_file_list, write_record, CalibrationRecord, RecordError};
pub use reprojection::{evaluate, ReprojectionErrors};
