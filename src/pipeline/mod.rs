//! End-to-end calibration run: collect detections, solve, evaluate, save.
//!
//! Corner detection itself is outside this crate; callers plug it in through
//! the [`FeatureExtractor`] trait.

pub mod settings;

pub use settings::CalibrationSettings;

use crate::board::{generate_model_points, BoardError, BoardSpec};
use crate::camera::{CameraModel, Resolution};
use crate::observation::{ObservationError, ObservationStore, ViewObservation};
use crate::optimization::{self, CalibrationFlags, SolverError, SolverOptions};
use crate::record::{write_record, RecordError};
use crate::reprojection::{self, ReprojectionErrors};
use chrono::{DateTime, Local};
use log::{info, warn};
use nalgebra::Vector2;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Failure of a calibration run, tagged with the stage that failed.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid board: {0}")]
    Board(#[from] BoardError),
    #[error("Feature extraction failed on {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },
    #[error("Calibration failed: {0}")]
    Solver(#[from] SolverError),
    #[error("Writing the record failed: {0}")]
    Record(#[from] RecordError),
    #[error("Invalid settings: {0}")]
    Settings(String),
}

/// Corners found in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub image_points: Vec<Vector2<f64>>,
    pub resolution: Resolution,
}

/// Source of per-image corner detections.
pub trait FeatureExtractor {
    type Error: fmt::Display;

    /// Detects the board corners in `path`.
    ///
    /// `Ok(None)` means the image was read but the pattern was not found.
    /// Corners must be returned in the row-major order of the board.
    fn detect(&mut self, path: &Path, board: &BoardSpec) -> Result<Option<Detection>, Self::Error>;
}

/// Outcome of [`collect_observations`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionSummary {
    /// Files whose detections were added to the store, in order.
    pub accepted: Vec<PathBuf>,
    pub not_found: Vec<PathBuf>,
    pub rejected: Vec<(PathBuf, ObservationError)>,
}

impl CollectionSummary {
    pub fn attempted(&self) -> usize {
        self.accepted.len() + self.not_found.len() + self.rejected.len()
    }
}

/// Runs the extractor over `files` and appends every usable view to `store`.
///
/// Images without a detected pattern and views the store rejects are logged
/// and skipped. An extractor error aborts the collection.
pub fn collect_observations<E: FeatureExtractor>(
    files: &[PathBuf],
    extractor: &mut E,
    store: &mut ObservationStore,
) -> Result<CollectionSummary, CalibrationError> {
    let board = *store.model_points().board();
    let mut summary = CollectionSummary::default();

    for path in files {
        let detection =
            extractor
                .detect(path, &board)
                .map_err(|e| CalibrationError::Extraction {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;

        let Some(detection) = detection else {
            warn!("Chessboard corners not found in image: {}", path.display());
            summary.not_found.push(path.clone());
            continue;
        };

        match store.add_view(detection.image_points, detection.resolution) {
            Ok(()) => summary.accepted.push(path.clone()),
            Err(err) => {
                warn!("Skipping {}: {err}", path.display());
                summary.rejected.push((path.clone(), err));
            }
        }
    }

    info!(
        "Collected {}/{} views",
        summary.accepted.len(),
        summary.attempted()
    );
    Ok(summary)
}

/// Everything known about one finished calibration.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub camera: CameraModel,
    pub per_view_errors: Vec<f64>,
    pub aggregate_error: f64,
    /// The refined intrinsics and distortion passed the range check.
    ///
    /// [`calibrate`] only returns finite models, so this is always `true` on
    /// `Ok`; records read back from elsewhere may carry `false`.
    pub success: bool,
    pub timestamp: DateTime<Local>,
    pub board: BoardSpec,
    pub resolution: Resolution,
    pub flags: CalibrationFlags,
    pub aspect_ratio: f64,
    pub observations: Vec<ViewObservation>,
}

impl CalibrationResult {
    /// Number of views that took part in the calibration.
    pub fn nframes(&self) -> usize {
        self.observations.len()
    }

    pub fn errors(&self) -> ReprojectionErrors {
        ReprojectionErrors {
            per_view: self.per_view_errors.clone(),
            aggregate: self.aggregate_error,
        }
    }
}

/// Solves the camera from every view in `store` and evaluates the result.
pub fn calibrate(
    store: &ObservationStore,
    flags: CalibrationFlags,
    options: &SolverOptions,
) -> Result<CalibrationResult, CalibrationError> {
    let resolution = store.resolution().ok_or(SolverError::NoViews)?;
    let model_points = store.model_points();

    let camera = optimization::solve(store.views(), model_points, resolution, flags, options)?;
    let errors = reprojection::evaluate(store.views(), model_points, &camera);
    let success = camera.is_finite();

    Ok(CalibrationResult {
        camera,
        per_view_errors: errors.per_view,
        aggregate_error: errors.aggregate,
        success,
        timestamp: Local::now(),
        board: *model_points.board(),
        resolution,
        flags,
        aspect_ratio: options.aspect_ratio,
        observations: store.views().to_vec(),
    })
}

/// Calibrates with `settings` and writes the record to `settings.output`.
pub fn calibrate_and_save(
    store: &ObservationStore,
    settings: &CalibrationSettings,
) -> Result<CalibrationResult, CalibrationError> {
    settings.validate()?;
    let result = calibrate(store, settings.flags(), &settings.solver_options())?;

    info!(
        "Calibration succeeded. avg reprojection error = {:.6}",
        result.aggregate_error
    );

    write_record(
        &settings.output,
        &result,
        settings.write_extrinsics,
        settings.write_points,
    )?;
    Ok(result)
}

/// Full run over a file list: board model, collection, calibration, record.
pub fn run_calibration<E: FeatureExtractor>(
    settings: &CalibrationSettings,
    files: &[PathBuf],
    extractor: &mut E,
) -> Result<(CalibrationResult, CollectionSummary), CalibrationError> {
    settings.validate()?;
    let board = settings.board()?;
    let model_points = Arc::new(generate_model_points(&board)?);

    let mut store = ObservationStore::new(model_points);
    let summary = collect_observations(files, extractor, &mut store)?;
    let result = calibrate_and_save(&store, settings)?;
    Ok((result, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{project_point, Distortion, Intrinsics, ViewPose};
    use crate::record::CalibrationRecord;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// Replays canned detections keyed by file name.
    struct ScriptedExtractor {
        detections: HashMap<PathBuf, Option<Detection>>,
    }

    impl FeatureExtractor for ScriptedExtractor {
        type Error = String;

        fn detect(&mut self, path: &Path, _board: &BoardSpec) -> Result<Option<Detection>, String> {
            self.detections
                .get(path)
                .cloned()
                .ok_or_else(|| format!("cannot read {}", path.display()))
        }
    }

    fn truth() -> Intrinsics {
        Intrinsics {
            fx: 600.0,
            fy: 590.0,
            cx: 320.0,
            cy: 240.0,
        }
    }

    fn synthetic_detection(board: &BoardSpec, pose: &ViewPose) -> Detection {
        let points = generate_model_points(board).unwrap();
        Detection {
            image_points: points
                .points()
                .iter()
                .map(|p| project_point(&truth(), &Distortion::zero(), pose, p))
                .collect(),
            resolution: Resolution::new(640, 480),
        }
    }

    fn scripted(board: &BoardSpec) -> (Vec<PathBuf>, ScriptedExtractor) {
        let poses = [
            ViewPose::new(Vector3::new(0.3, -0.2, 0.1), Vector3::new(-0.04, -0.05, 0.3)),
            ViewPose::new(Vector3::new(-0.25, 0.3, -0.05), Vector3::new(-0.03, -0.06, 0.32)),
            ViewPose::new(Vector3::new(0.1, 0.35, 0.2), Vector3::new(-0.05, -0.04, 0.28)),
        ];
        let mut detections = HashMap::new();
        let mut files = Vec::new();
        for (i, pose) in poses.iter().enumerate() {
            let path = PathBuf::from(format!("view{i}.png"));
            detections.insert(path.clone(), Some(synthetic_detection(board, pose)));
            files.push(path);
        }

        let blurry = PathBuf::from("blurry.png");
        detections.insert(blurry.clone(), None);
        files.insert(1, blurry);

        let mut other_size = synthetic_detection(board, &poses[0]);
        other_size.resolution = Resolution::new(800, 600);
        let resized = PathBuf::from("resized.png");
        detections.insert(resized.clone(), Some(other_size));
        files.push(resized);

        (files, ScriptedExtractor { detections })
    }

    fn new_store(board: &BoardSpec) -> ObservationStore {
        ObservationStore::new(Arc::new(generate_model_points(board).unwrap()))
    }

    #[test]
    fn test_collect_observations_skips_bad_views() {
        let board = BoardSpec::new(4, 5, 0.025).unwrap();
        let (files, mut extractor) = scripted(&board);
        let mut store = new_store(&board);

        let summary = collect_observations(&files, &mut extractor, &mut store).unwrap();
        assert_eq!(summary.attempted(), 5);
        assert_eq!(summary.accepted.len(), 3);
        assert_eq!(summary.not_found, vec![PathBuf::from("blurry.png")]);
        assert_eq!(summary.rejected.len(), 1);
        assert!(matches!(
            summary.rejected[0].1,
            ObservationError::SizeMismatch { .. }
        ));
        assert_eq!(store.view_count(), 3);
    }

    #[test]
    fn test_extractor_error_aborts_collection() {
        let board = BoardSpec::new(4, 5, 0.025).unwrap();
        let (_, mut extractor) = scripted(&board);
        let mut store = new_store(&board);
        let files = vec![PathBuf::from("view0.png"), PathBuf::from("unreadable.png")];

        let result = collect_observations(&files, &mut extractor, &mut store);
        assert!(matches!(result, Err(CalibrationError::Extraction { .. })));
        assert_eq!(store.view_count(), 1);
    }

    #[test]
    fn test_calibrate_empty_store() {
        let board = BoardSpec::new(4, 5, 0.025).unwrap();
        let store = new_store(&board);
        let result = calibrate(&store, CalibrationFlags::default(), &SolverOptions::default());
        assert!(matches!(
            result,
            Err(CalibrationError::Solver(SolverError::NoViews))
        ));
    }

    #[test]
    fn test_run_calibration_writes_record() {
        let dir = tempdir().unwrap();
        let board = BoardSpec::new(4, 5, 0.025).unwrap();
        let (files, mut extractor) = scripted(&board);

        let mut settings = CalibrationSettings::new(4, 5, 0.025);
        settings.zero_tangent_dist = true;
        settings.fix_k3 = true;
        settings.write_extrinsics = true;
        settings.output = dir.path().join("camera.yml");

        let (result, summary) = run_calibration(&settings, &files, &mut extractor).unwrap();
        assert_eq!(summary.accepted.len(), 3);
        assert!(result.success);
        assert_eq!(result.nframes(), 3);
        assert!(result.aggregate_error < 1e-3);
        assert_relative_eq!(result.camera.intrinsics.fx, 600.0, max_relative = 0.01);
        assert_relative_eq!(result.camera.intrinsics.fy, 590.0, max_relative = 0.01);

        let record = CalibrationRecord::load(&settings.output).unwrap();
        assert_eq!(record.nframes, Some(3));
        assert_eq!(record.flags, CalibrationFlags::ZERO_TANGENT_DIST | CalibrationFlags::FIX_K3);
        assert_eq!(record.poses().unwrap().len(), 3);
        assert!(record.image_points.is_none());
    }
}
