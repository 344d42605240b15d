//! Calibration record serialization and the image file-list reader.
//!
//! A record is a flat key-value document. Files ending in `.json` are
//! written as JSON, anything else as YAML. Matrices are stored as
//! `{ rows, cols, dt, data }` with `data` in row-major order.

use crate::camera::{Distortion, ViewPose};
use crate::optimization::CalibrationFlags;
use crate::pipeline::CalibrationResult;
use log::{debug, info};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use yaml_rust::{Yaml, YamlLoader};

/// Layout version written into every record.
pub const RECORD_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("Cannot open file: {0}")]
    CannotOpen(String),
    #[error("Cannot parse file: {0}")]
    CannotParse(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for RecordError {
    fn from(err: std::io::Error) -> Self {
        RecordError::CannotOpen(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for RecordError {
    fn from(err: yaml_rust::ScanError) -> Self {
        RecordError::CannotParse(err.to_string())
    }
}

impl From<serde_yaml::Error> for RecordError {
    fn from(err: serde_yaml::Error) -> Self {
        RecordError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        RecordError::Serialization(err.to_string())
    }
}

/// Dense matrix as stored in a record.
///
/// `dt` names the element type: `"d"` for one double per element, `"2d"`
/// for two doubles per element (image points).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRecord {
    pub rows: usize,
    pub cols: usize,
    pub dt: String,
    pub data: Vec<f64>,
}

impl MatrixRecord {
    pub fn from_matrix3(m: &Matrix3<f64>) -> Self {
        let data = (0..3)
            .flat_map(|r| (0..3).map(move |c| m[(r, c)]))
            .collect();
        MatrixRecord {
            rows: 3,
            cols: 3,
            dt: "d".to_string(),
            data,
        }
    }

    pub fn column(values: &[f64]) -> Self {
        MatrixRecord {
            rows: values.len(),
            cols: 1,
            dt: "d".to_string(),
            data: values.to_vec(),
        }
    }

    /// Builds a matrix from equally long rows.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R], dt: &str, channels: usize) -> Self {
        let width = rows.first().map_or(0, |r| r.as_ref().len());
        MatrixRecord {
            rows: rows.len(),
            cols: width / channels.max(1),
            dt: dt.to_string(),
            data: rows.iter().flat_map(|r| r.as_ref().iter().copied()).collect(),
        }
    }

    pub fn to_matrix3(&self) -> Option<Matrix3<f64>> {
        if self.rows != 3 || self.cols != 3 || self.data.len() != 9 {
            return None;
        }
        Some(Matrix3::from_row_slice(&self.data))
    }

    /// Row `index`, `None` when out of range or when the data is short.
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        if self.rows == 0 || index >= self.rows {
            return None;
        }
        let width = self.data.len() / self.rows;
        self.data.get(index * width..(index + 1) * width)
    }
}

/// On-disk form of a [`CalibrationResult`].
///
/// Optional keys are omitted when absent; readers must tolerate that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub calibration_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nframes: Option<usize>,
    pub image_width: u32,
    pub image_height: u32,
    pub board_width: u32,
    pub board_height: u32,
    pub square_size: f64,
    #[serde(
        rename = "aspectRatio",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub aspect_ratio: Option<f64>,
    pub flags: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags_description: Option<String>,
    pub camera_matrix: MatrixRecord,
    pub distortion_coefficients: MatrixRecord,
    pub avg_reprojection_error: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_view_reprojection_errors: Option<MatrixRecord>,
    /// One `[rx, ry, rz, tx, ty, tz]` row per view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extrinsic_parameters: Option<MatrixRecord>,
    /// One row per view, two values per corner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_points: Option<MatrixRecord>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    RECORD_VERSION
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

impl CalibrationRecord {
    pub fn from_result(
        result: &CalibrationResult,
        write_extrinsics: bool,
        write_points: bool,
    ) -> Self {
        let flags = result.flags;
        let nframes = result.nframes();

        let per_view_reprojection_errors = (!result.per_view_errors.is_empty())
            .then(|| MatrixRecord::column(&result.per_view_errors));

        let extrinsic_parameters = (write_extrinsics && !result.camera.poses.is_empty())
            .then(|| {
                let rows: Vec<[f64; 6]> = result.camera.poses.iter().map(|p| p.to_row()).collect();
                MatrixRecord::from_rows(&rows, "d", 1)
            });

        let image_points = (write_points && !result.observations.is_empty()).then(|| {
            let rows: Vec<Vec<f64>> = result
                .observations
                .iter()
                .map(|view| view.image_points.iter().flat_map(|p| [p.x, p.y]).collect())
                .collect();
            MatrixRecord::from_rows(&rows, "2d", 2)
        });

        CalibrationRecord {
            calibration_time: result.timestamp.format("%c").to_string(),
            nframes: (nframes > 0).then_some(nframes),
            image_width: result.resolution.width,
            image_height: result.resolution.height,
            board_width: result.board.width,
            board_height: result.board.height,
            square_size: result.board.square_size,
            aspect_ratio: flags.fix_aspect_ratio.then_some(result.aspect_ratio),
            flags: flags.bits(),
            flags_description: (!flags.is_empty()).then(|| flags.description()),
            camera_matrix: MatrixRecord::from_matrix3(&result.camera.camera_matrix()),
            distortion_coefficients: MatrixRecord::column(&result.camera.distortion.coefficients),
            avg_reprojection_error: result.aggregate_error,
            per_view_reprojection_errors,
            extrinsic_parameters,
            image_points,
            version: RECORD_VERSION,
        }
    }

    /// Writes the record, as JSON when `path` ends in `.json`, YAML otherwise.
    pub fn save(&self, path: &Path) -> Result<(), RecordError> {
        let contents = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };

        let mut file = fs::File::create(path)
            .map_err(|e| RecordError::CannotOpen(format!("{}: {e}", path.display())))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| RecordError::CannotOpen(format!("{}: {e}", path.display())))?;

        debug!("Wrote calibration record to {}", path.display());
        Ok(())
    }

    /// Reads a record written by [`CalibrationRecord::save`].
    pub fn load(path: &Path) -> Result<Self, RecordError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| RecordError::CannotOpen(format!("{}: {e}", path.display())))?;

        let record: CalibrationRecord = if is_json(path) {
            serde_json::from_str(&contents)
                .map_err(|e| RecordError::CannotParse(format!("{}: {e}", path.display())))?
        } else {
            serde_yaml::from_str(&contents)
                .map_err(|e| RecordError::CannotParse(format!("{}: {e}", path.display())))?
        };

        if record.version > RECORD_VERSION {
            return Err(RecordError::CannotParse(format!(
                "{}: unsupported record version {}",
                path.display(),
                record.version
            )));
        }
        Ok(record)
    }

    pub fn camera_matrix(&self) -> Option<Matrix3<f64>> {
        self.camera_matrix.to_matrix3()
    }

    pub fn distortion(&self) -> Option<Distortion> {
        Distortion::from_slice(&self.distortion_coefficients.data)
    }

    pub fn per_view_errors(&self) -> Vec<f64> {
        self.per_view_reprojection_errors
            .as_ref()
            .map(|m| m.data.clone())
            .unwrap_or_default()
    }

    /// Per-view poses, when extrinsics were written.
    pub fn poses(&self) -> Option<Vec<ViewPose>> {
        let extrinsics = self.extrinsic_parameters.as_ref()?;
        (0..extrinsics.rows)
            .map(|i| extrinsics.row(i).and_then(ViewPose::from_row))
            .collect()
    }

    pub fn calibration_flags(&self) -> CalibrationFlags {
        CalibrationFlags::from_bits(self.flags)
    }
}

/// Serializes `result` to `path`.
///
/// `write_extrinsics` adds the per-view poses and `write_points` the
/// detected corners.
///
/// # Errors
///
/// * [`RecordError::CannotOpen`] if the destination cannot be created or written.
/// * [`RecordError::Serialization`] if encoding fails.
pub fn write_record(
    path: impl AsRef<Path>,
    result: &CalibrationResult,
    write_extrinsics: bool,
    write_points: bool,
) -> Result<(), RecordError> {
    let path = path.as_ref();
    CalibrationRecord::from_result(result, write_extrinsics, write_points).save(path)?;
    info!("Calibration record saved to {}", path.display());
    Ok(())
}

/// Reads an ordered list of image paths.
///
/// The document's first top-level node, or the document itself, must be a
/// sequence of strings. A leading `%YAML:1.0` header line is accepted.
///
/// # Errors
///
/// * [`RecordError::CannotOpen`] if the file cannot be read.
/// * [`RecordError::CannotParse`] if the document is malformed or is not a
///   sequence of strings.
pub fn read_file_list(path: impl AsRef<Path>) -> Result<Vec<PathBuf>, RecordError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|e| RecordError::CannotOpen(format!("{}: {e}", path.display())))?;

    let body = match contents.strip_prefix("%YAML:") {
        Some(rest) => rest.split_once('\n').map_or("", |(_, body)| body),
        None => contents.as_str(),
    };

    let docs = YamlLoader::load_from_str(body)?;
    let doc = docs
        .first()
        .ok_or_else(|| RecordError::CannotParse(format!("{}: empty document", path.display())))?;

    let sequence = match doc {
        Yaml::Array(items) => items,
        Yaml::Hash(map) => match map.iter().next() {
            Some((_, Yaml::Array(items))) => items,
            _ => {
                return Err(RecordError::CannotParse(format!(
                    "{}: first top-level node is not a sequence",
                    path.display()
                )))
            }
        },
        _ => {
            return Err(RecordError::CannotParse(format!(
                "{}: document is not a sequence",
                path.display()
            )))
        }
    };

    sequence
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str().map(PathBuf::from).ok_or_else(|| {
                RecordError::CannotParse(format!("{}: entry {i} is not a string", path.display()))
            })
        })
        .collect()
}
