//! Reprojection error of a calibrated model against its observations.

use crate::board::ModelPointSet;
use crate::camera::CameraModel;
use crate::observation::ViewObservation;
use log::warn;
use serde::{Deserialize, Serialize};

/// Per-view RMS errors and the global RMS over every corner, in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionErrors {
    pub per_view: Vec<f64>,
    pub aggregate: f64,
}

/// Distribution of the per-corner distances, in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionStatistics {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

/// Squared distance between the projected and observed corners of one view.
fn view_squared_norm(
    model_points: &ModelPointSet,
    camera: &CameraModel,
    view: usize,
    observation: &ViewObservation,
) -> Option<(f64, usize)> {
    let projected = camera.project_view(view, model_points.points())?;
    if projected.len() != observation.len() {
        warn!(
            "View {view} has {} image points for {} board points, comparing the common prefix",
            observation.len(),
            projected.len()
        );
    }
    let squared_norm: f64 = projected
        .iter()
        .zip(observation.image_points.iter())
        .map(|(p, o)| (p - o).norm_squared())
        .sum();
    Some((squared_norm, projected.len().min(observation.len())))
}

/// Global RMS from `(squared_norm, point_count)` pairs:
/// `sqrt(Σ squared_norm / Σ point_count)`.
///
/// Returns 0 when there are no points.
///
/// # Examples
///
/// ```rust
/// use pinhole_calib::reprojection::aggregate_rms;
///
/// let aggregate = aggregate_rms(&[(4.0, 10), (9.0, 10)]);
/// assert!((aggregate - (13.0f64 / 20.0).sqrt()).abs() < 1e-12);
/// ```
pub fn aggregate_rms(views: &[(f64, usize)]) -> f64 {
    let (total_error, total_points) = views
        .iter()
        .fold((0.0, 0usize), |(e, n), (se, count)| (e + se, n + count));
    if total_points == 0 {
        return 0.0;
    }
    (total_error / total_points as f64).sqrt()
}

/// Per-view and aggregate reprojection error.
///
/// View `i` is projected through pose `i` of `camera`. Views without a
/// matching pose are skipped, so `per_view` has one entry per posed view.
pub fn evaluate(
    observations: &[ViewObservation],
    model_points: &ModelPointSet,
    camera: &CameraModel,
) -> ReprojectionErrors {
    if camera.view_count() != observations.len() {
        warn!(
            "Evaluating {} views against {} poses, unposed views are skipped",
            observations.len(),
            camera.view_count()
        );
    }
    let norms: Vec<(f64, usize)> = observations
        .iter()
        .enumerate()
        .filter_map(|(view, observation)| {
            view_squared_norm(model_points, camera, view, observation)
        })
        .collect();

    let per_view = norms
        .iter()
        .map(|&(squared_norm, count)| {
            if count == 0 {
                0.0
            } else {
                (squared_norm / count as f64).sqrt()
            }
        })
        .collect();

    ReprojectionErrors {
        per_view,
        aggregate: aggregate_rms(&norms),
    }
}

/// Statistics of the per-corner distances over every view.
///
/// Returns `None` when there is nothing to measure.
pub fn point_statistics(
    observations: &[ViewObservation],
    model_points: &ModelPointSet,
    camera: &CameraModel,
) -> Option<ProjectionStatistics> {
    let mut errors = Vec::new();
    for (view, observation) in observations.iter().enumerate() {
        let Some(projected) = camera.project_view(view, model_points.points()) else {
            continue;
        };
        errors.extend(
            projected
                .iter()
                .zip(observation.image_points.iter())
                .map(|(p, o)| (p - o).norm()),
        );
    }

    if errors.is_empty() {
        return None;
    }

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    errors.sort_by(|a, b| a.total_cmp(b));
    let mid = errors.len() / 2;
    let median = if errors.len() % 2 == 0 {
        (errors[mid - 1] + errors[mid]) / 2.0
    } else {
        errors[mid]
    };

    Some(ProjectionStatistics {
        rmse,
        min,
        max,
        mean,
        stddev: variance.sqrt(),
        median,
    })
}
