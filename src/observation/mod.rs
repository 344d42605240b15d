//! Append-only store of per-view corner detections.
//!
//! Every view is aligned index-for-index with one shared [`ModelPointSet`].
//! The first accepted view fixes the image resolution of the run; later views
//! must match it.

use crate::board::ModelPointSet;
use crate::camera::Resolution;
use log::debug;
use nalgebra::{Vector2, Vector3};
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ObservationError {
    #[error("Expected {expected} image points, found {found}")]
    CountMismatch { expected: usize, found: usize },
    #[error("Image size {found} differs from the {expected} of earlier views")]
    SizeMismatch {
        expected: Resolution,
        found: Resolution,
    },
}

/// Detected image positions of the board corners in one view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewObservation {
    pub image_points: Vec<Vector2<f64>>,
}

impl ViewObservation {
    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ObservationStore {
    model_points: Arc<ModelPointSet>,
    views: Vec<ViewObservation>,
    resolution: Option<Resolution>,
}

impl ObservationStore {
    pub fn new(model_points: Arc<ModelPointSet>) -> Self {
        ObservationStore {
            model_points,
            views: Vec::new(),
            resolution: None,
        }
    }

    /// Appends one view.
    ///
    /// On error the store is left unchanged.
    pub fn add_view(
        &mut self,
        image_points: Vec<Vector2<f64>>,
        resolution: Resolution,
    ) -> Result<(), ObservationError> {
        let expected = self.model_points.len();
        if image_points.len() != expected {
            return Err(ObservationError::CountMismatch {
                expected,
                found: image_points.len(),
            });
        }

        match self.resolution {
            Some(established) if established != resolution => {
                return Err(ObservationError::SizeMismatch {
                    expected: established,
                    found: resolution,
                });
            }
            Some(_) => {}
            None => self.resolution = Some(resolution),
        }

        self.views.push(ViewObservation { image_points });
        debug!("Accepted view {} ({} points)", self.views.len(), expected);
        Ok(())
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Views in insertion order.
    pub fn views(&self) -> &[ViewObservation] {
        &self.views
    }

    /// Resolution shared by all views, `None` before the first view.
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn model_points(&self) -> &Arc<ModelPointSet> {
        &self.model_points
    }

    /// Pairs of (board point, image point) for view `index`.
    pub fn correspondences(
        &self,
        index: usize,
    ) -> Option<impl Iterator<Item = (&Vector3<f64>, &Vector2<f64>)>> {
        let view = self.views.get(index)?;
        Some(self.model_points.points().iter().zip(view.image_points.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{generate_model_points, BoardSpec};

    fn store_for(width: u32, height: u32) -> ObservationStore {
        let board = BoardSpec::new(width, height, 1.0).unwrap();
        ObservationStore::new(Arc::new(generate_model_points(&board).unwrap()))
    }

    fn points(n: usize) -> Vec<Vector2<f64>> {
        (0..n).map(|i| Vector2::new(i as f64, 2.0 * i as f64)).collect()
    }

    #[test]
    fn test_add_view_appends_in_order() {
        let mut store = store_for(3, 2);
        let resolution = Resolution::new(640, 480);
        store.add_view(points(6), resolution).unwrap();
        let mut second = points(6);
        second[0].x = 99.0;
        store.add_view(second, resolution).unwrap();

        assert_eq!(store.view_count(), 2);
        assert_eq!(store.resolution(), Some(resolution));
        assert_eq!(store.views()[1].image_points[0].x, 99.0);
        let pairs: Vec<_> = store.correspondences(0).unwrap().collect();
        assert_eq!(pairs.len(), 6);
        assert_eq!(pairs[5].0.x, 2.0);
        assert_eq!(pairs[5].1.y, 10.0);
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let mut store = store_for(9, 6);
        let resolution = Resolution::new(640, 480);
        store.add_view(points(54), resolution).unwrap();

        let result = store.add_view(points(53), resolution);
        assert_eq!(
            result,
            Err(ObservationError::CountMismatch {
                expected: 54,
                found: 53
            })
        );
        assert_eq!(store.view_count(), 1);
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let mut store = store_for(3, 2);
        store.add_view(points(6), Resolution::new(640, 480)).unwrap();
        let result = store.add_view(points(6), Resolution::new(800, 600));
        assert!(matches!(result, Err(ObservationError::SizeMismatch { .. })));
        assert_eq!(store.view_count(), 1);
        assert_eq!(store.resolution(), Some(Resolution::new(640, 480)));
    }

    #[test]
    fn test_rejected_first_view_does_not_fix_resolution() {
        let mut store = store_for(3, 2);
        assert!(store.add_view(points(5), Resolution::new(800, 600)).is_err());
        assert!(store.is_empty());
        assert_eq!(store.resolution(), None);
        store.add_view(points(6), Resolution::new(640, 480)).unwrap();
        assert_eq!(store.resolution(), Some(Resolution::new(640, 480)));
    }
}
