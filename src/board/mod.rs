//! Known geometry of the planar calibration board.
//!
//! The board is a grid of `width × height` inner corners spaced
//! `square_size` apart. Its corners live in the board plane `z = 0`, with the
//! first corner at the origin, `x` growing along a row and `y` growing down
//! the columns.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BoardError {
    #[error("Invalid board geometry: {0}")]
    InvalidGeometry(String),
}

/// Inner-corner layout of a chessboard-style target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardSpec {
    /// Inner corners per row.
    pub width: u32,
    /// Inner corners per column.
    pub height: u32,
    /// Distance between neighbouring corners, in user units.
    pub square_size: f64,
}

impl BoardSpec {
    pub fn new(width: u32, height: u32, square_size: f64) -> Result<Self, BoardError> {
        let board = BoardSpec {
            width,
            height,
            square_size,
        };
        board.validate()?;
        Ok(board)
    }

    pub fn validate(&self) -> Result<(), BoardError> {
        if self.width == 0 || self.height == 0 {
            return Err(BoardError::InvalidGeometry(format!(
                "board must have at least one corner per side, got {}x{}",
                self.width, self.height
            )));
        }
        if !self.square_size.is_finite() || self.square_size <= 0.0 {
            return Err(BoardError::InvalidGeometry(format!(
                "square size must be positive, got {}",
                self.square_size
            )));
        }
        Ok(())
    }

    pub fn corner_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Board corners in row-major order, shared by every view of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPointSet {
    board: BoardSpec,
    points: Vec<Vector3<f64>>,
}

impl ModelPointSet {
    pub fn board(&self) -> &BoardSpec {
        &self.board
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Corner at grid position (`row`, `col`), `None` outside the grid.
    pub fn point(&self, row: u32, col: u32) -> Option<&Vector3<f64>> {
        if row >= self.board.height || col >= self.board.width {
            return None;
        }
        self.points
            .get(row as usize * self.board.width as usize + col as usize)
    }
}

/// Generates the board's corner coordinates.
///
/// Index `row * width + col` holds `(col * square_size, row * square_size, 0)`.
///
/// # Examples
///
/// ```rust
/// use pinhole_calib::board::{generate_model_points, BoardSpec};
///
/// let board = BoardSpec { width: 3, height: 2, square_size: 1.0 };
/// let points = generate_model_points(&board).unwrap();
/// assert_eq!(points.len(), 6);
/// assert_eq!(points.points()[5].x, 2.0);
/// assert_eq!(points.points()[5].y, 1.0);
/// ```
pub fn generate_model_points(board: &BoardSpec) -> Result<ModelPointSet, BoardError> {
    board.validate()?;

    let mut points = Vec::with_capacity(board.corner_count());
    for row in 0..board.height {
        for col in 0..board.width {
            points.push(Vector3::new(
                col as f64 * board.square_size,
                row as f64 * board.square_size,
                0.0,
            ));
        }
    }

    Ok(ModelPointSet {
        board: *board,
        points,
    })
}
