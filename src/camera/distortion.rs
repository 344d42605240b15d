//! Rational radial + tangential lens distortion.
//!
//! The coefficient vector is ordered `[k1, k2, p1, p2, k3, k4, k5, k6]`:
//! * `k1`, `k2`, `k3`: radial numerator coefficients.
//! * `k4`, `k5`, `k6`: radial denominator coefficients.
//! * `p1`, `p2`: tangential coefficients.
//!
//! A normalized point `(x, y)` with `r² = x² + y²` is distorted as
//!
//! ```text
//! radial = (1 + k1 r² + k2 r⁴ + k3 r⁶) / (1 + k4 r² + k5 r⁴ + k6 r⁶)
//! x' = x radial + 2 p1 x y + p2 (r² + 2 x²)
//! y' = y radial + p1 (r² + 2 y²) + 2 p2 x y
//! ```

use nalgebra::RealField;
use serde::{Deserialize, Serialize};

/// Length of the distortion coefficient vector.
pub const DISTORTION_COEFFICIENT_COUNT: usize = 8;

pub const K1: usize = 0;
pub const K2: usize = 1;
pub const P1: usize = 2;
pub const P2: usize = 3;
pub const K3: usize = 4;
pub const K4: usize = 5;
pub const K5: usize = 6;
pub const K6: usize = 7;

/// Coefficients the solver always holds at zero, whatever the caller's flags.
///
/// `k4` and `k5` are part of the modeling policy of this calibration: the
/// rational denominator is never estimated from planar views. They are
/// written to the record as zeros so consumers see the full 8-vector.
pub const ALWAYS_FIXED_COEFFICIENTS: [usize; 2] = [K4, K5];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub coefficients: [f64; DISTORTION_COEFFICIENT_COUNT],
}

impl Distortion {
    pub fn zero() -> Self {
        Distortion {
            coefficients: [0.0; DISTORTION_COEFFICIENT_COUNT],
        }
    }

    /// Builds the 8-vector from the usual five `k1, k2, p1, p2, k3`.
    pub fn from_rad_tan(k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) -> Self {
        let mut coefficients = [0.0; DISTORTION_COEFFICIENT_COUNT];
        coefficients[K1] = k1;
        coefficients[K2] = k2;
        coefficients[P1] = p1;
        coefficients[P2] = p2;
        coefficients[K3] = k3;
        Distortion { coefficients }
    }

    /// Reads a coefficient slice of up to 8 values; missing entries are zero.
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        if values.len() > DISTORTION_COEFFICIENT_COUNT {
            return None;
        }
        let mut coefficients = [0.0; DISTORTION_COEFFICIENT_COUNT];
        coefficients[..values.len()].copy_from_slice(values);
        Some(Distortion { coefficients })
    }

    pub fn is_finite(&self) -> bool {
        self.coefficients.iter().all(|c| c.is_finite())
    }

    pub fn k1(&self) -> f64 {
        self.coefficients[K1]
    }

    pub fn k2(&self) -> f64 {
        self.coefficients[K2]
    }

    pub fn p1(&self) -> f64 {
        self.coefficients[P1]
    }

    pub fn p2(&self) -> f64 {
        self.coefficients[P2]
    }

    pub fn k3(&self) -> f64 {
        self.coefficients[K3]
    }

    /// Distorts a normalized image point.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        distort_generic(x, y, &self.coefficients)
    }
}

impl Default for Distortion {
    fn default() -> Self {
        Distortion::zero()
    }
}

/// Applies the distortion model to a normalized point.
///
/// Generic over [`RealField`] so the optimizer can evaluate it on dual
/// numbers. `coefficients` must hold [`DISTORTION_COEFFICIENT_COUNT`] values.
pub fn distort_generic<T: RealField>(x: T, y: T, coefficients: &[T]) -> (T, T) {
    let k1 = coefficients[K1].clone();
    let k2 = coefficients[K2].clone();
    let p1 = coefficients[P1].clone();
    let p2 = coefficients[P2].clone();
    let k3 = coefficients[K3].clone();
    let k4 = coefficients[K4].clone();
    let k5 = coefficients[K5].clone();
    let k6 = coefficients[K6].clone();

    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();

    let numerator = T::one() + k1 * r2.clone() + k2 * r4.clone() + k3 * r6.clone();
    let denominator = T::one() + k4 * r2.clone() + k5 * r4 + k6 * r6;
    let radial = numerator / denominator;

    let two = T::one() + T::one();
    let xy = x.clone() * y.clone();
    let x2 = x.clone() * x.clone();
    let y2 = y.clone() * y.clone();

    let x_tan =
        two.clone() * p1.clone() * xy.clone() + p2.clone() * (r2.clone() + two.clone() * x2);
    let y_tan = p1 * (r2 + two.clone() * y2) + two * p2 * xy;

    (x * radial.clone() + x_tan, y * radial + y_tan)
}
