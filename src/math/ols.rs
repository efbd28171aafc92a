//! Least squares solver.
//!
//! Both the band-limited model and the initial wavelength solution solve
//! problems of the form:
//!
//! ```text
//! minimize || X β - y ||^2
//! ```
//!
//! Implementation choices:
//! - SVD handles tall and rank-deficient design matrices.
//!   (Nalgebra's `QR::solve` is intended for square systems.)
//! - Singular values below `rcond * s_max` are treated as zero.

use nalgebra::{DMatrix, DVector};

/// Solution of a least-squares problem with its effective rank.
#[derive(Debug, Clone)]
pub struct LstsqSolution {
    pub coeffs: DVector<f64>,
    pub rank: usize,
    pub singular_values: Vec<f64>,
}

/// Solve a least squares problem using SVD with a relative singular-value cutoff.
///
/// Returns `None` if the solve fails or produces non-finite coefficients.
pub fn lstsq(x: &DMatrix<f64>, y: &DVector<f64>, rcond: f64) -> Option<LstsqSolution> {
    if x.nrows() != y.len() || x.ncols() == 0 {
        return None;
    }
    let svd = x.clone().svd(true, true);
    let s_max = svd.singular_values.iter().copied().fold(0.0f64, f64::max);
    if !(s_max > 0.0 && s_max.is_finite()) {
        return None;
    }
    let eps = rcond.max(0.0) * s_max;
    let rank = svd.singular_values.iter().filter(|&&s| s > eps).count();
    let singular_values = svd.singular_values.iter().copied().collect();
    let coeffs = svd.solve(y, eps).ok()?;
    if coeffs.iter().all(|v| v.is_finite()) {
        Some(LstsqSolution {
            coeffs,
            rank,
            singular_values,
        })
    } else {
        None
    }
}

/// Coefficient-only convenience wrapper around [`lstsq`].
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>, rcond: f64) -> Option<DVector<f64>> {
    lstsq(x, y, rcond).map(|s| s.coeffs)
}
