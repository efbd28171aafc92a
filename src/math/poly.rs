//! Ascending-order polynomials: `poly(x, a) = a0 + a1 x + a2 x^2 + ...`.

use nalgebra::{DMatrix, DVector};

use crate::error::AppError;
use crate::math::ols::solve_least_squares;

/// Horner evaluation; an empty coefficient list evaluates to zero.
pub fn poly(x: f64, coeffs: &[f64]) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &a| acc * x + a)
}

/// Rational polynomial `poly(x, a) / (1 + x poly(x, b))`.
pub fn pade(x: f64, numerator: &[f64], denominator: &[f64]) -> f64 {
    poly(x, numerator) / (1.0 + x * poly(x, denominator))
}

/// Least-squares polynomial of `degree` through `(x, y)`, ascending coefficients.
pub fn polyfit(x: &[f64], y: &[f64], degree: usize) -> Result<Vec<f64>, AppError> {
    if x.len() != y.len() {
        return Err(AppError::input("polyfit: x and y lengths differ."));
    }
    let n = x.len();
    let p = degree + 1;
    if n < p {
        return Err(AppError::input(format!(
            "polyfit: {n} points cannot determine a degree-{degree} polynomial."
        )));
    }

    // Scale the abscissa to [-1, 1] to keep the Vandermonde matrix well conditioned.
    let scale = x.iter().fold(0.0f64, |m, v| m.max(v.abs())).max(1.0);
    let design = DMatrix::from_fn(n, p, |i, j| (x[i] / scale).powi(j as i32));
    let rhs = DVector::from_column_slice(y);
    let scaled = solve_least_squares(&design, &rhs, 1e-14)
        .ok_or_else(|| AppError::numerical("polyfit: singular design matrix."))?;
    Ok(scaled
        .iter()
        .enumerate()
        .map(|(j, c)| c / scale.powi(j as i32))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poly_is_ascending() {
        assert_eq!(poly(2.0, &[1.0, 3.0, 0.5]), 1.0 + 6.0 + 2.0);
        assert_eq!(poly(2.0, &[]), 0.0);
    }

    #[test]
    fn pade_with_empty_denominator_is_polynomial() {
        assert_eq!(pade(3.0, &[1.0, 1.0], &[]), 4.0);
        assert!((pade(1.0, &[2.0], &[1.0]) - 1.0).abs() < 1e-15);
    }

    #[test]
    fn polyfit_recovers_cubic() {
        let x: Vec<f64> = (-500..500).map(|i| i as f64).collect();
        let truth = [6000.0, 0.05, 1e-6, -2e-10];
        let y: Vec<f64> = x.iter().map(|&v| poly(v, &truth)).collect();
        let c = polyfit(&x, &y, 3).unwrap();
        for (a, b) in c.iter().zip(truth.iter()) {
            assert!((a - b).abs() <= 1e-9 * b.abs().max(1e-6), "{a} vs {b}");
        }
    }
}
