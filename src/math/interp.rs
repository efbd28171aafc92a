//! Piecewise-linear interpolation.
//!
//! Two flavours:
//! - [`LinearInterp`] over arbitrary strictly increasing knots (templates)
//! - [`interp_uniform`] over a uniform grid (the log-wavelength grid), O(1) per query
//!
//! Queries outside the knot range return `None`; the caller decides whether that
//! is a domain error or can be clamped.

use crate::error::AppError;

/// Tolerance (in grid steps) for queries that land a rounding error past an edge.
const EDGE_EPS: f64 = 1e-9;

/// Linear interpolant over strictly increasing knots.
#[derive(Debug, Clone)]
pub struct LinearInterp {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl LinearInterp {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self, AppError> {
        if x.len() != y.len() {
            return Err(AppError::input(format!(
                "Interpolant length mismatch: {} knots vs {} values.",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(AppError::input("Interpolant needs at least two knots."));
        }
        if x.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(AppError::input("Interpolant knots must be strictly increasing."));
        }
        Ok(Self { x, y })
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    /// Interpolated value, `None` outside the knot range.
    pub fn eval(&self, xq: f64) -> Option<f64> {
        let (lo, hi) = self.domain();
        if !(xq >= lo && xq <= hi) {
            return None;
        }
        let n = self.x.len();
        // First knot strictly greater than xq, clamped so that [i-1, i] is a valid segment.
        let i = self.x.partition_point(|&v| v <= xq).clamp(1, n - 1);
        let (x0, x1) = (self.x[i - 1], self.x[i]);
        let t = (xq - x0) / (x1 - x0);
        Some(self.y[i - 1] + t * (self.y[i] - self.y[i - 1]))
    }

    /// Interpolated value with constant extrapolation at both ends.
    pub fn eval_clamped(&self, xq: f64) -> f64 {
        let (lo, hi) = self.domain();
        if xq <= lo {
            return self.y[0];
        }
        if xq >= hi {
            return self.y[self.y.len() - 1];
        }
        self.eval(xq).unwrap_or(f64::NAN)
    }
}

/// Interpolate `y` sampled at `x0 + j*dx` at `xq`; `None` outside the grid.
pub fn interp_uniform(x0: f64, dx: f64, y: &[f64], xq: f64) -> Option<f64> {
    let n = y.len();
    if n < 2 || !(dx > 0.0) {
        return None;
    }
    let t = (xq - x0) / dx;
    let last = (n - 1) as f64;
    if !(t >= -EDGE_EPS && t <= last + EDGE_EPS) {
        return None;
    }
    let t = t.clamp(0.0, last);
    let i = (t.floor() as usize).min(n - 2);
    let f = t - i as f64;
    Some(y[i] + f * (y[i + 1] - y[i]))
}

/// Same as [`interp_uniform`] but holding the edge values outside the grid.
pub fn interp_uniform_clamped(x0: f64, dx: f64, y: &[f64], xq: f64) -> f64 {
    let n = y.len();
    if n == 0 {
        return f64::NAN;
    }
    let t = ((xq - x0) / dx).clamp(0.0, (n - 1) as f64);
    interp_uniform(x0, dx, y, x0 + t * dx).unwrap_or(y[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_interp_hits_knots_and_midpoints() {
        let f = LinearInterp::new(vec![0.0, 1.0, 3.0], vec![0.0, 2.0, 6.0]).unwrap();
        assert_eq!(f.eval(0.0), Some(0.0));
        assert_eq!(f.eval(3.0), Some(6.0));
        assert!((f.eval(2.0).unwrap() - 4.0).abs() < 1e-12);
        assert!(f.eval(3.5).is_none());
        assert_eq!(f.eval_clamped(-1.0), 0.0);
    }

    #[test]
    fn uniform_interp_matches_line() {
        let y: Vec<f64> = (0..10).map(|j| 2.0 * j as f64 + 1.0).collect();
        let v = interp_uniform(5.0, 0.5, &y, 6.25).unwrap();
        // x=6.25 -> j=2.5 -> 2*2.5+1
        assert!((v - 6.0).abs() < 1e-12);
        assert!(interp_uniform(5.0, 0.5, &y, 4.9).is_none());
        assert!((interp_uniform_clamped(5.0, 0.5, &y, 100.0) - 19.0).abs() < 1e-12);
    }
}
