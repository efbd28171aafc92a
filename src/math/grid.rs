//! Uniform natural-log wavelength grid.
//!
//! Knots are computed as `start + j * step` rather than by accumulation, so the
//! spacing is constant to floating-point precision.

use crate::error::AppError;
use crate::math::interp::LinearInterp;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogGrid {
    start: f64,
    step: f64,
    len: usize,
}

impl LogGrid {
    pub fn new(start: f64, step: f64, len: usize) -> Result<Self, AppError> {
        if !(start.is_finite() && step.is_finite() && step > 0.0) {
            return Err(AppError::input(format!(
                "Invalid log grid: start={start}, step={step}."
            )));
        }
        if len < 2 {
            return Err(AppError::input("Log grid needs at least two knots."));
        }
        Ok(Self { start, step, len })
    }

    /// Grid covering `[ln_min, ln_max]` with a step of `step_kms / c`.
    pub fn spanning(ln_min: f64, ln_max: f64, step_kms: f64, c_kms: f64) -> Result<Self, AppError> {
        if !(ln_max > ln_min) {
            return Err(AppError::domain(format!(
                "Empty wavelength overlap for log grid: [{:.3}, {:.3}] Å.",
                ln_min.exp(),
                ln_max.exp()
            )));
        }
        if !(step_kms > 0.0 && c_kms > 0.0) {
            return Err(AppError::input(format!("Invalid grid step {step_kms} km/s.")));
        }
        let step = step_kms / c_kms;
        let len = ((ln_max - ln_min) / step).floor() as usize + 1;
        Self::new(ln_min, step, len)
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    /// Knot spacing `dx` in ln(wavelength).
    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn knot(&self, j: usize) -> f64 {
        self.start + j as f64 * self.step
    }

    pub fn end(&self) -> f64 {
        self.knot(self.len - 1)
    }

    pub fn knots(&self) -> Vec<f64> {
        (0..self.len).map(|j| self.knot(j)).collect()
    }

    /// Fractional knot index of `ln_wave`.
    pub fn index_of(&self, ln_wave: f64) -> f64 {
        (ln_wave - self.start) / self.step
    }

    /// Sample an interpolant (defined in ln wavelength) on every knot.
    pub fn resample(&self, f: &LinearInterp) -> Result<Vec<f64>, AppError> {
        let (lo, hi) = f.domain();
        if self.start < lo || self.end() > hi {
            return Err(AppError::domain(format!(
                "Template [{:.3}, {:.3}] Å does not cover the log grid [{:.3}, {:.3}] Å.",
                lo.exp(),
                hi.exp(),
                self.start.exp(),
                self.end().exp()
            )));
        }
        (0..self.len)
            .map(|j| {
                f.eval(self.knot(j))
                    .ok_or_else(|| AppError::domain("Log grid knot outside template range."))
            })
            .collect()
    }
}
