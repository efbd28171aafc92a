//! Band-limited linear variant of the forward model.
//!
//! The IP at every pixel is a weighted sum of fixed-width Gaussians placed at
//! fixed offsets (in units of their width) around the pixel's wavelength. The
//! weights vary along the order as a polynomial in `pixel - xc`, so the model
//! is linear in the `continuum term × offset` coefficients and is solved with
//! one least-squares call at a given trial RV.
//!
//! Only the `2h + 1` grid knots around each pixel contribute (the band).

use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::Serialize;

use crate::error::AppError;
use crate::math::lstsq;
use crate::models::forward::ForwardModel;

#[derive(Debug, Clone)]
pub struct BandSettings {
    /// Degree of the continuum polynomial (`degree + 1` terms).
    pub degree: usize,
    /// Width of each basis Gaussian (km/s).
    pub sigma_kms: f64,
    /// Basis centres in units of `sigma_kms`.
    pub offsets: Vec<f64>,
    /// Relative singular-value cutoff of the linear solve.
    pub rcond: f64,
}

impl Default for BandSettings {
    fn default() -> Self {
        Self {
            degree: 2,
            sigma_kms: 2.2,
            offsets: vec![-1.4, -0.7, 0.0, 0.7, 1.4],
            rcond: 1e-32,
        }
    }
}

/// Linear least-squares solution at one RV.
#[derive(Debug, Clone, Serialize)]
pub struct BandFit {
    pub rv: f64,
    /// Coefficients ordered `k * offsets.len() + l` (continuum term `k`, offset `l`).
    pub coeffs: Vec<f64>,
    pub chi2: f64,
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SweepPoint {
    pub rv: f64,
    pub chi2: f64,
}

/// Band model for fixed pixels and a fixed wavelength solution.
#[derive(Debug, Clone)]
pub struct BandModel<'a> {
    model: &'a ForwardModel,
    pixels: Vec<f64>,
    /// First grid knot of each pixel's band.
    band_start: Vec<usize>,
    /// Normalised basis, `[pixel][knot in band][offset]`.
    basis: Vec<f64>,
    /// Continuum design, `pixels × (degree + 1)`.
    continuum: DMatrix<f64>,
    n_offsets: usize,
    width: usize,
    atm: Vec<f64>,
    rcond: f64,
}

impl<'a> BandModel<'a> {
    /// Build the band index table and basis for `pixels` mapped through `wave`.
    pub fn build(
        model: &'a ForwardModel,
        pixels: &[f64],
        wave: &[f64],
        settings: &BandSettings,
    ) -> Result<Self, AppError> {
        if pixels.is_empty() {
            return Err(AppError::input("Band model needs at least one pixel."));
        }
        if settings.offsets.is_empty() || !(settings.sigma_kms > 0.0) {
            return Err(AppError::input("Band basis needs offsets and a positive width."));
        }
        let h = model.half_size();
        let width = 2 * h + 1;
        let grid = model.grid();
        let c = model.c_kms();
        let sigma = settings.sigma_kms;
        let n_offsets = settings.offsets.len();

        let mut band_start = Vec::with_capacity(pixels.len());
        let mut basis = Vec::with_capacity(pixels.len() * width * n_offsets);
        for &pixel in pixels {
            let lnw = model.ln_wavelength(pixel, wave)?;
            let jx = grid.index_of(lnw).floor();
            let start = jx - h as f64;
            if start < 0.0 || jx + h as f64 >= grid.len() as f64 {
                return Err(AppError::domain(format!(
                    "Pixel {pixel} band leaves the log grid ({:.4} Å).",
                    lnw.exp()
                )));
            }
            let start = start as usize;
            band_start.push(start);

            let row_offset = basis.len();
            for j in 0..width {
                let v = (grid.knot(start + j) - lnw) * c;
                for &vl in &settings.offsets {
                    basis.push((-0.5 * ((v + sigma * vl) / sigma).powi(2)).exp());
                }
            }
            for l in 0..n_offsets {
                let sum: f64 = (0..width).map(|j| basis[row_offset + j * n_offsets + l]).sum();
                if !(sum > 0.0 && sum.is_finite()) {
                    return Err(AppError::numerical(format!(
                        "Basis Gaussian {l} vanishes on the band of pixel {pixel}."
                    )));
                }
                for j in 0..width {
                    basis[row_offset + j * n_offsets + l] /= sum;
                }
            }
        }

        let x_center = model.x_center();
        let continuum = DMatrix::from_fn(pixels.len(), settings.degree + 1, |i, k| {
            (pixels[i] - x_center).powi(k as i32)
        });

        Ok(Self {
            model,
            pixels: pixels.to_vec(),
            band_start,
            basis,
            continuum,
            n_offsets,
            width,
            atm: vec![1.0; model.absorber_count()],
            rcond: settings.rcond,
        })
    }

    pub fn pixels(&self) -> &[f64] {
        &self.pixels
    }

    /// Grid knots contributing to pixel `i`.
    pub fn band(&self, i: usize) -> Range<usize> {
        let start = self.band_start[i];
        start..start + self.width
    }

    pub fn n_coeffs(&self) -> usize {
        self.continuum.ncols() * self.n_offsets
    }

    fn basis_at(&self, i: usize, j: usize, l: usize) -> f64 {
        self.basis[(i * self.width + j) * self.n_offsets + l]
    }

    /// Design matrix at a trial RV: column `k * L + l` is continuum term `k`
    /// times the source seen through basis Gaussian `l`.
    pub fn design(&self, rv: f64) -> Result<DMatrix<f64>, AppError> {
        let source = self.model.source_spectrum(rv, &self.atm, &[])?;
        let n_l = self.n_offsets;
        let mut a = DMatrix::<f64>::zeros(self.pixels.len(), self.n_coeffs());
        for i in 0..self.pixels.len() {
            let start = self.band_start[i];
            let mut seen = vec![0.0; n_l];
            for j in 0..self.width {
                let s = source[start + j];
                for (l, acc) in seen.iter_mut().enumerate() {
                    *acc += s * self.basis_at(i, j, l);
                }
            }
            for k in 0..self.continuum.ncols() {
                let ck = self.continuum[(i, k)];
                for (l, s) in seen.iter().enumerate() {
                    a[(i, k * n_l + l)] = ck * s;
                }
            }
        }
        Ok(a)
    }

    /// Solve for all coefficients at `rv`.
    pub fn fit(&self, flux: &[f64], rv: f64) -> Result<BandFit, AppError> {
        if flux.len() != self.pixels.len() {
            return Err(AppError::input(format!(
                "Band fit got {} flux values for {} pixels.",
                flux.len(),
                self.pixels.len()
            )));
        }
        let a = self.design(rv)?;
        let y = DVector::from_column_slice(flux);
        let sol = lstsq(&a, &y, self.rcond)
            .ok_or_else(|| AppError::numerical(format!("Band solve failed at RV {rv:.3} km/s.")))?;
        let chi2 = (&a * &sol.coeffs - &y).norm_squared();
        Ok(BandFit {
            rv,
            coeffs: sol.coeffs.iter().copied().collect(),
            chi2,
            rank: sol.rank,
        })
    }

    /// Model flux at `rv` for given coefficients.
    pub fn evaluate(&self, rv: f64, coeffs: &[f64]) -> Result<Vec<f64>, AppError> {
        if coeffs.len() != self.n_coeffs() {
            return Err(AppError::input(format!(
                "Band model expects {} coefficients, got {}.",
                self.n_coeffs(),
                coeffs.len()
            )));
        }
        let a = self.design(rv)?;
        Ok((a * DVector::from_column_slice(coeffs)).iter().copied().collect())
    }

    /// Reconstructed IP at each pixel over its band (`pixels × (2h + 1)`),
    /// including the continuum scale.
    pub fn ip_profiles(&self, coeffs: &[f64]) -> Result<DMatrix<f64>, AppError> {
        if coeffs.len() != self.n_coeffs() {
            return Err(AppError::input(format!(
                "Band model expects {} coefficients, got {}.",
                self.n_coeffs(),
                coeffs.len()
            )));
        }
        let n_l = self.n_offsets;
        Ok(DMatrix::from_fn(self.pixels.len(), self.width, |i, j| {
            let mut acc = 0.0;
            for k in 0..self.continuum.ncols() {
                let ck = self.continuum[(i, k)];
                for l in 0..n_l {
                    acc += self.basis_at(i, j, l) * ck * coeffs[k * n_l + l];
                }
            }
            acc
        }))
    }

    /// χ² of the linear solve at each trial RV.
    pub fn sweep(&self, flux: &[f64], rvs: &[f64]) -> Result<Vec<SweepPoint>, AppError> {
        rvs.par_iter()
            .map(|&rv| {
                self.fit(flux, rv).map(|f| SweepPoint { rv, chi2: f.chi2 })
            })
            .collect()
    }
}

/// Trial RVs `start, start + step, ...` up to `stop` inclusive.
pub fn rv_grid(start: f64, stop: f64, step: f64) -> Result<Vec<f64>, AppError> {
    if !(step > 0.0 && stop >= start) {
        return Err(AppError::input(format!(
            "Invalid RV sweep {start}..{stop} step {step}."
        )));
    }
    let n = ((stop - start) / step + 1e-9).floor() as usize + 1;
    Ok((0..n).map(|i| start + i as f64 * step).collect())
}

/// Sweep point with the lowest χ².
pub fn best_point(points: &[SweepPoint]) -> Option<SweepPoint> {
    points
        .iter()
        .filter(|p| p.chi2.is_finite())
        .min_by(|a, b| a.chi2.total_cmp(&b.chi2))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{observe, simulate, SimulationSettings};
    use crate::domain::ModelSettings;
    use crate::fit::{run_stage, stage_pixels, FitSettings, ParamGroup, ParamSet, Stage};
    use crate::models::ModelInputs;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn settings() -> ModelSettings {
        ModelSettings {
            ip_half_size: 20,
            grid_step_kms: 0.5,
            ..ModelSettings::default()
        }
    }

    #[test]
    fn continuum_matches_nonlinear_fit_with_central_gaussian() {
        let settings = settings();
        let sim = simulate(
            &SimulationSettings {
                snr: None,
                ..SimulationSettings::default()
            },
            &settings,
        )
        .unwrap();
        let inputs = ModelInputs {
            stellar: &sim.stellar,
            cell: Some(&sim.cell),
            absorbers: &[],
        };
        let model = ForwardModel::for_chunk(inputs, &sim.observations[0], &settings).unwrap();
        let mut truth = sim.truth[0].clone();
        truth.norm = vec![1.1, 2e-4, -1e-6];
        let obs = observe(
            &model,
            &truth,
            1,
            sim.observations[0].pixel.clone(),
            sim.observations[0].wavelength.clone(),
            None,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();

        let fit_settings = FitSettings::default();
        let idx = stage_pixels(&model, &obs, &truth.wave, None, false);
        let pixels: Vec<f64> = idx.iter().map(|&i| obs.pixel[i] as f64).collect();
        let flux: Vec<f64> = idx.iter().map(|&i| obs.flux[i]).collect();

        let band_settings = BandSettings {
            degree: 2,
            sigma_kms: 2.2,
            offsets: vec![0.0],
            rcond: 1e-32,
        };
        let band = BandModel::build(&model, &pixels, &truth.wave, &band_settings).unwrap();
        let linear = band.fit(&flux, truth.rv).unwrap();

        let mut set = ParamSet::fixed_at(&truth);
        set.norm = ParamGroup::free(vec![1.0, 0.0, 0.0]);
        let nonlinear = run_stage(&model, &obs, &set, Stage::Continuum, None, &fit_settings).unwrap();
        let norm = nonlinear.set.norm.values();

        for x in [pixels[0], model.x_center(), pixels[pixels.len() - 1]] {
            let dx = x - model.x_center();
            let a = linear.coeffs[0] + linear.coeffs[1] * dx + linear.coeffs[2] * dx * dx;
            let b = norm[0] + norm[1] * dx + norm[2] * dx * dx;
            assert!((a - b).abs() < 2e-3, "x = {x}: band {a} vs nonlinear {b}");
        }
        assert!((norm[0] - 1.1).abs() < 1e-6);
    }

    #[test]
    fn reconstructed_ip_carries_the_continuum() {
        let settings = settings();
        let sim = simulate(
            &SimulationSettings {
                pixels: 150,
                snr: None,
                ..SimulationSettings::default()
            },
            &settings,
        )
        .unwrap();
        let inputs = ModelInputs {
            stellar: &sim.stellar,
            cell: Some(&sim.cell),
            absorbers: &[],
        };
        let model = ForwardModel::for_chunk(inputs, &sim.observations[0], &settings).unwrap();
        let pixels: Vec<f64> = sim.observations[0].pixel.iter().map(|&p| p as f64).collect();
        let band = BandModel::build(&model, &pixels, &sim.truth[0].wave, &BandSettings::default()).unwrap();
        assert_eq!(band.n_coeffs(), 15);
        assert_eq!(band.band(0).len(), 41);

        let fit = band.fit(&sim.observations[0].flux, sim.truth[0].rv).unwrap();
        let ip = band.ip_profiles(&fit.coeffs).unwrap();
        let n_l = 5;
        for (i, &x) in pixels.iter().enumerate() {
            let dx = x - model.x_center();
            let scale: f64 = (0..3)
                .map(|k| (0..n_l).map(|l| fit.coeffs[k * n_l + l]).sum::<f64>() * dx.powi(k as i32))
                .sum();
            let total: f64 = ip.row(i).iter().sum();
            assert!((total - scale).abs() < 1e-9 * scale.abs().max(1.0));
        }

        let model_flux = band.evaluate(sim.truth[0].rv, &fit.coeffs).unwrap();
        let chi2: f64 = model_flux
            .iter()
            .zip(&sim.observations[0].flux)
            .map(|(m, f)| (m - f).powi(2))
            .sum();
        assert!((chi2 - fit.chi2).abs() < 1e-9);
    }

    #[test]
    fn sweep_finds_the_injected_rv() {
        let settings = settings();
        let sim = simulate(
            &SimulationSettings {
                rv: 5.0,
                snr: None,
                ..SimulationSettings::default()
            },
            &settings,
        )
        .unwrap();
        let inputs = ModelInputs {
            stellar: &sim.stellar,
            cell: Some(&sim.cell),
            absorbers: &[],
        };
        let model = ForwardModel::for_chunk(inputs, &sim.observations[0], &settings).unwrap();
        let pixels: Vec<f64> = sim.observations[0].pixel.iter().map(|&p| p as f64).collect();
        let band = BandModel::build(&model, &pixels, &sim.truth[0].wave, &BandSettings::default()).unwrap();
        let rvs = rv_grid(2.0, 8.0, 1.0).unwrap();
        assert_eq!(rvs.len(), 7);
        let points = band.sweep(&sim.observations[0].flux, &rvs).unwrap();
        assert_eq!(best_point(&points).map(|p| p.rv), Some(5.0));
    }

    #[test]
    fn pixels_off_the_grid_are_rejected() {
        let settings = settings();
        let sim = simulate(
            &SimulationSettings {
                pixels: 50,
                snr: None,
                ..SimulationSettings::default()
            },
            &settings,
        )
        .unwrap();
        let inputs = ModelInputs {
            stellar: &sim.stellar,
            cell: Some(&sim.cell),
            absorbers: &[],
        };
        let model = ForwardModel::for_chunk(inputs, &sim.observations[0], &settings).unwrap();
        let err = BandModel::build(&model, &[5000.0], &sim.truth[0].wave, &BandSettings::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Domain);
        assert!(rv_grid(1.0, 0.0, 0.5).is_err());
    }
}
