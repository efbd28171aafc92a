//! The forward model.
//!
//! Given a stellar template, an optional absorption cell, absorber (telluric)
//! templates and a parameter set, predict the observed flux at pixel positions:
//!
//! ```text
//! S(i) = norm(i - xc) * [ IP ⊛ ( S*(x - v/c) * (gas(x) + bkg) ) ](ln poly(i - xc, wave))
//! ```
//!
//! Everything before the convolution lives on a uniform ln-wavelength grid `x_j`.
//! The convolution keeps only the valid range, so the convolved model is defined
//! on `x_h .. x_{n-1-h}`.

use serde::{Deserialize, Serialize};

use crate::domain::{Chunk, ModelSettings, NormModel, Template};
use crate::error::AppError;
use crate::math::{interp_uniform, interp_uniform_clamped, pade, poly, LinearInterp, LogGrid};
use crate::models::kernel::IpProfile;

/// Parameter values for one model evaluation, grouped by meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Stellar RV relative to the template frame (km/s).
    pub rv: f64,
    /// Continuum coefficients, ascending in `pixel - xc`.
    pub norm: Vec<f64>,
    /// Wavelength solution coefficients (Å), ascending in `pixel - xc`.
    pub wave: Vec<f64>,
    /// IP shape parameters.
    pub ip: Vec<f64>,
    /// One exponent per absorber template, plus optionally one shared shift (km/s).
    pub atm: Vec<f64>,
    /// Additive background level; only the first value is used.
    pub bkg: Vec<f64>,
}

/// Spectra that define one chunk's model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInputs<'a> {
    pub stellar: &'a Template,
    pub cell: Option<&'a Template>,
    pub absorbers: &'a [Template],
}

#[derive(Debug, Clone)]
pub struct ForwardModel {
    stellar: LinearInterp,
    grid: LogGrid,
    cell: Vec<f64>,
    absorbers: Vec<Vec<f64>>,
    profile: IpProfile,
    half_size: usize,
    vk: Vec<f64>,
    x_center: f64,
    norm: NormModel,
    c_kms: f64,
    margin_ln: f64,
}

impl ForwardModel {
    pub fn new(
        inputs: ModelInputs<'_>,
        grid: LogGrid,
        x_center: f64,
        settings: &ModelSettings,
    ) -> Result<Self, AppError> {
        let h = settings.ip_half_size;
        if grid.len() <= 2 * h + 1 {
            return Err(AppError::input(format!(
                "Log grid has {} knots; the IP needs more than {} for a valid convolution range.",
                grid.len(),
                2 * h + 1
            )));
        }

        let stellar = LinearInterp::new(inputs.stellar.ln_wavelength(), inputs.stellar.flux.clone())?;
        let cell = match inputs.cell {
            Some(t) => grid.resample(&LinearInterp::new(t.ln_wavelength(), t.flux.clone())?)?,
            None => vec![1.0; grid.len()],
        };
        let absorbers = inputs
            .absorbers
            .iter()
            .map(|t| grid.resample(&LinearInterp::new(t.ln_wavelength(), t.flux.clone())?))
            .collect::<Result<Vec<_>, _>>()?;

        let dv = grid.step() * settings.c_kms;
        let vk = (0..=2 * h).map(|k| (k as f64 - h as f64) * dv).collect();

        Ok(Self {
            stellar,
            grid,
            cell,
            absorbers,
            profile: IpProfile::from_settings(settings),
            half_size: h,
            vk,
            x_center,
            norm: settings.norm,
            c_kms: settings.c_kms,
            margin_ln: (1.0 + settings.velocity_margin_kms / settings.c_kms).ln(),
        })
    }

    /// Model for one chunk, on [`chunk_grid`] and centred on the chunk's pixels.
    pub fn for_chunk(
        inputs: ModelInputs<'_>,
        chunk: &Chunk,
        settings: &ModelSettings,
    ) -> Result<Self, AppError> {
        let range = chunk.wavelength_range().ok_or_else(|| {
            AppError::input(format!("Order {}: no valid wavelength prior.", chunk.order))
        })?;
        let grid = chunk_grid(range, inputs, settings)?;
        Self::new(inputs, grid, chunk.pixel_center(), settings)
    }

    pub fn grid(&self) -> &LogGrid {
        &self.grid
    }

    pub fn half_size(&self) -> usize {
        self.half_size
    }

    /// Kernel velocity grid `[-h..h] * dx * c` (km/s).
    pub fn vk(&self) -> &[f64] {
        &self.vk
    }

    pub fn x_center(&self) -> f64 {
        self.x_center
    }

    pub fn c_kms(&self) -> f64 {
        self.c_kms
    }

    pub fn profile(&self) -> &IpProfile {
        &self.profile
    }

    pub fn norm_model(&self) -> NormModel {
        self.norm
    }

    pub fn absorber_count(&self) -> usize {
        self.absorbers.len()
    }

    /// ln-wavelength range on which the convolved model is defined.
    pub fn valid_ln_range(&self) -> (f64, f64) {
        let n = self.grid.len();
        (
            self.grid.knot(self.half_size),
            self.grid.knot(n - 1 - self.half_size),
        )
    }

    /// Valid range shrunk by the velocity margin; fitted pixels must map inside it.
    pub fn fit_ln_range(&self) -> (f64, f64) {
        let (lo, hi) = self.valid_ln_range();
        (lo + self.margin_ln, hi - self.margin_ln)
    }

    /// Normalised IP kernel for the given shape parameters.
    pub fn kernel(&self, ip: &[f64]) -> Result<Vec<f64>, AppError> {
        self.profile.evaluate(&self.vk, ip)
    }

    /// Cell times scaled absorbers on the grid, optionally shifted by a shared velocity.
    pub fn gas_spectrum(&self, atm: &[f64]) -> Result<Vec<f64>, AppError> {
        let mut gas = self.cell.clone();
        let n_abs = self.absorbers.len();
        if n_abs == 0 {
            if !atm.is_empty() {
                return Err(AppError::input(format!(
                    "{} absorber coefficients given but no absorber templates loaded.",
                    atm.len()
                )));
            }
            return Ok(gas);
        }
        if atm.len() != n_abs && atm.len() != n_abs + 1 {
            return Err(AppError::input(format!(
                "Expected {n_abs} absorber coefficients (or {} with a shared shift), got {}.",
                n_abs + 1,
                atm.len()
            )));
        }

        let mut flux_atm = vec![1.0; self.grid.len()];
        for (coeff, flux) in atm.iter().zip(self.absorbers.iter()) {
            // |coeff| keeps the exponent a physical attenuation whatever sign the solver tries.
            let e = coeff.abs();
            for (a, f) in flux_atm.iter_mut().zip(flux.iter()) {
                *a *= f.powf(e);
            }
        }

        if atm.len() == n_abs + 1 {
            // Sampled at `x + ln(1 + v/c)`: positive shifts move features blueward.
            let shift = (1.0 + atm[n_abs] / self.c_kms).ln();
            let (x0, dx) = (self.grid.start(), self.grid.step());
            let shifted = (0..self.grid.len())
                .map(|j| interp_uniform_clamped(x0, dx, &flux_atm, self.grid.knot(j) + shift))
                .collect();
            flux_atm = shifted;
        }

        if flux_atm.iter().any(|v| !v.is_finite()) {
            return Err(AppError::numerical("Absorber model produced non-finite values."));
        }
        for (g, a) in gas.iter_mut().zip(flux_atm.iter()) {
            *g *= a;
        }
        Ok(gas)
    }

    /// Doppler-shifted star times `(gas + bkg)` on the grid, before convolution.
    pub fn source_spectrum(&self, rv: f64, atm: &[f64], bkg: &[f64]) -> Result<Vec<f64>, AppError> {
        let gas = self.gas_spectrum(atm)?;
        let bkg0 = bkg.first().copied().unwrap_or(0.0);
        let shift = rv / self.c_kms;
        (0..self.grid.len())
            .map(|j| {
                let x = self.grid.knot(j) - shift;
                let star = self.stellar.eval(x).ok_or_else(|| {
                    AppError::domain(format!(
                        "RV {rv:.3} km/s shifts the grid outside the stellar template."
                    ))
                })?;
                Ok(star * (gas[j] + bkg0))
            })
            .collect()
    }

    /// Source spectrum convolved with the IP; `grid.len() - 2h` values starting at knot `h`.
    pub fn convolved(&self, p: &ModelParams) -> Result<Vec<f64>, AppError> {
        let source = self.source_spectrum(p.rv, &p.atm, &p.bkg)?;
        let kernel = self.kernel(&p.ip)?;
        Ok(convolve_valid(&kernel, &source))
    }

    /// `ln(poly(pixel - xc, wave))`.
    pub fn ln_wavelength(&self, pixel: f64, wave: &[f64]) -> Result<f64, AppError> {
        let w = poly(pixel - self.x_center, wave);
        if !(w.is_finite() && w > 0.0) {
            return Err(AppError::domain(format!(
                "Wavelength solution gives {w} at pixel {pixel}."
            )));
        }
        Ok(w.ln())
    }

    pub fn continuum(&self, pixel: f64, norm: &[f64]) -> f64 {
        let x = pixel - self.x_center;
        match self.norm {
            NormModel::Poly => poly(x, norm),
            NormModel::Rational { denominator } => {
                let split = norm.len().saturating_sub(denominator);
                pade(x, &norm[..split], &norm[split..])
            }
        }
    }

    /// Predicted flux at `pixels`.
    pub fn evaluate(&self, pixels: &[f64], p: &ModelParams) -> Result<Vec<f64>, AppError> {
        if p.wave.is_empty() {
            return Err(AppError::input("Wavelength solution has no coefficients."));
        }
        let conv = self.convolved(p)?;
        let x_eff = self.grid.knot(self.half_size);
        let dx = self.grid.step();

        let mut out = Vec::with_capacity(pixels.len());
        for &pixel in pixels {
            let lnw = self.ln_wavelength(pixel, &p.wave)?;
            let s = interp_uniform(x_eff, dx, &conv, lnw).ok_or_else(|| {
                AppError::domain(format!(
                    "Pixel {pixel} maps to {:.4} Å, outside the valid model range.",
                    lnw.exp()
                ))
            })?;
            out.push(self.continuum(pixel, &p.norm) * s);
        }
        if out.iter().any(|v| !v.is_finite()) {
            return Err(AppError::numerical("Forward model produced non-finite flux."));
        }
        Ok(out)
    }
}

/// Log grid for an observation spanning `obs_range` (Å).
///
/// The grid covers the overlap of all templates shrunk by the velocity margin,
/// clipped to the observation widened by the kernel support and two margins
/// so that the fit range still reaches the observed pixels.
pub fn chunk_grid(
    obs_range: (f64, f64),
    inputs: ModelInputs<'_>,
    settings: &ModelSettings,
) -> Result<LogGrid, AppError> {
    let margin = (1.0 + settings.velocity_margin_kms / settings.c_kms).ln();
    let step = settings.grid_step_kms / settings.c_kms;
    let pad = 2.0 * margin + (settings.ip_half_size + 1) as f64 * step;

    let mut lo = obs_range.0.ln() - pad;
    let mut hi = obs_range.1.ln() + pad;
    let templates = std::iter::once(inputs.stellar)
        .chain(inputs.cell)
        .chain(inputs.absorbers.iter());
    for t in templates {
        lo = lo.max(t.start().ln() + margin);
        hi = hi.min(t.end().ln() - margin);
    }
    LogGrid::spanning(lo, hi, settings.grid_step_kms, settings.c_kms)
}

/// Discrete convolution restricted to full overlap (`signal.len() - kernel.len() + 1` values).
pub fn convolve_valid(kernel: &[f64], signal: &[f64]) -> Vec<f64> {
    let m = kernel.len();
    if m == 0 || signal.len() < m {
        return Vec::new();
    }
    (0..=signal.len() - m)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * signal[i + m - 1 - k])
                .sum()
        })
        .collect()
}
