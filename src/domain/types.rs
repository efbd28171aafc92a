//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - handed to the core as plain arrays by whatever reads the instrument files
//! - exported to JSON/CSV after the fit

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Speed of light in km/s. All velocities in the crate are km/s.
pub const SPEED_OF_LIGHT_KMS: f64 = 299_792.458;

/// Instrumental profile shape.
///
/// A closed set: every variant maps a velocity grid and shape parameters to a
/// unit-sum kernel (see `models::kernel`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IpKind {
    /// `exp(-(v/s)^2/2)`; parameters `[s]`.
    #[value(name = "g", alias = "gaussian")]
    Gaussian,
    /// `exp(-|v/s|^e)`; parameters `[s, e]`.
    #[value(name = "sg", alias = "super-gaussian")]
    SuperGaussian,
    /// Skewed Gaussian with variance-matched scale and zero mean; parameters `[s, a]`.
    #[value(name = "ag", alias = "asymmetric")]
    Asymmetric,
    /// Two half-Gaussians recentred to zero mean; parameters `[s1, s2]`.
    #[value(name = "bg", alias = "bi-gaussian")]
    BiGaussian,
    /// Main Gaussian plus a 4x wider background Gaussian; parameters `[s0, a1]`.
    #[value(name = "mcg", alias = "multi-central")]
    MultiCentral,
    /// Uniformly spaced fixed-width Gaussians ("Gaussian spline"); free amplitudes.
    #[value(name = "mg", alias = "spline")]
    Spline,
}

impl IpKind {
    /// Human-readable label for terminal output.
    pub fn display_name(self) -> &'static str {
        match self {
            IpKind::Gaussian => "Gaussian",
            IpKind::SuperGaussian => "super-Gaussian",
            IpKind::Asymmetric => "asymmetric Gaussian",
            IpKind::BiGaussian => "bi-Gaussian",
            IpKind::MultiCentral => "multi-central Gaussian",
            IpKind::Spline => "Gaussian spline",
        }
    }
}

/// Continuum normalisation function evaluated at `pixel - x_center`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    /// Ordinary polynomial `a0 + a1 x + ...`.
    Poly,
    /// Rational polynomial `poly(x, a) / (1 + x poly(x, b))`.
    Rational,
}

/// Continuum model with its coefficient layout.
///
/// For `Rational`, the last `denominator` coefficients are the denominator set
/// `b1, b2, ...`; the constant denominator term is fixed to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormModel {
    Poly,
    Rational { denominator: usize },
}

impl NormModel {
    pub fn from_kind(kind: NormKind, denominator: usize) -> Self {
        match kind {
            NormKind::Poly => NormModel::Poly,
            NormKind::Rational => NormModel::Rational { denominator },
        }
    }

    /// Number of denominator coefficients carried after the numerator.
    pub fn denominator_len(self) -> usize {
        match self {
            NormModel::Poly => 0,
            NormModel::Rational { denominator } => denominator,
        }
    }
}

/// Model construction settings.
///
/// Built once per run and shared read-only by every chunk.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub c_kms: f64,
    pub ip_kind: IpKind,
    /// Kernel half size `h` in grid knots; the kernel has `2h+1` taps.
    pub ip_half_size: usize,
    /// Default IP width (km/s) used to seed the shape parameters.
    pub ip_width: f64,
    /// Width and spacing (km/s) of the Gaussians in the spline IP.
    pub spline_width: f64,
    /// Number of spline knots, including the fixed central one.
    pub spline_knots: usize,
    /// Log-wavelength grid step expressed as a velocity (km/s).
    pub grid_step_kms: f64,
    pub norm: NormModel,
    /// Velocity margin (km/s) kept between mapped pixels and the valid grid edges.
    pub velocity_margin_kms: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            c_kms: SPEED_OF_LIGHT_KMS,
            ip_kind: IpKind::Gaussian,
            ip_half_size: 50,
            ip_width: 2.2,
            spline_width: 0.9,
            spline_knots: 9,
            grid_step_kms: 0.2,
            norm: NormModel::Poly,
            velocity_margin_kms: 100.0,
        }
    }
}

/// A `(wavelength, flux)` spectrum used as a continuous function.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub wavelength: Vec<f64>,
    pub flux: Vec<f64>,
}

impl Template {
    /// Build a template, rejecting mismatched lengths and non-increasing wavelengths.
    pub fn new(wavelength: Vec<f64>, flux: Vec<f64>) -> Result<Self, AppError> {
        if wavelength.len() != flux.len() {
            return Err(AppError::input(format!(
                "Template length mismatch: {} wavelengths vs {} fluxes.",
                wavelength.len(),
                flux.len()
            )));
        }
        if wavelength.len() < 2 {
            return Err(AppError::input("Template needs at least two samples."));
        }
        if wavelength.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(AppError::input("Template wavelengths must be finite and > 0."));
        }
        if flux.iter().any(|f| !f.is_finite()) {
            return Err(AppError::input("Template fluxes must be finite."));
        }
        if wavelength.windows(2).any(|w| w[1] <= w[0]) {
            return Err(AppError::input("Template wavelengths must be strictly increasing."));
        }
        Ok(Self { wavelength, flux })
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    pub fn start(&self) -> f64 {
        self.wavelength[0]
    }

    pub fn end(&self) -> f64 {
        self.wavelength[self.wavelength.len() - 1]
    }

    pub fn ln_wavelength(&self) -> Vec<f64> {
        self.wavelength.iter().map(|w| w.ln()).collect()
    }

    /// Doppler-shift the wavelengths by `v` km/s: `λ (1 + v/c)`.
    pub fn doppler_shifted(&self, v: f64, c_kms: f64) -> Template {
        let factor = 1.0 + v / c_kms;
        Template {
            wavelength: self.wavelength.iter().map(|w| w * factor).collect(),
            flux: self.flux.clone(),
        }
    }
}

/// One analysis unit: a single echelle order or wavelength range.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub order: usize,
    pub pixel: Vec<usize>,
    /// Instrument wavelength prior per pixel (Å).
    pub wavelength: Vec<f64>,
    pub flux: Vec<f64>,
    pub error: Option<Vec<f64>>,
    /// `true` marks a bad pixel.
    pub flags: Option<Vec<bool>>,
}

impl Chunk {
    /// Reject shape errors before any fit is attempted.
    pub fn validate(&self) -> Result<(), AppError> {
        let n = self.pixel.len();
        if n < 2 {
            return Err(AppError::input(format!(
                "Order {}: chunk needs at least two pixels (got {n}).",
                self.order
            )));
        }
        if self.wavelength.len() != n || self.flux.len() != n {
            return Err(AppError::input(format!(
                "Order {}: pixel/wavelength/flux lengths differ ({n}/{}/{}).",
                self.order,
                self.wavelength.len(),
                self.flux.len()
            )));
        }
        if let Some(err) = &self.error {
            if err.len() != n {
                return Err(AppError::input(format!(
                    "Order {}: error array length {} != {n}.",
                    self.order,
                    err.len()
                )));
            }
        }
        if let Some(flags) = &self.flags {
            if flags.len() != n {
                return Err(AppError::input(format!(
                    "Order {}: flag array length {} != {n}.",
                    self.order,
                    flags.len()
                )));
            }
        }
        if self.pixel.windows(2).any(|p| p[1] <= p[0]) {
            return Err(AppError::input(format!(
                "Order {}: pixel indices must be strictly increasing.",
                self.order
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pixel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixel.is_empty()
    }

    /// Whether pixel `i` may enter a fit (not flagged, finite flux and error).
    pub fn is_usable(&self, i: usize, use_errors: bool) -> bool {
        if self.flags.as_ref().is_some_and(|f| f[i]) {
            return false;
        }
        if !self.flux[i].is_finite() {
            return false;
        }
        if use_errors {
            if let Some(err) = &self.error {
                return err[i].is_finite() && err[i] > 0.0;
            }
        }
        true
    }

    /// Central pixel used to centre the polynomials.
    pub fn pixel_center(&self) -> f64 {
        let first = self.pixel.first().copied().unwrap_or(0) as f64;
        let last = self.pixel.last().copied().unwrap_or(0) as f64;
        0.5 * (first + last)
    }

    /// Finite wavelength prior range `(min, max)`.
    pub fn wavelength_range(&self) -> Option<(f64, f64)> {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &w in &self.wavelength {
            if w.is_finite() && w > 0.0 {
                lo = lo.min(w);
                hi = hi.max(w);
            }
        }
        if lo < hi { Some((lo, hi)) } else { None }
    }
}

/// Per-chunk RV outcome; NaN marks a failed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkRv {
    pub order: usize,
    pub rv: f64,
    pub e_rv: f64,
}

impl ChunkRv {
    pub fn failed(order: usize) -> Self {
        Self {
            order,
            rv: f64::NAN,
            e_rv: f64::NAN,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rv.is_finite() && self.e_rv.is_finite()
    }
}

/// One row of the per-chunk RV table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub order: usize,
    pub rv: f64,
    pub e_rv: f64,
    pub n_pixels: usize,
    pub chi2_red: f64,
    /// `ok`, or the error that failed the chunk.
    pub status: String,
}

impl ChunkRecord {
    pub fn chunk_rv(&self) -> ChunkRv {
        ChunkRv {
            order: self.order,
            rv: self.rv,
            e_rv: self.e_rv,
        }
    }
}
