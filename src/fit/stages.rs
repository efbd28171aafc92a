//! Staged refinement of one chunk.
//!
//! Each stage starts from the previous stage's solution and frees strictly
//! more parameters:
//!
//! 1. continuum level
//! 2. wavelength solution (continuum fixed)
//! 3. RV, continuum level, wavelength solution (and absorbers, if any)
//! 4. as 3 on a pixel window (only when one is configured; it stays in force)
//! 5. as 3 plus the IP shape
//! 6. full continuum polynomial, RV, wavelength, IP (and background)
//!
//! Before each stage the usable pixels are re-selected so that their mapped
//! wavelengths stay inside the model's valid range minus the velocity margin.

use nalgebra::DMatrix;
use serde::Serialize;
use tracing::debug;

use crate::domain::{Chunk, ChunkRv};
use crate::error::AppError;
use crate::fit::lm::{curve_fit_scaled, LmConfig};
use crate::fit::params::{GroupKind, ParamGroup, ParamSet};
use crate::math::polyfit;
use crate::models::{ForwardModel, ModelParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Continuum,
    Wavelength,
    Joint,
    Window,
    IpShape,
    Full,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Continuum,
        Stage::Wavelength,
        Stage::Joint,
        Stage::Window,
        Stage::IpShape,
        Stage::Full,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Continuum => "continuum",
            Stage::Wavelength => "wavelength",
            Stage::Joint => "joint",
            Stage::Window => "window",
            Stage::IpShape => "ip",
            Stage::Full => "full",
        }
    }
}

/// Per-run fit options shared by every chunk.
#[derive(Debug, Clone)]
pub struct FitSettings {
    /// Starting RV (km/s).
    pub rv_guess: f64,
    /// Degree of the wavelength solution (prior and fit).
    pub wave_degree: usize,
    /// Degree of the continuum numerator in the last stage.
    pub norm_degree: usize,
    /// Inclusive pixel range used from stage 4 on.
    pub pixel_window: Option<(usize, usize)>,
    /// Fit one shared absorber shift (needs at least one absorber template).
    pub fit_absorber_shift: bool,
    pub fit_background: bool,
    /// Weight residuals by the flux errors when the chunk has them.
    pub use_errors: bool,
    pub lm: LmConfig,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            rv_guess: 0.0,
            wave_degree: 3,
            norm_degree: 3,
            pixel_window: None,
            fit_absorber_shift: false,
            fit_background: false,
            use_errors: true,
            lm: LmConfig::default(),
        }
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone)]
pub struct StageFit {
    pub stage: Stage,
    /// Fitted values, in this stage's free/fixed layout.
    pub set: ParamSet,
    /// Covariance of the free parameters, in flat order.
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub dof: usize,
    pub iterations: usize,
    /// Indices into the chunk of the pixels that entered the fit.
    pub pixels: Vec<usize>,
}

impl StageFit {
    pub fn summary(&self) -> StageSummary {
        StageSummary {
            stage: self.stage,
            free: self.set.free_len(),
            n_pixels: self.pixels.len(),
            chi2: self.chi2,
            iterations: self.iterations,
        }
    }

    /// RV and its one-sigma error; NaN error when RV was fixed.
    pub fn rv(&self) -> (f64, f64) {
        let rv = self.set.rv.values().first().copied().unwrap_or(f64::NAN);
        let range = self.set.group_range(GroupKind::Rv);
        let e_rv = if range.is_empty() {
            f64::NAN
        } else {
            self.covariance[(range.start, range.start)].max(0.0).sqrt()
        };
        (rv, e_rv)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub free: usize,
    pub n_pixels: usize,
    pub chi2: f64,
    pub iterations: usize,
}

/// One fitted parameter and, when it was free, its error.
#[derive(Debug, Clone, Serialize)]
pub struct ParamEstimate {
    pub group: GroupKind,
    pub index: usize,
    pub value: f64,
    pub error: Option<f64>,
}

/// Final result for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkFit {
    pub order: usize,
    pub rv: f64,
    pub e_rv: f64,
    /// Final parameters, ready for re-evaluation of the model.
    pub params: ModelParams,
    pub final_set: ParamSet,
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub dof: usize,
    pub stages: Vec<StageSummary>,
    pub window: Option<(usize, usize)>,
    pub pixels: Vec<usize>,
}

impl ChunkFit {
    pub fn chunk_rv(&self) -> ChunkRv {
        ChunkRv {
            order: self.order,
            rv: self.rv,
            e_rv: self.e_rv,
        }
    }

    pub fn reduced_chi2(&self) -> f64 {
        if self.dof == 0 {
            f64::NAN
        } else {
            self.chi2 / self.dof as f64
        }
    }

    /// Every parameter value with the error of the free ones.
    pub fn estimates(&self) -> Vec<ParamEstimate> {
        let mut out = Vec::new();
        for group in GroupKind::ALL {
            let g = self.final_set.group(group);
            let range = self.final_set.group_range(group);
            for (index, value) in g.values().into_iter().enumerate() {
                let error = (index < g.free.len()).then(|| {
                    let k = range.start + index;
                    self.covariance[(k, k)].max(0.0).sqrt()
                });
                out.push(ParamEstimate {
                    group,
                    index,
                    value,
                    error,
                });
            }
        }
        out
    }
}

/// Run all stages on one chunk.
pub fn fit_chunk(
    model: &ForwardModel,
    chunk: &Chunk,
    settings: &FitSettings,
) -> Result<ChunkFit, AppError> {
    chunk.validate()?;
    let mut set = initial_set(model, chunk, settings)?;
    let mut window = None;
    let mut stages = Vec::with_capacity(Stage::ALL.len());
    let mut last = None;

    for stage in Stage::ALL {
        if stage == Stage::Window {
            match settings.pixel_window {
                Some(w) => window = Some(w),
                None => continue,
            }
        }
        let start = prepare(stage, &set, model, chunk, settings)?;
        let fit = run_stage(model, chunk, &start, stage, window, settings)?;
        stages.push(fit.summary());
        set = fit.set.clone();
        last = Some(fit);
    }

    let last = last.ok_or_else(|| AppError::convergence("No fit stage was run."))?;
    let (rv, e_rv) = last.rv();
    Ok(ChunkFit {
        order: chunk.order,
        rv,
        e_rv,
        params: last.set.model_params()?,
        final_set: last.set,
        covariance: last.covariance,
        chi2: last.chi2,
        dof: last.dof,
        stages,
        window,
        pixels: last.pixels,
    })
}

/// Re-run the last stage from a finished fit.
pub fn refine(
    model: &ForwardModel,
    chunk: &Chunk,
    fit: &ChunkFit,
    settings: &FitSettings,
) -> Result<StageFit, AppError> {
    run_stage(model, chunk, &fit.final_set, Stage::Full, fit.window, settings)
}

/// Solve one stage starting from `set`.
pub fn run_stage(
    model: &ForwardModel,
    chunk: &Chunk,
    set: &ParamSet,
    stage: Stage,
    window: Option<(usize, usize)>,
    settings: &FitSettings,
) -> Result<StageFit, AppError> {
    let start = set.model_params()?;
    let pixels = stage_pixels(model, chunk, &start.wave, window, settings.use_errors);
    if pixels.is_empty() {
        return Err(AppError::domain(format!(
            "Order {}: no usable pixel maps inside the model range in stage {}.",
            chunk.order,
            stage.label()
        )));
    }
    if pixels.len() <= set.free_len() {
        return Err(AppError::input(format!(
            "Order {}: {} usable pixels for {} free parameters in stage {}.",
            chunk.order,
            pixels.len(),
            set.free_len(),
            stage.label()
        )));
    }

    let x: Vec<f64> = pixels.iter().map(|&i| chunk.pixel[i] as f64).collect();
    let y: Vec<f64> = pixels.iter().map(|&i| chunk.flux[i]).collect();
    let sigma: Option<Vec<f64>> = match (&chunk.error, settings.use_errors) {
        (Some(err), true) => Some(pixels.iter().map(|&i| err[i]).collect()),
        _ => None,
    };

    let evaluate = |free: &[f64]| {
        let p = set.with_free(free)?.model_params()?;
        model.evaluate(&x, &p)
    };
    let half_span = x.iter().fold(0.0f64, |m, v| m.max((v - model.x_center()).abs()));
    let typical = set.free_typical(half_span, model.norm_model().denominator_len());
    let fit = curve_fit_scaled(evaluate, &y, sigma.as_deref(), &set.free_vector(), &typical, &settings.lm)?;
    let fitted = set.with_free(&fit.params)?;

    debug!(
        order = chunk.order,
        stage = stage.label(),
        free = set.free_len(),
        pixels = pixels.len(),
        chi2 = fit.chi2,
        iterations = fit.iterations,
        "stage converged"
    );

    Ok(StageFit {
        stage,
        set: fitted,
        covariance: fit.covariance,
        chi2: fit.chi2,
        dof: fit.dof,
        iterations: fit.iterations,
        pixels,
    })
}

/// Starting point: RV guess, unit continuum, prior wavelength solution,
/// default IP, unit absorber exponents, everything fixed.
pub fn initial_set(
    model: &ForwardModel,
    chunk: &Chunk,
    settings: &FitSettings,
) -> Result<ParamSet, AppError> {
    let den = model.norm_model().denominator_len();
    let n_abs = model.absorber_count();
    let mut atm = vec![1.0; n_abs];
    if settings.fit_absorber_shift && n_abs > 0 {
        atm.push(0.0);
    }
    let mut norm = vec![1.0];
    norm.extend(std::iter::repeat_n(0.0, den));

    Ok(ParamSet {
        rv: ParamGroup::fixed(vec![settings.rv_guess]),
        norm: ParamGroup::fixed(norm),
        wave: ParamGroup::fixed(wavelength_prior(model, chunk, settings)?),
        ip: ParamGroup::fixed(model.profile().default_params()),
        atm: ParamGroup::fixed(atm),
        bkg: ParamGroup::empty(),
    })
}

/// Polynomial fit of the instrument wavelengths against `pixel - xc`.
pub fn wavelength_prior(
    model: &ForwardModel,
    chunk: &Chunk,
    settings: &FitSettings,
) -> Result<Vec<f64>, AppError> {
    let (x, w): (Vec<f64>, Vec<f64>) = chunk
        .pixel
        .iter()
        .zip(chunk.wavelength.iter())
        .filter(|(_, w)| w.is_finite() && **w > 0.0)
        .map(|(&p, &w)| (p as f64 - model.x_center(), w))
        .unzip();
    polyfit(&x, &w, settings.wave_degree)
}

/// Usable pixels of `chunk` whose mapped wavelength lies in the fit range.
pub fn stage_pixels(
    model: &ForwardModel,
    chunk: &Chunk,
    wave: &[f64],
    window: Option<(usize, usize)>,
    use_errors: bool,
) -> Vec<usize> {
    let (lo, hi) = model.fit_ln_range();
    (0..chunk.len())
        .filter(|&i| chunk.is_usable(i, use_errors))
        .filter(|&i| window.is_none_or(|(s, e)| (s..=e).contains(&chunk.pixel[i])))
        .filter(|&i| {
            model
                .ln_wavelength(chunk.pixel[i] as f64, wave)
                .is_ok_and(|lnw| lnw >= lo && lnw <= hi)
        })
        .collect()
}

/// Layout for `stage`, built from the previous stage's values.
fn prepare(
    stage: Stage,
    prev: &ParamSet,
    model: &ForwardModel,
    chunk: &Chunk,
    settings: &FitSettings,
) -> Result<ParamSet, AppError> {
    let mut set = prev.clone();
    match stage {
        Stage::Continuum => {
            let a0 = continuum_level(model, chunk, prev, settings)?;
            let mut norm = prev.norm.values();
            norm[0] = a0;
            set.norm = level_free(&norm);
        }
        Stage::Wavelength => {
            set.norm = prev.norm.frozen();
            set.wave = prev.wave.thawed();
        }
        Stage::Joint => {
            set.rv = prev.rv.thawed();
            set.norm = level_free(&prev.norm.values());
            set.wave = prev.wave.thawed();
            set.atm = prev.atm.thawed();
        }
        Stage::Window => {}
        Stage::IpShape => {
            set.ip = prev.ip.thawed();
        }
        Stage::Full => {
            let den = model.norm_model().denominator_len();
            let values = prev.norm.values();
            let split = values.len().saturating_sub(den);
            let mut norm = values[..split].to_vec();
            if norm.len() < settings.norm_degree + 1 {
                norm.resize(settings.norm_degree + 1, 0.0);
            }
            norm.extend_from_slice(&values[split..]);
            set.norm = ParamGroup::free(norm);
            if settings.fit_background {
                set.bkg = ParamGroup::free(vec![prev.bkg.values().first().copied().unwrap_or(0.0)]);
            }
        }
    }
    Ok(set)
}

/// Only the constant continuum term free; the rest (denominator) fixed.
fn level_free(norm: &[f64]) -> ParamGroup {
    ParamGroup {
        free: norm[..1].to_vec(),
        fixed: norm[1..].to_vec(),
    }
}

/// Ratio of mean observed flux to mean model flux at unit continuum.
fn continuum_level(
    model: &ForwardModel,
    chunk: &Chunk,
    set: &ParamSet,
    settings: &FitSettings,
) -> Result<f64, AppError> {
    let mut p = set.model_params()?;
    p.norm.iter_mut().enumerate().for_each(|(i, v)| *v = if i == 0 { 1.0 } else { 0.0 });
    let pixels = stage_pixels(model, chunk, &p.wave, None, settings.use_errors);
    if pixels.is_empty() {
        return Err(AppError::domain(format!(
            "Order {}: no pixel maps inside the model range.",
            chunk.order
        )));
    }
    let x: Vec<f64> = pixels.iter().map(|&i| chunk.pixel[i] as f64).collect();
    let m = model.evaluate(&x, &p)?;
    let mean_model = m.iter().sum::<f64>() / m.len() as f64;
    let mean_flux = pixels.iter().map(|&i| chunk.flux[i]).sum::<f64>() / pixels.len() as f64;
    let a0 = mean_flux / mean_model;
    if !(a0.is_finite() && mean_model > 0.0) {
        return Err(AppError::numerical(format!(
            "Order {}: cannot seed the continuum level (model mean {mean_model}).",
            chunk.order
        )));
    }
    Ok(a0)
}
