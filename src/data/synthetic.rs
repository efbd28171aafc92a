//! Seeded synthetic spectra for tests and the `simulate` command.
//!
//! Observations are produced by the forward model itself, so a fit of the same
//! model recovers the injected parameters up to the added noise.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::domain::{Chunk, ModelSettings, Template};
use crate::error::AppError;
use crate::models::{chunk_grid, ForwardModel, ModelInputs, ModelParams};

/// Gaussian absorption line (Å).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    pub center: f64,
    pub depth: f64,
    pub sigma: f64,
}

/// Unit continuum times Gaussian absorption lines, sampled every `step` Å.
///
/// Lines multiply, so blends never drive the flux negative.
pub fn line_template(lo: f64, hi: f64, step: f64, lines: &[Line]) -> Result<Template, AppError> {
    if !(hi > lo && step > 0.0) {
        return Err(AppError::input(format!(
            "Invalid synthetic template range [{lo}, {hi}] step {step}."
        )));
    }
    let n = ((hi - lo) / step).floor() as usize + 1;
    let wavelength: Vec<f64> = (0..n).map(|i| lo + i as f64 * step).collect();
    let flux = wavelength
        .iter()
        .map(|w| {
            lines
                .iter()
                .map(|l| 1.0 - l.depth * (-0.5 * ((w - l.center) / l.sigma).powi(2)).exp())
                .product::<f64>()
        })
        .collect();
    Template::new(wavelength, flux)
}

/// `count` lines with uniformly drawn centres, depths and widths.
pub fn random_lines(
    rng: &mut StdRng,
    range: (f64, f64),
    count: usize,
    depth: (f64, f64),
    sigma: (f64, f64),
) -> Vec<Line> {
    (0..count)
        .map(|_| Line {
            center: rng.gen_range(range.0..range.1),
            depth: rng.gen_range(depth.0..depth.1),
            sigma: rng.gen_range(sigma.0..sigma.1),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SimulationSettings {
    /// Order number of the first chunk.
    pub order: usize,
    /// Number of consecutive orders, each starting where the previous one ends.
    pub orders: usize,
    /// Injected RV (km/s).
    pub rv: f64,
    /// Signal-to-noise per pixel at unit flux; `None` gives a noiseless observation.
    pub snr: Option<f64>,
    pub seed: u64,
    /// Pixels per order.
    pub pixels: usize,
    /// Wavelength of pixel 0 of the first order (Å).
    pub wave_start: f64,
    /// Å per pixel.
    pub dispersion: f64,
    /// Stellar lines per order.
    pub stellar_lines: usize,
    /// Cell lines per order.
    pub cell_lines: usize,
    /// Template sampling (Å).
    pub template_step: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            order: 1,
            orders: 1,
            rv: 5.0,
            snr: Some(200.0),
            seed: 42,
            pixels: 400,
            wave_start: 6000.0,
            dispersion: 0.05,
            stellar_lines: 12,
            cell_lines: 40,
            template_step: 0.005,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Simulation {
    /// One chunk per order.
    pub observations: Vec<Chunk>,
    pub stellar: Template,
    pub cell: Template,
    /// Parameters each observation was generated with.
    pub truth: Vec<ModelParams>,
}

/// Stellar and cell templates plus one observation per order through the
/// default IP of `settings`.
pub fn simulate(sim: &SimulationSettings, settings: &ModelSettings) -> Result<Simulation, AppError> {
    if sim.pixels < 2 || sim.orders == 0 {
        return Err(AppError::input("Simulation needs at least one order of two pixels."));
    }
    let mut rng = StdRng::seed_from_u64(sim.seed);

    let order_span = sim.dispersion * sim.pixels as f64;
    let obs_lo = sim.wave_start;
    let obs_hi = sim.wave_start + order_span * sim.orders as f64 - sim.dispersion;
    // Room for the margins and the kernel on both sides.
    let pad = 3.0 * sim.wave_start * settings.velocity_margin_kms / settings.c_kms;
    let (lo, hi) = (obs_lo - pad, obs_hi + pad);

    let stellar_lines = random_lines(
        &mut rng,
        (lo, hi),
        sim.stellar_lines * sim.orders,
        (0.2, 0.8),
        (0.05, 0.12),
    );
    let cell_lines = random_lines(&mut rng, (lo, hi), sim.cell_lines * sim.orders, (0.05, 0.4), (0.02, 0.05));
    let stellar = line_template(lo, hi, sim.template_step, &stellar_lines)?;
    let cell = line_template(lo, hi, sim.template_step, &cell_lines)?;
    let inputs = ModelInputs {
        stellar: &stellar,
        cell: Some(&cell),
        absorbers: &[],
    };

    let mut observations = Vec::with_capacity(sim.orders);
    let mut truth = Vec::with_capacity(sim.orders);
    for k in 0..sim.orders {
        let start = sim.wave_start + order_span * k as f64;
        let end = start + sim.dispersion * (sim.pixels - 1) as f64;
        let pixel: Vec<usize> = (0..sim.pixels).collect();
        let wavelength: Vec<f64> = pixel.iter().map(|&p| start + sim.dispersion * p as f64).collect();
        let x_center = 0.5 * (sim.pixels - 1) as f64;

        let grid = chunk_grid((start, end), inputs, settings)?;
        let model = ForwardModel::new(inputs, grid, x_center, settings)?;
        let params = ModelParams {
            rv: sim.rv,
            norm: vec![1.0],
            wave: vec![start + sim.dispersion * x_center, sim.dispersion],
            ip: model.profile().default_params(),
            atm: Vec::new(),
            bkg: Vec::new(),
        };
        observations.push(observe(&model, &params, sim.order + k, pixel, wavelength, sim.snr, &mut rng)?);
        truth.push(params);
    }

    Ok(Simulation {
        observations,
        stellar,
        cell,
        truth,
    })
}

/// Evaluate `model` at `pixel` and add white noise of `1/snr` (relative to unit flux).
pub fn observe(
    model: &ForwardModel,
    truth: &ModelParams,
    order: usize,
    pixel: Vec<usize>,
    wavelength: Vec<f64>,
    snr: Option<f64>,
    rng: &mut StdRng,
) -> Result<Chunk, AppError> {
    let x: Vec<f64> = pixel.iter().map(|&p| p as f64).collect();
    let mut flux = model.evaluate(&x, truth)?;
    let error = match snr {
        Some(snr) => {
            if !(snr.is_finite() && snr > 0.0) {
                return Err(AppError::input(format!("Invalid signal-to-noise {snr}.")));
            }
            let sigma = 1.0 / snr;
            let normal = Normal::new(0.0, sigma)
                .map_err(|e| AppError::input(format!("Noise distribution error: {e}")))?;
            for f in flux.iter_mut() {
                *f += normal.sample(rng);
            }
            Some(vec![sigma; flux.len()])
        }
        None => None,
    };
    let chunk = Chunk {
        order,
        pixel,
        wavelength,
        flux,
        error,
        flags: None,
    };
    chunk.validate()?;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulation_is_reproducible_for_a_seed() {
        let settings = ModelSettings::default();
        let sim = SimulationSettings {
            pixels: 200,
            ..SimulationSettings::default()
        };
        let a = simulate(&sim, &settings).unwrap();
        let b = simulate(&sim, &settings).unwrap();
        assert_eq!(a.observations[0].flux, b.observations[0].flux);
        assert_eq!(a.stellar, b.stellar);

        let c = simulate(&SimulationSettings { seed: 7, ..sim }, &settings).unwrap();
        assert_ne!(a.observations[0].flux, c.observations[0].flux);
    }

    #[test]
    fn noiseless_observation_has_no_errors() {
        let settings = ModelSettings::default();
        let sim = SimulationSettings {
            pixels: 100,
            snr: None,
            ..SimulationSettings::default()
        };
        let out = simulate(&sim, &settings).unwrap();
        let obs = &out.observations[0];
        assert!(obs.error.is_none());
        assert_eq!(obs.len(), 100);
        assert!(obs.flux.iter().all(|f| *f > 0.0 && *f <= 1.0 + 1e-9));
        assert!((obs.wavelength[99] - (6000.0 + 0.05 * 99.0)).abs() < 1e-9);
    }

    #[test]
    fn orders_follow_each_other() {
        let settings = ModelSettings::default();
        let sim = SimulationSettings {
            orders: 3,
            pixels: 100,
            order: 5,
            ..SimulationSettings::default()
        };
        let out = simulate(&sim, &settings).unwrap();
        assert_eq!(out.observations.len(), 3);
        assert_eq!(out.truth.len(), 3);
        assert_eq!(out.observations[2].order, 7);
        assert!((out.observations[1].wavelength[0] - 6005.0).abs() < 1e-9);
    }

    #[test]
    fn line_template_puts_lines_where_asked() {
        let line = Line { center: 6001.0, depth: 0.5, sigma: 0.1 };
        let t = line_template(6000.0, 6002.0, 0.01, &[line]).unwrap();
        let i = t
            .flux
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert!((t.wavelength[i] - 6001.0).abs() < 1e-9);
        assert!((t.flux[i] - 0.5).abs() < 1e-12);
        assert!(line_template(6000.0, 5999.0, 0.01, &[]).is_err());
    }
}
