//! Shared run logic for the `fit` and `band` commands.
//!
//! Workflow per chunk: build the chunk's forward model on its own log grid,
//! fit it, and turn any error into an invalid (NaN) record. Chunks are
//! independent and are processed in parallel; results keep the input order.

use rayon::prelude::*;
use tracing::{info, warn};

use crate::domain::{Chunk, ChunkRecord, ChunkRv, ModelSettings, Template};
use crate::error::AppError;
use crate::fit::{aggregate, fit_chunk, stage_pixels, wavelength_prior, ChunkFit, FitSettings, RvSummary};
use crate::io::export::ModelPoint;
use crate::models::{best_point, BandFit, BandModel, BandSettings, ForwardModel, ModelInputs, SweepPoint};

/// Spectra shared by every chunk of a run.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub chunks: Vec<Chunk>,
    pub stellar: Template,
    pub cell: Option<Template>,
    pub absorbers: Vec<Template>,
}

impl RunInputs {
    /// Stellar template moved by the barycentric correction (`λ (1 + berv/c)`).
    pub fn with_berv(mut self, berv: f64, c_kms: f64) -> Self {
        if berv != 0.0 {
            self.stellar = self.stellar.doppler_shifted(berv, c_kms);
        }
        self
    }

    fn model_inputs(&self) -> ModelInputs<'_> {
        ModelInputs {
            stellar: &self.stellar,
            cell: self.cell.as_ref(),
            absorbers: &self.absorbers,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub record: ChunkRecord,
    pub fit: Option<ChunkFit>,
    pub curve: Vec<ModelPoint>,
}

/// All outputs of one `fit` run.
#[derive(Debug, Clone)]
pub struct FitRun {
    pub outcomes: Vec<ChunkOutcome>,
    /// Fails only when no chunk produced a valid RV.
    pub summary: Result<RvSummary, AppError>,
}

impl FitRun {
    pub fn records(&self) -> Vec<ChunkRecord> {
        self.outcomes.iter().map(|o| o.record.clone()).collect()
    }

    pub fn fits(&self) -> Vec<&ChunkFit> {
        self.outcomes.iter().filter_map(|o| o.fit.as_ref()).collect()
    }

    pub fn curve(&self) -> Vec<ModelPoint> {
        self.outcomes.iter().flat_map(|o| o.curve.iter().copied()).collect()
    }
}

/// Fit every chunk and aggregate the valid RVs.
pub fn run_fit(inputs: &RunInputs, model_settings: &ModelSettings, fit_settings: &FitSettings) -> FitRun {
    let outcomes: Vec<ChunkOutcome> = inputs
        .chunks
        .par_iter()
        .map(|chunk| fit_one(chunk, inputs.model_inputs(), model_settings, fit_settings))
        .collect();

    let rvs: Vec<ChunkRv> = outcomes.iter().map(|o| o.record.chunk_rv()).collect();
    let summary = aggregate(&rvs);
    if let Ok(s) = &summary {
        info!(rv = s.rv, e_rv = s.e_rv, valid = s.n_valid, total = s.n_total, "aggregate RV");
    }
    FitRun { outcomes, summary }
}

fn fit_one(
    chunk: &Chunk,
    inputs: ModelInputs<'_>,
    model_settings: &ModelSettings,
    fit_settings: &FitSettings,
) -> ChunkOutcome {
    let result = ForwardModel::for_chunk(inputs, chunk, model_settings).and_then(|model| {
        let fit = fit_chunk(&model, chunk, fit_settings)?;
        let curve = model_curve(&model, chunk, &fit)?;
        Ok((fit, curve))
    });

    match result {
        Ok((fit, curve)) => {
            info!(order = chunk.order, rv = fit.rv, e_rv = fit.e_rv, pixels = fit.pixels.len(), "chunk fitted");
            ChunkOutcome {
                record: ChunkRecord {
                    order: chunk.order,
                    rv: fit.rv,
                    e_rv: fit.e_rv,
                    n_pixels: fit.pixels.len(),
                    chi2_red: fit.reduced_chi2(),
                    status: "ok".to_string(),
                },
                fit: Some(fit),
                curve,
            }
        }
        Err(err) => {
            warn!(order = chunk.order, kind = err.kind().label(), "chunk failed: {}", err.message());
            let rv = ChunkRv::failed(chunk.order);
            ChunkOutcome {
                record: ChunkRecord {
                    order: chunk.order,
                    rv: rv.rv,
                    e_rv: rv.e_rv,
                    n_pixels: 0,
                    chi2_red: f64::NAN,
                    status: err.to_string(),
                },
                fit: None,
                curve: Vec::new(),
            }
        }
    }
}

/// Observed and model flux at the pixels of the final stage.
pub fn model_curve(model: &ForwardModel, chunk: &Chunk, fit: &ChunkFit) -> Result<Vec<ModelPoint>, AppError> {
    let x: Vec<f64> = fit.pixels.iter().map(|&i| chunk.pixel[i] as f64).collect();
    let m = model.evaluate(&x, &fit.params)?;
    Ok(fit
        .pixels
        .iter()
        .zip(m)
        .map(|(&i, model)| ModelPoint {
            order: chunk.order,
            pixel: chunk.pixel[i],
            observed: chunk.flux[i],
            model,
            residual: chunk.flux[i] - model,
        })
        .collect())
}

/// Band-limited solve of one chunk.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BandRecord {
    pub order: usize,
    pub n_pixels: usize,
    pub fit: Option<BandFit>,
    pub sweep: Vec<SweepPoint>,
    pub best: Option<SweepPoint>,
    pub status: String,
}

/// Linear band fit of every chunk at `rv`, plus an optional RV sweep.
pub fn run_band(
    inputs: &RunInputs,
    model_settings: &ModelSettings,
    fit_settings: &FitSettings,
    band_settings: &BandSettings,
    rv: f64,
    sweep: &[f64],
) -> Vec<BandRecord> {
    inputs
        .chunks
        .par_iter()
        .map(|chunk| {
            match band_one(chunk, inputs.model_inputs(), model_settings, fit_settings, band_settings, rv, sweep) {
                Ok(record) => record,
                Err(err) => {
                    warn!(order = chunk.order, kind = err.kind().label(), "band fit failed: {}", err.message());
                    BandRecord {
                        order: chunk.order,
                        n_pixels: 0,
                        fit: None,
                        sweep: Vec::new(),
                        best: None,
                        status: err.to_string(),
                    }
                }
            }
        })
        .collect()
}

fn band_one(
    chunk: &Chunk,
    inputs: ModelInputs<'_>,
    model_settings: &ModelSettings,
    fit_settings: &FitSettings,
    band_settings: &BandSettings,
    rv: f64,
    sweep: &[f64],
) -> Result<BandRecord, AppError> {
    chunk.validate()?;
    let model = ForwardModel::for_chunk(inputs, chunk, model_settings)?;
    let wave = wavelength_prior(&model, chunk, fit_settings)?;
    let idx = stage_pixels(&model, chunk, &wave, fit_settings.pixel_window, fit_settings.use_errors);
    let pixels: Vec<f64> = idx.iter().map(|&i| chunk.pixel[i] as f64).collect();
    let flux: Vec<f64> = idx.iter().map(|&i| chunk.flux[i]).collect();

    let band = BandModel::build(&model, &pixels, &wave, band_settings)?;
    let fit = band.fit(&flux, rv)?;
    let points = if sweep.is_empty() {
        Vec::new()
    } else {
        band.sweep(&flux, sweep)?
    };
    let best = best_point(&points);
    info!(order = chunk.order, chi2 = fit.chi2, rank = fit.rank, "band fit");
    Ok(BandRecord {
        order: chunk.order,
        n_pixels: pixels.len(),
        fit: Some(fit),
        sweep: points,
        best,
        status: "ok".to_string(),
    })
}
