//! Command-line parsing for the forward-model RV fitter.
//!
//! Argument parsing and command dispatch stay separate from the modelling and
//! fitting code; `app` turns these structs into settings.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::{IpKind, NormKind};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "rvf", version, about = "Forward-model radial velocity fitter")]
pub struct Cli {
    /// Debug logging (overridden by `RVF_LOG`).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit the RV of every order with the staged nonlinear forward model.
    Fit(FitArgs),
    /// Solve the band-limited linear model at a given RV (optionally sweep RV).
    Band(BandArgs),
    /// Write a synthetic observation and its templates as CSV.
    Simulate(SimulateArgs),
}

/// Inputs and model options shared by `fit` and `band`.
#[derive(Debug, Args, Clone)]
pub struct ModelArgs {
    /// Observation CSV (`order,pixel,wavelength,flux[,error][,flag]`).
    pub observation: PathBuf,

    /// Stellar template CSV (`wavelength,flux`).
    pub template: PathBuf,

    /// Absorption cell template CSV, fixed in the observer frame.
    #[arg(long)]
    pub cell: Option<PathBuf>,

    /// Absorber (telluric) template CSV; repeat for several.
    #[arg(long = "absorber")]
    pub absorbers: Vec<PathBuf>,

    /// Orders to process (default: all).
    #[arg(long, value_delimiter = ',')]
    pub orders: Option<Vec<usize>>,

    /// Instrumental profile shape.
    #[arg(long, value_enum, default_value_t = IpKind::Gaussian)]
    pub ip: IpKind,

    /// IP half size in log-grid knots.
    #[arg(long, default_value_t = 50)]
    pub ip_half_size: usize,

    /// Default IP width (km/s).
    #[arg(long, default_value_t = 2.2)]
    pub ip_width: f64,

    /// Log-wavelength grid step (km/s).
    #[arg(long, default_value_t = 0.2)]
    pub grid_step: f64,

    /// Barycentric correction applied to the stellar template (km/s).
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub berv: f64,

    /// Degree of the wavelength solution.
    #[arg(long, default_value_t = 3)]
    pub wave_degree: usize,

    /// Inclusive pixel range (e.g. to avoid a known continuum artefact).
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    pub pixel_window: Option<Vec<usize>>,

    /// Ignore the flux error column.
    #[arg(long)]
    pub no_errors: bool,
}

#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Starting RV (km/s).
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub rv_guess: f64,

    /// Degree of the continuum polynomial in the last stage.
    #[arg(long, default_value_t = 3)]
    pub norm_degree: usize,

    /// Continuum function.
    #[arg(long, value_enum, default_value_t = NormKind::Poly)]
    pub norm: NormKind,

    /// Denominator terms of the rational continuum.
    #[arg(long, default_value_t = 1)]
    pub norm_denominator: usize,

    /// Fit one shared velocity shift of the absorbers.
    #[arg(long)]
    pub absorber_shift: bool,

    /// Fit an additive background level.
    #[arg(long)]
    pub background: bool,

    /// Maximum solver iterations per stage.
    #[arg(long, default_value_t = 200)]
    pub max_iterations: usize,

    /// Export per-order RVs to CSV.
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Export all fitted parameters to CSV.
    #[arg(long)]
    pub export_params: Option<PathBuf>,

    /// Export the run (settings, per-order results, aggregate) to JSON.
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Export observed and model flux per pixel to CSV.
    #[arg(long)]
    pub export_model: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct BandArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Trial RV (km/s).
    #[arg(long, allow_hyphen_values = true)]
    pub rv: f64,

    /// RV sweep `START STOP STEP` (km/s).
    #[arg(long, num_args = 3, value_names = ["START", "STOP", "STEP"], allow_hyphen_values = true)]
    pub rv_sweep: Option<Vec<f64>>,

    /// Degree of the continuum polynomial.
    #[arg(long, default_value_t = 2)]
    pub degree: usize,

    /// Width of the basis Gaussians (km/s).
    #[arg(long, default_value_t = 2.2)]
    pub basis_width: f64,

    /// Basis offsets in units of the basis width.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_values_t = vec![-1.4, -0.7, 0.0, 0.7, 1.4])]
    pub offsets: Vec<f64>,

    /// Export the band fits (and sweep) to JSON.
    #[arg(long)]
    pub export_json: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Output directory for `observation.csv`, `template.csv`, `cell.csv`, `truth.json`.
    #[arg(long)]
    pub out_dir: PathBuf,

    /// Injected RV (km/s).
    #[arg(long, default_value_t = 5.0, allow_hyphen_values = true)]
    pub rv: f64,

    /// Signal-to-noise per pixel (0 for a noiseless observation).
    #[arg(long, default_value_t = 200.0)]
    pub snr: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 400)]
    pub pixels: usize,

    /// Number of orders, each shifted by the order width.
    #[arg(long, default_value_t = 1)]
    pub orders: usize,
}
