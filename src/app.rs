//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - sets up logging
//! - parses CLI arguments into settings
//! - loads the observation and templates
//! - runs the staged fit or the band-limited solve
//! - prints reports and writes optional exports

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{BandArgs, Command, FitArgs, ModelArgs, SimulateArgs};
use crate::data::synthetic::{simulate, SimulationSettings};
use crate::domain::{ModelSettings, NormModel};
use crate::error::AppError;
use crate::fit::{FitSettings, LmConfig};
use crate::io::export::{
    write_json, write_model_csv, write_observation_csv, write_params_csv, write_rv_csv, write_template_csv,
    ChunkStages, RunFile, RunSettings,
};
use crate::io::ingest::{load_observation, load_template};
use crate::models::{rv_grid, BandSettings, ModelParams};

pub mod pipeline;

use pipeline::{run_band, run_fit, RunInputs};

/// Entry point for the `rvf` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Band(args) => handle_band(args),
        Command::Simulate(args) => handle_simulate(args),
    }
}

/// `RVF_LOG` (optionally from `.env`) wins over `--verbose`.
fn init_logging(verbose: bool) {
    dotenvy::dotenv().ok();
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("RVF_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    // Reports go to stdout; keep logs on stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let model_settings = model_settings_from_args(
        &args.model,
        NormModel::from_kind(args.norm, args.norm_denominator),
    );
    let fit_settings = fit_settings_from_args(&args)?;
    let inputs = load_inputs(&args.model)?.with_berv(args.model.berv, model_settings.c_kms);

    let run = run_fit(&inputs, &model_settings, &fit_settings);
    let records = run.records();
    let fits = run.fits();

    println!(
        "{}",
        crate::report::format_run_header(&model_settings, &fit_settings, args.model.berv)
    );
    println!("{}", crate::report::format_chunk_table(&records));
    println!("{}", crate::report::format_stage_table(&fits));
    print!("{}", crate::report::format_aggregate(&run.summary));

    if let Some(path) = &args.export {
        write_rv_csv(path, &records)?;
        info!(path = %path.display(), "wrote RV table");
    }
    if let Some(path) = &args.export_params {
        write_params_csv(path, &fits)?;
        info!(path = %path.display(), "wrote parameter table");
    }
    if let Some(path) = &args.export_model {
        write_model_csv(path, &run.curve())?;
        info!(path = %path.display(), "wrote model curve");
    }
    if let Some(path) = &args.export_json {
        let file = RunFile {
            tool: concat!("rvf ", env!("CARGO_PKG_VERSION")),
            created: chrono::Local::now(),
            observation: args.model.observation.display().to_string(),
            template: args.model.template.display().to_string(),
            settings: RunSettings {
                ip: model_settings.ip_kind.display_name().to_string(),
                ip_half_size: model_settings.ip_half_size,
                grid_step_kms: model_settings.grid_step_kms,
                norm: format!("{:?}", model_settings.norm),
                rv_guess: fit_settings.rv_guess,
                berv: args.model.berv,
                wave_degree: fit_settings.wave_degree,
                norm_degree: fit_settings.norm_degree,
                pixel_window: fit_settings.pixel_window,
            },
            summary: run.summary.as_ref().ok().copied(),
            chunks: &records,
            stages: fits
                .iter()
                .map(|f| ChunkStages {
                    order: f.order,
                    stages: f.stages.clone(),
                })
                .collect(),
        };
        write_json(path, &file)?;
        info!(path = %path.display(), "wrote run file");
    }

    // Exports are still written when every chunk failed.
    run.summary.map(|_| ())
}

fn handle_band(args: BandArgs) -> Result<(), AppError> {
    let model_settings = model_settings_from_args(&args.model, NormModel::Poly);
    let prior_settings = prior_settings_from_args(&args.model)?;
    let band_settings = band_settings_from_args(&args)?;
    let sweep = match args.rv_sweep.as_deref() {
        Some(&[start, stop, step]) => rv_grid(start, stop, step)?,
        Some(_) => return Err(AppError::input("--rv-sweep takes START STOP STEP.")),
        None => Vec::new(),
    };
    let inputs = load_inputs(&args.model)?.with_berv(args.model.berv, model_settings.c_kms);

    let records = run_band(&inputs, &model_settings, &prior_settings, &band_settings, args.rv, &sweep);
    println!("{}", crate::report::format_band_table(&records));

    if let Some(path) = &args.export_json {
        write_json(path, &records)?;
        info!(path = %path.display(), "wrote band fits");
    }
    if records.iter().all(|r| r.fit.is_none()) {
        return Err(AppError::convergence(format!(
            "Band fit failed for all {} chunks.",
            records.len()
        )));
    }
    Ok(())
}

/// Parameters of one simulated order, as written to `truth.json`.
#[derive(Debug, Clone, Serialize)]
struct TruthRecord<'a> {
    order: usize,
    params: &'a ModelParams,
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let sim = SimulationSettings {
        orders: args.orders,
        rv: args.rv,
        snr: (args.snr > 0.0).then_some(args.snr),
        seed: args.seed,
        pixels: args.pixels,
        ..SimulationSettings::default()
    };
    let settings = ModelSettings::default();
    let out = simulate(&sim, &settings)?;

    std::fs::create_dir_all(&args.out_dir).map_err(|e| {
        AppError::io(format!("Failed to create directory '{}': {e}", args.out_dir.display()))
    })?;
    write_observation_csv(&args.out_dir.join("observation.csv"), &out.observations)?;
    write_template_csv(&args.out_dir.join("template.csv"), &out.stellar)?;
    write_template_csv(&args.out_dir.join("cell.csv"), &out.cell)?;
    let truth: Vec<TruthRecord<'_>> = out
        .observations
        .iter()
        .zip(out.truth.iter())
        .map(|(chunk, params)| TruthRecord {
            order: chunk.order,
            params,
        })
        .collect();
    write_json(&args.out_dir.join("truth.json"), &truth)?;

    println!(
        "Wrote {} order(s) at RV {:.3} km/s to {}",
        out.observations.len(),
        sim.rv,
        args.out_dir.display()
    );
    Ok(())
}

fn load_inputs(args: &ModelArgs) -> Result<RunInputs, AppError> {
    let data = load_observation(&args.observation, args.orders.as_deref())?;
    for err in data.row_errors.iter().take(5) {
        warn!(line = err.line, "skipped observation row: {}", err.message);
    }
    if data.row_errors.len() > 5 {
        warn!(count = data.row_errors.len(), "observation rows skipped in total");
    }
    if data.chunks.is_empty() {
        return Err(AppError::input(format!(
            "No usable observation rows in '{}' for the selected orders.",
            args.observation.display()
        )));
    }
    info!(
        rows = data.rows_read,
        used = data.rows_used,
        chunks = data.chunks.len(),
        "loaded observation"
    );

    let stellar = load_template(&args.template)?;
    let cell = args.cell.as_deref().map(load_template).transpose()?;
    let absorbers = args
        .absorbers
        .iter()
        .map(|p| load_template(p))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RunInputs {
        chunks: data.chunks,
        stellar,
        cell,
        absorbers,
    })
}

pub fn model_settings_from_args(args: &ModelArgs, norm: NormModel) -> ModelSettings {
    ModelSettings {
        ip_kind: args.ip,
        ip_half_size: args.ip_half_size,
        ip_width: args.ip_width,
        grid_step_kms: args.grid_step,
        norm,
        ..ModelSettings::default()
    }
}

/// Settings shared by both commands: wavelength prior and pixel selection.
pub fn prior_settings_from_args(args: &ModelArgs) -> Result<FitSettings, AppError> {
    let pixel_window = match args.pixel_window.as_deref() {
        None => None,
        Some(&[start, end]) if start <= end => Some((start, end)),
        Some(&[start, end]) => {
            return Err(AppError::input(format!("Pixel window [{start}, {end}] is empty.")));
        }
        Some(_) => return Err(AppError::input("--pixel-window takes START END.")),
    };
    Ok(FitSettings {
        wave_degree: args.wave_degree,
        pixel_window,
        use_errors: !args.no_errors,
        ..FitSettings::default()
    })
}

pub fn fit_settings_from_args(args: &FitArgs) -> Result<FitSettings, AppError> {
    let base = prior_settings_from_args(&args.model)?;
    if args.absorber_shift && args.model.absorbers.is_empty() {
        return Err(AppError::input("--absorber-shift needs at least one --absorber template."));
    }
    Ok(FitSettings {
        rv_guess: args.rv_guess,
        norm_degree: args.norm_degree,
        fit_absorber_shift: args.absorber_shift,
        fit_background: args.background,
        lm: LmConfig {
            max_iterations: args.max_iterations,
            ..LmConfig::default()
        },
        ..base
    })
}

pub fn band_settings_from_args(args: &BandArgs) -> Result<BandSettings, AppError> {
    if args.offsets.is_empty() {
        return Err(AppError::input("At least one basis offset is required."));
    }
    Ok(BandSettings {
        degree: args.degree,
        sigma_kms: args.basis_width,
        offsets: args.offsets.clone(),
        ..BandSettings::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;

    fn fit_args(extra: &[&str]) -> FitArgs {
        let mut argv = vec!["rvf", "fit", "obs.csv", "tpl.csv"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Fit(args) => args,
            _ => panic!("expected fit"),
        }
    }

    #[test]
    fn fit_settings_follow_flags() {
        let args = fit_args(&["--pixel-window", "10", "200", "--no-errors", "--max-iterations", "50"]);
        let fit = fit_settings_from_args(&args).unwrap();
        assert_eq!(fit.pixel_window, Some((10, 200)));
        assert!(!fit.use_errors);
        assert_eq!(fit.lm.max_iterations, 50);
        assert_eq!(fit.wave_degree, 3);
    }

    #[test]
    fn reversed_pixel_window_is_rejected() {
        let args = fit_args(&["--pixel-window", "300", "200"]);
        let err = fit_settings_from_args(&args).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Input);
    }

    #[test]
    fn absorber_shift_needs_an_absorber() {
        let args = fit_args(&["--absorber-shift"]);
        assert!(fit_settings_from_args(&args).is_err());
        let args = fit_args(&["--absorber-shift", "--absorber", "h2o.csv"]);
        assert!(fit_settings_from_args(&args).unwrap().fit_absorber_shift);
    }

    #[test]
    fn model_settings_keep_defaults_for_unset_fields() {
        let args = fit_args(&["--ip", "bg", "--grid-step", "0.5"]);
        let settings = model_settings_from_args(&args.model, NormModel::Rational { denominator: 2 });
        assert_eq!(settings.grid_step_kms, 0.5);
        assert_eq!(settings.norm.denominator_len(), 2);
        assert_eq!(settings.velocity_margin_kms, ModelSettings::default().velocity_margin_kms);
    }
}
