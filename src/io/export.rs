//! Result exports (CSV/JSON) and CSV writers for synthetic inputs.
//!
//! The CSV files are meant to be easy to consume in spreadsheets or downstream
//! scripts; the JSON run file carries everything needed to reproduce the
//! report.

use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::domain::{Chunk, ChunkRecord, Template};
use crate::error::AppError;
use crate::fit::{ChunkFit, GroupKind, RvSummary, StageSummary};

/// One pixel of a re-evaluated model curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPoint {
    pub order: usize,
    pub pixel: usize,
    pub observed: f64,
    pub model: f64,
    pub residual: f64,
}

#[derive(Debug, Clone, Serialize)]
struct ParamRow {
    order: usize,
    group: GroupKind,
    index: usize,
    value: f64,
    error: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct ObservationRow {
    order: usize,
    pixel: usize,
    wavelength: f64,
    flux: f64,
    error: Option<f64>,
    flag: u8,
}

#[derive(Debug, Clone, Serialize)]
struct TemplateRow {
    wavelength: f64,
    flux: f64,
}

/// Settings echoed into the JSON run file.
#[derive(Debug, Clone, Serialize)]
pub struct RunSettings {
    pub ip: String,
    pub ip_half_size: usize,
    pub grid_step_kms: f64,
    pub norm: String,
    pub rv_guess: f64,
    pub berv: f64,
    pub wave_degree: usize,
    pub norm_degree: usize,
    pub pixel_window: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkStages {
    pub order: usize,
    pub stages: Vec<StageSummary>,
}

/// JSON run file written by `rvf fit --export-json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunFile<'a> {
    pub tool: &'static str,
    pub created: DateTime<Local>,
    pub observation: String,
    pub template: String,
    pub settings: RunSettings,
    pub summary: Option<RvSummary>,
    pub chunks: &'a [ChunkRecord],
    pub stages: Vec<ChunkStages>,
}

/// Per-chunk RV table.
pub fn write_rv_csv(path: &Path, records: &[ChunkRecord]) -> Result<(), AppError> {
    write_rows(path, "RV table", records.iter())
}

/// All fitted parameters of the successful chunks, one row per value.
pub fn write_params_csv(path: &Path, fits: &[&ChunkFit]) -> Result<(), AppError> {
    let rows = fits.iter().flat_map(|fit| {
        fit.estimates().into_iter().map(move |e| ParamRow {
            order: fit.order,
            group: e.group,
            index: e.index,
            value: e.value,
            error: e.error,
        })
    });
    write_rows(path, "parameter table", rows)
}

pub fn write_model_csv(path: &Path, points: &[ModelPoint]) -> Result<(), AppError> {
    write_rows(path, "model curve", points.iter())
}

/// Observation in the format read by `io::ingest`.
pub fn write_observation_csv(path: &Path, chunks: &[Chunk]) -> Result<(), AppError> {
    let rows = chunks.iter().flat_map(|c| {
        (0..c.len()).map(move |i| ObservationRow {
            order: c.order,
            pixel: c.pixel[i],
            wavelength: c.wavelength[i],
            flux: c.flux[i],
            error: c.error.as_ref().map(|e| e[i]),
            flag: u8::from(c.flags.as_ref().is_some_and(|f| f[i])),
        })
    });
    write_rows(path, "observation", rows)
}

pub fn write_template_csv(path: &Path, template: &Template) -> Result<(), AppError> {
    let rows = template
        .wavelength
        .iter()
        .zip(template.flux.iter())
        .map(|(&wavelength, &flux)| TemplateRow { wavelength, flux });
    write_rows(path, "template", rows)
}

/// Pretty-printed JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::io(format!("Failed to create JSON '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(file, value)
        .map_err(|e| AppError::io(format!("Failed to write JSON '{}': {e}", path.display())))
}

fn write_rows<T, I>(path: &Path, what: &str, rows: I) -> Result<(), AppError>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| AppError::io(format!("Failed to create {what} CSV '{}': {e}", path.display())))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| AppError::io(format!("Failed to write {what} CSV row: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| AppError::io(format!("Failed to flush {what} CSV: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ingest::{load_observation, load_template};

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("rvf-export-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn observation_and_template_round_trip_through_ingest() {
        let chunk = Chunk {
            order: 3,
            pixel: vec![0, 1, 2],
            wavelength: vec![6000.0, 6000.05, 6000.1],
            flux: vec![1.0, 0.5, 0.9],
            error: Some(vec![0.01, 0.02, 0.01]),
            flags: Some(vec![false, true, false]),
        };
        let path = scratch("obs.csv");
        write_observation_csv(&path, std::slice::from_ref(&chunk)).unwrap();
        let back = load_observation(&path, None).unwrap();
        assert_eq!(back.chunks.len(), 1);
        assert_eq!(back.chunks[0].flux, chunk.flux);
        assert_eq!(back.chunks[0].flags, chunk.flags);
        assert_eq!(back.chunks[0].error, chunk.error);

        let template = Template::new(vec![5999.0, 6000.0, 6001.0], vec![1.0, 0.7, 1.0]).unwrap();
        let path = scratch("tpl.csv");
        write_template_csv(&path, &template).unwrap();
        assert_eq!(load_template(&path).unwrap(), template);
    }

    #[test]
    fn rv_table_has_header_and_nan_for_failed_chunks() {
        let records = vec![
            ChunkRecord {
                order: 1,
                rv: 3.0,
                e_rv: 0.2,
                n_pixels: 100,
                chi2_red: 1.1,
                status: "ok".to_string(),
            },
            ChunkRecord {
                order: 2,
                rv: f64::NAN,
                e_rv: f64::NAN,
                n_pixels: 0,
                chi2_red: f64::NAN,
                status: "convergence: singular".to_string(),
            },
        ];
        let path = scratch("rv.csv");
        write_rv_csv(&path, &records).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("order,rv,e_rv,n_pixels,chi2_red,status"));
        assert_eq!(lines.next(), Some("1,3.0,0.2,100,1.1,ok"));
        assert!(lines.next().is_some_and(|l| l.starts_with("2,NaN,NaN,0")));
    }
}
