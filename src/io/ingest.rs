//! CSV ingest for observations and templates.
//!
//! Observation CSV: `order,pixel,wavelength,flux[,error][,flag]`, one row per
//! pixel, any row order. Template CSV: `wavelength,flux` (extra columns are
//! ignored).
//!
//! Rows that fail to parse are skipped and reported; schema problems and
//! chunks that fail validation are errors.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;

use crate::domain::{Chunk, Template};
use crate::error::AppError;

/// A row-level error encountered during ingest.
#[derive(Debug, Clone)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ObservationData {
    /// One chunk per order, sorted by order; pixels ascending.
    pub chunks: Vec<Chunk>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
    pub rows_used: usize,
}

#[derive(Debug, Clone, Copy)]
struct PixelRow {
    pixel: usize,
    wavelength: f64,
    flux: f64,
    error: Option<f64>,
    flag: bool,
}

pub fn load_observation(path: &Path, orders: Option<&[usize]>) -> Result<ObservationData, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::io(format!("Failed to open observation '{}': {e}", path.display())))?;
    read_observation(file, orders)
}

pub fn load_template(path: &Path) -> Result<Template, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::io(format!("Failed to open template '{}': {e}", path.display())))?;
    read_template(file)
}

/// Parse observation rows and group them into chunks, optionally keeping only `orders`.
pub fn read_observation<R: Read>(source: R, orders: Option<&[usize]>) -> Result<ObservationData, AppError> {
    let mut reader = csv_reader(source);
    let headers = reader
        .headers()
        .map_err(|e| AppError::io(format!("Failed to read observation headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);
    for col in ["order", "pixel", "wavelength", "flux"] {
        require_column(&header_map, col)?;
    }
    let has_error = header_map.contains_key("error");
    let has_flag = header_map.contains_key("flag");

    let mut by_order: BTreeMap<usize, Vec<PixelRow>> = BTreeMap::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;

    for (idx, result) in reader.records().enumerate() {
        // +2: one header line, 1-based line numbers.
        let line = idx + 2;
        rows_read += 1;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };
        match parse_pixel_row(&record, &header_map) {
            Ok((order, row)) => {
                if orders.is_none_or(|o| o.contains(&order)) {
                    by_order.entry(order).or_default().push(row);
                }
            }
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }

    let mut chunks = Vec::with_capacity(by_order.len());
    let mut rows_used = 0;
    for (order, mut rows) in by_order {
        rows.sort_by_key(|r| r.pixel);
        rows_used += rows.len();
        let chunk = Chunk {
            order,
            pixel: rows.iter().map(|r| r.pixel).collect(),
            wavelength: rows.iter().map(|r| r.wavelength).collect(),
            flux: rows.iter().map(|r| r.flux).collect(),
            error: has_error.then(|| rows.iter().map(|r| r.error.unwrap_or(f64::NAN)).collect()),
            flags: has_flag.then(|| rows.iter().map(|r| r.flag).collect()),
        };
        chunk.validate()?;
        chunks.push(chunk);
    }

    if chunks.is_empty() {
        return Err(AppError::input("No observation rows remain after parsing/filtering."));
    }

    Ok(ObservationData {
        chunks,
        row_errors,
        rows_read,
        rows_used,
    })
}

/// Parse a `(wavelength, flux)` template; unparsable rows are an error.
pub fn read_template<R: Read>(source: R) -> Result<Template, AppError> {
    let mut reader = csv_reader(source);
    let headers = reader
        .headers()
        .map_err(|e| AppError::io(format!("Failed to read template headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);
    let w_idx = require_column(&header_map, "wavelength")?;
    let f_idx = require_column(&header_map, "flux")?;

    let mut wavelength = Vec::new();
    let mut flux = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        let record = result.map_err(|e| AppError::io(format!("Template line {line}: {e}")))?;
        let w = parse_f64(&record, w_idx, "wavelength").map_err(|e| AppError::input(format!("Template line {line}: {e}")))?;
        let f = parse_f64(&record, f_idx, "flux").map_err(|e| AppError::input(format!("Template line {line}: {e}")))?;
        wavelength.push(w);
        flux.push(f);
    }
    Template::new(wavelength, flux)
}

fn csv_reader<R: Read>(source: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(source)
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports may prefix the first header with a UTF-8 BOM.
    name.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
}

fn require_column(header_map: &HashMap<String, usize>, name: &str) -> Result<usize, AppError> {
    header_map
        .get(name)
        .copied()
        .ok_or_else(|| AppError::input(format!("Missing required column: `{name}`")))
}

fn parse_pixel_row(record: &StringRecord, header_map: &HashMap<String, usize>) -> Result<(usize, PixelRow), String> {
    let field = |name: &str| header_map.get(name).and_then(|&i| record.get(i)).unwrap_or("");
    let order = field("order")
        .parse::<usize>()
        .map_err(|_| format!("Invalid order `{}`", field("order")))?;
    let pixel = field("pixel")
        .parse::<usize>()
        .map_err(|_| format!("Invalid pixel `{}`", field("pixel")))?;
    let wavelength = parse_value(field("wavelength"), "wavelength")?;
    let flux = parse_value(field("flux"), "flux")?;
    let error = match field("error") {
        "" => None,
        s => Some(parse_value(s, "error")?),
    };
    let flag = parse_flag(field("flag"))?;
    Ok((
        order,
        PixelRow {
            pixel,
            wavelength,
            flux,
            error,
            flag,
        },
    ))
}

fn parse_f64(record: &StringRecord, idx: usize, name: &str) -> Result<f64, String> {
    parse_value(record.get(idx).unwrap_or(""), name)
}

/// Accepts `nan` so that masked flux can be carried through to the usability check.
fn parse_value(s: &str, name: &str) -> Result<f64, String> {
    s.parse::<f64>().map_err(|_| format!("Invalid {name} `{s}`"))
}

fn parse_flag(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "ok" => Ok(false),
        "1" | "true" | "bad" => Ok(true),
        other => Err(format!("Invalid flag `{other}`")),
    }
}
