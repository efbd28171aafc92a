//! Formatted terminal output.
//!
//! Formatting lives in one place so the fitting code stays free of
//! presentation concerns and output changes stay localized.

use crate::app::pipeline::BandRecord;
use crate::domain::{ChunkRecord, ModelSettings};
use crate::error::AppError;
use crate::fit::{ChunkFit, FitSettings, RvSummary};

/// Run header: model and solver settings.
pub fn format_run_header(model: &ModelSettings, fit: &FitSettings, berv: f64) -> String {
    let mut out = String::new();
    out.push_str("Forward-model RV fit\n");
    out.push_str(&format!(
        "IP: {} | half size {} | width {:.3} km/s | grid step {:.3} km/s\n",
        model.ip_kind.display_name(),
        model.ip_half_size,
        model.ip_width,
        model.grid_step_kms
    ));
    out.push_str(&format!(
        "Wavelength degree {} | continuum degree {} ({:?}) | RV guess {:.3} km/s | BERV {:.3} km/s\n",
        fit.wave_degree, fit.norm_degree, model.norm, fit.rv_guess, berv
    ));
    if let Some((s, e)) = fit.pixel_window {
        out.push_str(&format!("Pixel window: [{s}, {e}]\n"));
    }
    out
}

/// Per-order RV table.
pub fn format_chunk_table(records: &[ChunkRecord]) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        format!("{:>6} {:>12} {:>10} {:>8} {:>9} {}", "order", "rv", "e_rv", "pixels", "chi2_red", "status"),
    );
    push_line(&mut out, format!("{:-<6} {:-<12} {:-<10} {:-<8} {:-<9} {:-<6}", "", "", "", "", "", ""));
    for r in records {
        push_line(
            &mut out,
            format!(
                "{:>6} {:>12} {:>10} {:>8} {:>9} {}",
                r.order,
                fmt_num(r.rv, 4),
                fmt_num(r.e_rv, 4),
                r.n_pixels,
                fmt_num(r.chi2_red, 3),
                truncate(&r.status, 60)
            ),
        );
    }
    out
}

/// Stage diagnostics of the successful chunks.
pub fn format_stage_table(fits: &[&ChunkFit]) -> String {
    let mut out = String::new();
    for fit in fits {
        out.push_str(&format!("Order {}:\n", fit.order));
        for s in &fit.stages {
            push_line(
                &mut out,
                format!(
                    "  {:<11} free={:<3} pixels={:<6} chi2={:<14} iterations={}",
                    s.stage.label(),
                    s.free,
                    s.n_pixels,
                    fmt_num(s.chi2, 6),
                    s.iterations
                ),
            );
        }
    }
    out
}

pub fn format_aggregate(summary: &Result<RvSummary, AppError>) -> String {
    match summary {
        Ok(s) => format!(
            "RV = {:.4} ± {:.4} km/s ({} of {} orders)\n",
            s.rv, s.e_rv, s.n_valid, s.n_total
        ),
        Err(e) => format!("RV unavailable: {e}\n"),
    }
}

/// Band-limited fits, one line per order, with the sweep minimum when present.
pub fn format_band_table(records: &[BandRecord]) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        format!("{:>6} {:>8} {:>14} {:>6} {:>10} {}", "order", "pixels", "chi2", "rank", "best_rv", "status"),
    );
    push_line(&mut out, format!("{:-<6} {:-<8} {:-<14} {:-<6} {:-<10} {:-<6}", "", "", "", "", "", ""));
    for r in records {
        let (chi2, rank) = r
            .fit
            .as_ref()
            .map(|f| (fmt_num(f.chi2, 6), f.rank.to_string()))
            .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
        let best = r.best.map(|p| fmt_num(p.rv, 3)).unwrap_or_else(|| "-".to_string());
        push_line(
            &mut out,
            format!(
                "{:>6} {:>8} {:>14} {:>6} {:>10} {}",
                r.order,
                r.n_pixels,
                chi2,
                rank,
                best,
                truncate(&r.status, 60)
            ),
        );
    }
    out
}

fn push_line(out: &mut String, line: String) {
    out.push_str(line.trim_end());
    out.push('\n');
}

fn fmt_num(v: f64, decimals: usize) -> String {
    if v.is_finite() {
        format!("{v:.decimals$}")
    } else {
        "nan".to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(order: usize, rv: f64, status: &str) -> ChunkRecord {
        ChunkRecord {
            order,
            rv,
            e_rv: if rv.is_nan() { f64::NAN } else { 0.01 },
            n_pixels: 300,
            chi2_red: 1.02,
            status: status.to_string(),
        }
    }

    #[test]
    fn chunk_table_marks_failures_as_nan() {
        let table = format_chunk_table(&[record(1, 3.21, "ok"), record(2, f64::NAN, "convergence: singular Jacobian")]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("3.2100"));
        assert!(lines[3].contains("nan"));
        assert!(lines[3].ends_with("convergence: singular Jacobian"));
    }

    #[test]
    fn aggregate_line_reports_counts_or_error() {
        let ok = Ok(RvSummary {
            rv: 3.0,
            e_rv: 0.2,
            n_valid: 1,
            n_total: 2,
        });
        assert_eq!(format_aggregate(&ok), "RV = 3.0000 ± 0.2000 km/s (1 of 2 orders)\n");
        let err = Err(AppError::convergence("All 2 chunks failed"));
        assert!(format_aggregate(&err).starts_with("RV unavailable"));
    }

    #[test]
    fn long_status_is_truncated() {
        let s = "x".repeat(100);
        assert_eq!(truncate(&s, 10).chars().count(), 10);
        assert_eq!(truncate("short", 10), "short");
    }
}
