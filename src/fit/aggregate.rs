//! Cross-chunk RV aggregate.

use serde::Serialize;

use crate::domain::ChunkRv;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RvSummary {
    pub rv: f64,
    pub e_rv: f64,
    pub n_valid: usize,
    pub n_total: usize,
}

/// Mean RV over valid chunks with the standard error `std / sqrt(n - 1)`.
///
/// Invalid (NaN) chunks are skipped. With a single valid chunk its own formal
/// error is reported; with none the aggregate fails.
pub fn aggregate(chunks: &[ChunkRv]) -> Result<RvSummary, AppError> {
    let valid: Vec<&ChunkRv> = chunks.iter().filter(|c| c.is_valid()).collect();
    let n = valid.len();
    let (rv, e_rv) = match n {
        0 => {
            return Err(AppError::convergence(format!(
                "All {} chunks failed; no RV to aggregate.",
                chunks.len()
            )));
        }
        1 => (valid[0].rv, valid[0].e_rv),
        _ => {
            let mean = valid.iter().map(|c| c.rv).sum::<f64>() / n as f64;
            let var = valid.iter().map(|c| (c.rv - mean).powi(2)).sum::<f64>() / n as f64;
            (mean, var.sqrt() / ((n - 1) as f64).sqrt())
        }
    };
    Ok(RvSummary {
        rv,
        e_rv,
        n_valid: n,
        n_total: chunks.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn rv(order: usize, rv: f64, e_rv: f64) -> ChunkRv {
        ChunkRv { order, rv, e_rv }
    }

    #[test]
    fn failed_chunk_is_skipped() {
        let out = aggregate(&[ChunkRv::failed(1), rv(2, 3.0, 0.2)]).unwrap();
        assert_eq!(out.rv, 3.0);
        assert_eq!(out.e_rv, 0.2);
        assert_eq!((out.n_valid, out.n_total), (1, 2));
    }

    #[test]
    fn standard_error_uses_n_minus_one() {
        let out = aggregate(&[rv(1, 1.0, 0.1), rv(2, 3.0, 0.1), ChunkRv::failed(3)]).unwrap();
        assert_eq!(out.rv, 2.0);
        // std (ddof 0) = 1, sqrt(n - 1) = 1.
        assert!((out.e_rv - 1.0).abs() < 1e-12);

        let out = aggregate(&[rv(1, 1.0, 0.1), rv(2, 2.0, 0.1), rv(3, 3.0, 0.1)]).unwrap();
        let expected = (2.0f64 / 3.0).sqrt() / 2f64.sqrt();
        assert!((out.e_rv - expected).abs() < 1e-12);
    }

    #[test]
    fn all_failed_is_an_error() {
        let err = aggregate(&[ChunkRv::failed(1), ChunkRv::failed(2)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Convergence);
        assert!(aggregate(&[]).is_err());
    }
}
