//! Damped least squares (Levenberg–Marquardt) with a forward-difference
//! Jacobian.
//!
//! The model is any closure mapping a flat parameter vector to predictions;
//! residuals are `(y - f) / sigma`. Columns of the Jacobian are scaled to unit
//! norm before damping, so the damping term acts on all parameters alike
//! regardless of their units (a wavelength offset in Å next to an RV in km/s).
//!
//! Finite-difference steps are `sqrt(epsfcn)·max(|p|, typical)`, where the
//! caller may supply a typical magnitude per parameter. Polynomial terms whose
//! fitted value is close to zero need it: a purely relative step on a cubic
//! coefficient of 1e-21 leaves the model unchanged to machine precision.

use nalgebra::{DMatrix, DVector};
use tracing::trace;

use crate::error::AppError;

/// Solver tolerances and damping schedule.
#[derive(Debug, Clone)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Relative chi-square reduction below which an accepted step ends the fit.
    pub ftol: f64,
    /// Relative (scaled) step size below which the fit is considered stationary.
    pub xtol: f64,
    /// Relative precision of the model; finite-difference steps are `sqrt(epsfcn)·|p|`
    /// (or the parameter's typical magnitude, when larger).
    pub epsfcn: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    pub max_lambda: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-10,
            xtol: 1e-10,
            epsfcn: 1e-12,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e16,
        }
    }
}

/// Converged solution with its covariance.
#[derive(Debug, Clone)]
pub struct LmFit {
    pub params: Vec<f64>,
    /// `inv(JᵀJ) · chi2 / dof`.
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub dof: usize,
    pub iterations: usize,
}

impl LmFit {
    /// One-sigma uncertainties from the covariance diagonal.
    pub fn errors(&self) -> Vec<f64> {
        (0..self.params.len())
            .map(|i| self.covariance[(i, i)].max(0.0).sqrt())
            .collect()
    }

    pub fn reduced_chi2(&self) -> f64 {
        if self.dof == 0 {
            f64::NAN
        } else {
            self.chi2 / self.dof as f64
        }
    }
}

struct Problem<'a, F> {
    model: F,
    y: &'a [f64],
    sigma: Option<&'a [f64]>,
    typical: &'a [f64],
}

impl<F> Problem<'_, F>
where
    F: Fn(&[f64]) -> Result<Vec<f64>, AppError>,
{
    fn residuals(&self, p: &[f64]) -> Result<DVector<f64>, AppError> {
        let f = (self.model)(p)?;
        if f.len() != self.y.len() {
            return Err(AppError::input(format!(
                "Model returned {} values for {} observations.",
                f.len(),
                self.y.len()
            )));
        }
        let r = DVector::from_iterator(
            f.len(),
            f.iter().zip(self.y).enumerate().map(|(i, (fi, yi))| {
                let s = self.sigma.map(|s| s[i]).unwrap_or(1.0);
                (yi - fi) / s
            }),
        );
        if r.iter().any(|v| !v.is_finite()) {
            return Err(AppError::numerical("Non-finite residual."));
        }
        Ok(r)
    }

    fn jacobian(&self, p: &[f64], r0: &DVector<f64>, epsfcn: f64) -> Result<DMatrix<f64>, AppError> {
        let eps = epsfcn.sqrt();
        let mut jac = DMatrix::<f64>::zeros(r0.len(), p.len());
        let mut moved = p.to_vec();
        for j in 0..p.len() {
            let scale = p[j].abs().max(self.typical[j].abs());
            let h = if scale == 0.0 { eps } else { eps * scale };
            moved[j] = p[j] + h;
            let (r, step) = match self.residuals(&moved) {
                Ok(r) => (r, h),
                // Forward step left the model's domain: difference backwards.
                Err(err) => {
                    moved[j] = p[j] - h;
                    let r = self.residuals(&moved).map_err(|_| err)?;
                    (r, -h)
                }
            };
            moved[j] = p[j];
            jac.set_column(j, &((r - r0) / step));
        }
        Ok(jac)
    }
}

/// Column norms of `jac`; a zero column means that parameter has no effect.
fn column_scales(jac: &DMatrix<f64>) -> Result<DVector<f64>, AppError> {
    let d = DVector::from_iterator(jac.ncols(), jac.column_iter().map(|c| c.norm()));
    if let Some(j) = d.iter().position(|v| *v == 0.0 || !v.is_finite()) {
        return Err(AppError::convergence(format!(
            "Singular Jacobian: parameter {j} does not influence the model."
        )));
    }
    Ok(d)
}

/// Minimize `Σ ((y - model(p)) / sigma)²` starting from `p0`.
pub fn curve_fit<F>(
    model: F,
    y: &[f64],
    sigma: Option<&[f64]>,
    p0: &[f64],
    cfg: &LmConfig,
) -> Result<LmFit, AppError>
where
    F: Fn(&[f64]) -> Result<Vec<f64>, AppError>,
{
    curve_fit_scaled(model, y, sigma, p0, &vec![0.0; p0.len()], cfg)
}

/// [`curve_fit`] with a typical magnitude per parameter for the difference steps.
pub fn curve_fit_scaled<F>(
    model: F,
    y: &[f64],
    sigma: Option<&[f64]>,
    p0: &[f64],
    typical: &[f64],
    cfg: &LmConfig,
) -> Result<LmFit, AppError>
where
    F: Fn(&[f64]) -> Result<Vec<f64>, AppError>,
{
    let n = y.len();
    let m = p0.len();
    if m == 0 {
        return Err(AppError::input("No free parameters to fit."));
    }
    if typical.len() != m {
        return Err(AppError::input(format!(
            "Got {} typical magnitudes for {m} parameters.",
            typical.len()
        )));
    }
    if n <= m {
        return Err(AppError::input(format!(
            "Need more observations ({n}) than free parameters ({m})."
        )));
    }
    if let Some(s) = sigma {
        if s.len() != n {
            return Err(AppError::input("Sigma length does not match observations."));
        }
        if s.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return Err(AppError::input("Sigma values must be finite and positive."));
        }
    }

    let problem = Problem {
        model,
        y,
        sigma,
        typical,
    };
    let mut p = p0.to_vec();
    let mut r = problem.residuals(&p)?;
    let mut chi2 = r.norm_squared();
    let mut lambda = cfg.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < cfg.max_iterations && !converged {
        iterations += 1;
        let jac = problem.jacobian(&p, &r, cfg.epsfcn)?;
        let d = column_scales(&jac)?;
        let js = scale_columns(&jac, &d);
        let a = js.transpose() * &js;
        let g = -(js.transpose() * &r);
        let dp_norm = d.component_mul(&DVector::from_column_slice(&p)).norm();

        loop {
            let mut damped = a.clone();
            for i in 0..m {
                damped[(i, i)] += lambda;
            }
            let step = damped.cholesky().map(|c| c.solve(&g));
            let Some(step_s) = step else {
                lambda *= cfg.lambda_up;
                if lambda > cfg.max_lambda {
                    return Err(AppError::convergence("Damping exceeded its limit."));
                }
                continue;
            };
            let small_step = step_s.norm() <= cfg.xtol * (dp_norm + cfg.xtol);
            let trial: Vec<f64> = p
                .iter()
                .zip(step_s.iter().zip(d.iter()))
                .map(|(pi, (si, di))| pi + si / di)
                .collect();

            let trial_r = problem.residuals(&trial).ok();
            let trial_chi2 = trial_r.as_ref().map(|v| v.norm_squared());
            match (trial_r, trial_chi2) {
                (Some(tr), Some(tc)) if tc < chi2 => {
                    let drop = (chi2 - tc) / chi2;
                    trace!(iterations, chi2 = tc, lambda, "lm step accepted");
                    p = trial;
                    r = tr;
                    chi2 = tc;
                    lambda = (lambda * cfg.lambda_down).max(f64::MIN_POSITIVE);
                    converged = drop <= cfg.ftol || small_step || chi2 == 0.0;
                    break;
                }
                _ => {
                    if small_step {
                        converged = true;
                        break;
                    }
                    lambda *= cfg.lambda_up;
                    if lambda > cfg.max_lambda {
                        return Err(AppError::convergence("Damping exceeded its limit."));
                    }
                }
            }
        }
    }

    if !converged {
        return Err(AppError::convergence(format!(
            "No convergence within {} iterations.",
            cfg.max_iterations
        )));
    }

    let covariance = covariance(&problem, &p, &r, chi2, cfg.epsfcn)?;
    Ok(LmFit {
        params: p,
        covariance,
        chi2,
        dof: n - m,
        iterations,
    })
}

fn scale_columns(jac: &DMatrix<f64>, d: &DVector<f64>) -> DMatrix<f64> {
    let mut out = jac.clone();
    for (j, mut col) in out.column_iter_mut().enumerate() {
        col /= d[j];
    }
    out
}

fn covariance<F>(
    problem: &Problem<'_, F>,
    p: &[f64],
    r: &DVector<f64>,
    chi2: f64,
    epsfcn: f64,
) -> Result<DMatrix<f64>, AppError>
where
    F: Fn(&[f64]) -> Result<Vec<f64>, AppError>,
{
    let jac = problem.jacobian(p, r, epsfcn)?;
    let d = column_scales(&jac)?;
    let js = scale_columns(&jac, &d);
    let inv = (js.transpose() * &js)
        .cholesky()
        .ok_or_else(|| AppError::convergence("Singular covariance matrix."))?
        .inverse();
    let dof = (r.len() - p.len()) as f64;
    let scale = chi2 / dof;
    Ok(DMatrix::from_fn(p.len(), p.len(), |i, j| {
        inv[(i, j)] / (d[i] * d[j]) * scale
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn xs(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * 0.1).collect()
    }

    #[test]
    fn straight_line_matches_closed_form() {
        let x = xs(40);
        let noise = |i: usize| if i % 2 == 0 { 0.05 } else { -0.03 };
        let y: Vec<f64> = x.iter().enumerate().map(|(i, v)| 1.0 + 2.0 * v + noise(i)).collect();
        let model = |p: &[f64]| Ok::<_, AppError>(x.iter().map(|v| p[0] + p[1] * v).collect::<Vec<_>>());

        let fit = curve_fit(model, &y, None, &[0.0, 0.0], &LmConfig::default()).unwrap();

        let design = DMatrix::from_fn(x.len(), 2, |i, j| if j == 0 { 1.0 } else { x[i] });
        let xtx = design.transpose() * &design;
        let beta = xtx.clone().cholesky().unwrap().solve(&(design.transpose() * DVector::from_vec(y.clone())));
        assert!((fit.params[0] - beta[0]).abs() < 1e-7);
        assert!((fit.params[1] - beta[1]).abs() < 1e-7);

        let inv = xtx.try_inverse().unwrap();
        let s2 = fit.chi2 / (x.len() - 2) as f64;
        for i in 0..2 {
            for j in 0..2 {
                let expected = inv[(i, j)] * s2;
                assert!((fit.covariance[(i, j)] - expected).abs() < 1e-6 * expected.abs().max(1e-12));
            }
        }
        assert_eq!(fit.dof, 38);
    }

    #[test]
    fn recovers_exponential_decay_from_far_start() {
        let x = xs(60);
        let y: Vec<f64> = x.iter().map(|v| 3.0 * (-0.7 * v).exp()).collect();
        let model = |p: &[f64]| Ok::<_, AppError>(x.iter().map(|v| p[0] * (-p[1] * v).exp()).collect::<Vec<_>>());

        let fit = curve_fit(model, &y, None, &[1.0, 0.1], &LmConfig::default()).unwrap();
        assert!((fit.params[0] - 3.0).abs() < 1e-6);
        assert!((fit.params[1] - 0.7).abs() < 1e-6);
        assert!(fit.chi2 < 1e-12);
    }

    #[test]
    fn sigma_weights_scale_chi2() {
        let x = xs(20);
        let y: Vec<f64> = x.iter().enumerate().map(|(i, v)| v + if i % 2 == 0 { 0.1 } else { -0.1 }).collect();
        let model = |p: &[f64]| Ok::<_, AppError>(x.iter().map(|v| p[0] + p[1] * v).collect::<Vec<_>>());
        let unit = curve_fit(model, &y, None, &[0.0, 1.0], &LmConfig::default()).unwrap();
        let sigma = vec![0.5; x.len()];
        let weighted = curve_fit(model, &y, Some(&sigma), &[0.0, 1.0], &LmConfig::default()).unwrap();
        assert!((weighted.chi2 - unit.chi2 * 4.0).abs() < 1e-9);
        // Relative-sigma covariance does not depend on a uniform sigma scale.
        assert!((weighted.covariance[(1, 1)] - unit.covariance[(1, 1)]).abs() < 1e-9);
    }

    #[test]
    fn unused_parameter_is_a_convergence_failure() {
        let x = xs(10);
        let y: Vec<f64> = x.clone();
        let model = |p: &[f64]| Ok::<_, AppError>(x.iter().map(|v| p[0] * v).collect::<Vec<_>>());
        let err = curve_fit(model, &y, None, &[0.5, 1.0], &LmConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Convergence);
    }

    #[test]
    fn iteration_cap_is_reported() {
        let x = xs(60);
        let y: Vec<f64> = x.iter().map(|v| 3.0 * (-0.7 * v).exp()).collect();
        let model = |p: &[f64]| Ok::<_, AppError>(x.iter().map(|v| p[0] * (-p[1] * v).exp()).collect::<Vec<_>>());
        let cfg = LmConfig {
            max_iterations: 1,
            ..LmConfig::default()
        };
        let err = curve_fit(model, &y, None, &[1.0, 0.1], &cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Convergence);
    }

    #[test]
    fn too_few_observations_is_an_input_error() {
        let model = |p: &[f64]| Ok::<_, AppError>(vec![p[0], p[1]]);
        let err = curve_fit(model, &[1.0, 2.0], None, &[0.0, 0.0], &LmConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn model_errors_at_the_start_propagate() {
        let model = |_: &[f64]| -> Result<Vec<f64>, AppError> { Err(AppError::domain("outside")) };
        let err = curve_fit(model, &[1.0, 2.0, 3.0], None, &[0.0], &LmConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Domain);
    }

    #[test]
    fn typical_magnitudes_free_near_zero_polynomial_terms() {
        let x: Vec<f64> = (-50..=50).map(|i| 4.0 * i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, v)| 6000.0 + 0.05 * v + if i % 3 == 0 { 1e-3 } else { -5e-4 })
            .collect();
        let model = |p: &[f64]| {
            Ok::<_, AppError>(x.iter().map(|v| p[0] + v * (p[1] + v * (p[2] + v * p[3]))).collect::<Vec<_>>())
        };
        let p0 = [6000.0, 0.05, 1.09e-16, -4.0e-21];

        // Relative steps on the cubic term do not change the model at all.
        let err = curve_fit(model, &y, None, &p0, &LmConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Convergence);

        let typical: Vec<f64> = (0..4).map(|k| 6000.0 / 200f64.powi(k)).collect();
        let fit = curve_fit_scaled(model, &y, None, &p0, &typical, &LmConfig::default()).unwrap();
        assert!((fit.params[1] - 0.05).abs() < 1e-5);
        assert!(fit.params[3].abs() < 1e-9);
        assert!(fit.errors().iter().all(|e| e.is_finite() && *e > 0.0));
    }

    #[test]
    fn jacobian_steps_backwards_at_a_domain_edge() {
        let x = xs(30);
        let y: Vec<f64> = x.iter().map(|v| 0.8 * v).collect();
        let model = |p: &[f64]| {
            if p[0] > 1.0 {
                return Err(AppError::domain("slope above 1"));
            }
            Ok(x.iter().map(|v| p[0] * v).collect::<Vec<_>>())
        };
        let fit = curve_fit(model, &y, None, &[1.0], &LmConfig::default()).unwrap();
        assert!((fit.params[0] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn typical_magnitudes_must_match_parameters() {
        let model = |p: &[f64]| Ok::<_, AppError>(vec![p[0]; 3]);
        let err = curve_fit_scaled(model, &[1.0, 1.0, 1.0], None, &[0.0], &[1.0, 1.0], &LmConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }
}
