//! Instrumental-profile (IP) kernels.
//!
//! Every variant maps a symmetric velocity grid `vk` (km/s) and shape
//! parameters to an array of the same length normalised to unit sum.
//! Trailing parameters that are not supplied take their default values.
//!
//! Negative kernel values are permitted except for the multi-central variant,
//! which clips them to zero. A zero or non-finite sum is reported as a
//! numerical error instead of being propagated as NaN.

use std::f64::consts::{FRAC_2_PI, SQRT_2};

use statrs::function::erf::erf;

use crate::domain::{IpKind, ModelSettings};
use crate::error::AppError;

/// Fixed width ratio of the background Gaussian in the multi-central IP.
const MCG_WIDTH_RATIO: f64 = 4.0;
/// The multi-central amplitude is given in units of 1/10.
const MCG_AMPLITUDE_SCALE: f64 = 10.0;

/// An IP shape plus the fixed settings it needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IpProfile {
    pub kind: IpKind,
    /// Default width `s` (km/s) for the Gaussian-like variants.
    pub width: f64,
    /// Width and knot spacing (km/s) of the spline Gaussians.
    pub spline_width: f64,
    /// Knot count of the spline, including the fixed central knot.
    pub spline_knots: usize,
}

impl IpProfile {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            kind: settings.ip_kind,
            width: settings.ip_width,
            spline_width: settings.spline_width,
            spline_knots: settings.spline_knots.max(1),
        }
    }

    /// Neutral starting parameters for this shape.
    pub fn default_params(&self) -> Vec<f64> {
        let s = self.width;
        match self.kind {
            IpKind::Gaussian => vec![s],
            IpKind::SuperGaussian => vec![s, 2.0],
            IpKind::Asymmetric => vec![s, 0.0],
            IpKind::BiGaussian => vec![s, s],
            IpKind::MultiCentral => vec![s, 0.1],
            IpKind::Spline => vec![0.0; self.spline_knots - 1],
        }
    }

    /// Evaluate the normalised kernel on `vk`.
    pub fn evaluate(&self, vk: &[f64], params: &[f64]) -> Result<Vec<f64>, AppError> {
        let defaults = self.default_params();
        if self.kind != IpKind::Spline && params.len() > defaults.len() {
            return Err(AppError::input(format!(
                "{} IP takes at most {} parameters, got {}.",
                self.kind.display_name(),
                defaults.len(),
                params.len()
            )));
        }
        let p = |i: usize| params.get(i).copied().unwrap_or(defaults[i]);

        let kernel = match self.kind {
            IpKind::Gaussian => gaussian(vk, p(0)),
            IpKind::SuperGaussian => super_gaussian(vk, p(0), p(1)),
            IpKind::Asymmetric => asymmetric(vk, p(0), p(1)),
            IpKind::BiGaussian => bi_gaussian(vk, p(0), p(1)),
            IpKind::MultiCentral => multi_central(vk, p(0), p(1)),
            IpKind::Spline => spline(vk, self.spline_width, params),
        };
        normalize(kernel, self.kind)
    }
}

fn gaussian(vk: &[f64], s: f64) -> Vec<f64> {
    vk.iter().map(|v| (-0.5 * (v / s).powi(2)).exp()).collect()
}

fn super_gaussian(vk: &[f64], s: f64, e: f64) -> Vec<f64> {
    vk.iter().map(|v| (-(v / s).abs().powf(e)).exp()).collect()
}

/// Skewed Gaussian, variance-matched to the symmetric case and recentred to zero mean.
fn asymmetric(vk: &[f64], s: f64, a: f64) -> Vec<f64> {
    let b = a / (1.0 + a * a).sqrt() * FRAC_2_PI.sqrt();
    let ss = s / (1.0 - b * b).sqrt();
    vk.iter()
        .map(|v| {
            let u = (v + ss * b) / ss;
            (-0.5 * u * u).exp() * (1.0 + erf(a / SQRT_2 * u))
        })
        .collect()
}

/// Two half-Gaussians; the centre shift makes the area-weighted mean zero.
fn bi_gaussian(vk: &[f64], s1: f64, s2: f64) -> Vec<f64> {
    let xc = FRAC_2_PI.sqrt() * (s2 * s2 - s1 * s1) / (s1 + s2);
    vk.iter()
        .map(|v| {
            let w = v + xc;
            let s = if w < 0.0 { s1 } else { s2 };
            (-0.5 * (w / s).powi(2)).exp()
        })
        .collect()
}

fn multi_central(vk: &[f64], s0: f64, a1: f64) -> Vec<f64> {
    let s1 = MCG_WIDTH_RATIO * s0;
    let a1 = a1 / MCG_AMPLITUDE_SCALE;
    vk.iter()
        .map(|v| ((-(v / s0).powi(2)).exp() + a1 * (-(v / s1).powi(2)).exp()).max(0.0))
        .collect()
}

/// Gaussian spline: `tanh`-squashed amplitudes, unit amplitude at the central
/// knot, knots shifted so the amplitude-weighted mean position is zero.
fn spline(vk: &[f64], s: f64, amplitudes: &[f64]) -> Vec<f64> {
    let mid = amplitudes.len() / 2;
    let mut a: Vec<f64> = Vec::with_capacity(amplitudes.len() + 1);
    a.extend(amplitudes[..mid].iter().map(|x| x.tanh()));
    a.push(1.0);
    a.extend(amplitudes[mid..].iter().map(|x| x.tanh()));

    let total: f64 = a.iter().sum();
    let xm = a.iter().enumerate().map(|(l, al)| l as f64 * al).sum::<f64>() / total;
    let dx = s;

    vk.iter()
        .map(|v| {
            a.iter()
                .enumerate()
                .map(|(l, al)| {
                    let xc = dx * (l as f64 - xm);
                    al * (-((v - xc) / s).powi(2)).exp()
                })
                .sum()
        })
        .collect()
}

fn normalize(mut kernel: Vec<f64>, kind: IpKind) -> Result<Vec<f64>, AppError> {
    let sum: f64 = kernel.iter().sum();
    if !sum.is_finite() || sum == 0.0 || kernel.iter().any(|k| !k.is_finite()) {
        return Err(AppError::numerical(format!(
            "Degenerate {} IP: kernel sum is {sum}.",
            kind.display_name()
        )));
    }
    for k in &mut kernel {
        *k /= sum;
    }
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn profile(kind: IpKind) -> IpProfile {
        IpProfile {
            kind,
            width: 2.2,
            spline_width: 0.9,
            spline_knots: 9,
        }
    }

    fn vk(h: i32, step: f64) -> Vec<f64> {
        (-h..=h).map(|k| k as f64 * step).collect()
    }

    fn mean_offset(kernel: &[f64], vk: &[f64]) -> f64 {
        kernel.iter().zip(vk).map(|(k, v)| k * v).sum()
    }

    #[test]
    fn asymmetric_with_zero_skew_is_gaussian() {
        let v = vk(50, 0.2);
        let g = profile(IpKind::Gaussian).evaluate(&v, &[2.7]).unwrap();
        let a = profile(IpKind::Asymmetric).evaluate(&v, &[2.7, 0.0]).unwrap();
        for (x, y) in g.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-14);
        }
    }

    #[test]
    fn skewed_and_bi_gaussian_are_recentred() {
        let v = vk(200, 0.1);
        let a = profile(IpKind::Asymmetric).evaluate(&v, &[2.0, 3.0]).unwrap();
        assert!(mean_offset(&a, &v).abs() < 1e-3);
        let b = profile(IpKind::BiGaussian).evaluate(&v, &[1.5, 3.0]).unwrap();
        assert!(mean_offset(&b, &v).abs() < 1e-3);
    }

    #[test]
    fn spline_with_zero_amplitudes_is_central_gaussian() {
        let v = vk(50, 0.2);
        let k = profile(IpKind::Spline).evaluate(&v, &[0.0; 8]).unwrap();
        // A single unit Gaussian at the central knot, width 0.9 in exp(-(v/s)^2) form.
        let s = 0.9 / SQRT_2;
        let g = profile(IpKind::Gaussian).evaluate(&v, &[s]).unwrap();
        for (x, y) in k.iter().zip(g.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn spline_is_recentred() {
        let v = vk(100, 0.1);
        let k = profile(IpKind::Spline)
            .evaluate(&v, &[0.3, 0.8, 0.1, 0.0, 0.0, 0.2, 0.0, 0.0])
            .unwrap();
        assert!(mean_offset(&k, &v).abs() < 1e-6);
    }

    #[test]
    fn multi_central_clips_negative_values() {
        let v = vk(50, 0.5);
        let k = profile(IpKind::MultiCentral).evaluate(&v, &[2.0, -5.0]).unwrap();
        assert!(k.iter().all(|x| *x >= 0.0));
    }

    #[test]
    fn missing_parameters_take_defaults() {
        let v = vk(20, 0.5);
        let a = profile(IpKind::SuperGaussian).evaluate(&v, &[2.2]).unwrap();
        let b = profile(IpKind::SuperGaussian).evaluate(&v, &[2.2, 2.0]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_sum_is_a_numerical_error() {
        let v = vk(20, 0.5);
        let err = profile(IpKind::MultiCentral).evaluate(&v, &[2.0, -1e6]);
        // The main Gaussian is swamped by a huge negative background: all values clip to zero.
        assert!(err.unwrap_err().is_fit_failure());
        let err = profile(IpKind::Gaussian).evaluate(&v, &[f64::NAN]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Numerical);
    }

    proptest! {
        #[test]
        fn every_kernel_has_unit_sum(
            s in 0.8f64..6.0,
            e in 1.0f64..4.0,
            a in -5.0f64..5.0,
            s2 in 0.8f64..6.0,
            amps in proptest::collection::vec(0.0f64..2.0, 8),
        ) {
            let v = vk(50, 0.3);
            let cases: Vec<(IpKind, Vec<f64>)> = vec![
                (IpKind::Gaussian, vec![s]),
                (IpKind::SuperGaussian, vec![s, e]),
                (IpKind::Asymmetric, vec![s, a]),
                (IpKind::BiGaussian, vec![s, s2]),
                (IpKind::MultiCentral, vec![s, a.abs()]),
                (IpKind::Spline, amps.clone()),
            ];
            for (kind, params) in cases {
                let k = profile(kind).evaluate(&v, &params);
                prop_assert!(k.is_ok(), "{:?} failed", kind);
                let k = k.unwrap();
                prop_assert_eq!(k.len(), v.len());
                let sum: f64 = k.iter().sum();
                prop_assert!((sum - 1.0).abs() < 1e-12, "{:?} sum {}", kind, sum);
            }
        }
    }
}
