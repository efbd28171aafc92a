//! Parameter groups and the flat vector seen by the solver.
//!
//! Each semantic group (RV, continuum, wavelength, IP, absorber, background)
//! holds a free part and a fixed part; the values passed to the evaluator are
//! `free ++ fixed`. Flattening walks the groups in [`GroupKind::ALL`] order, so
//! a covariance index always maps back to one `(group, position)` pair.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::ModelParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Rv,
    Norm,
    Wave,
    Ip,
    Atm,
    Bkg,
}

impl GroupKind {
    /// Solver order of the groups.
    pub const ALL: [GroupKind; 6] = [
        GroupKind::Rv,
        GroupKind::Norm,
        GroupKind::Wave,
        GroupKind::Ip,
        GroupKind::Atm,
        GroupKind::Bkg,
    ];

    pub fn label(self) -> &'static str {
        match self {
            GroupKind::Rv => "rv",
            GroupKind::Norm => "norm",
            GroupKind::Wave => "wave",
            GroupKind::Ip => "ip",
            GroupKind::Atm => "atm",
            GroupKind::Bkg => "bkg",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub free: Vec<f64>,
    pub fixed: Vec<f64>,
}

impl ParamGroup {
    pub fn free(values: Vec<f64>) -> Self {
        Self {
            free: values,
            fixed: Vec::new(),
        }
    }

    pub fn fixed(values: Vec<f64>) -> Self {
        Self {
            free: Vec::new(),
            fixed: values,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Values as seen by the evaluator: free part first, then the fixed part.
    pub fn values(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(self.len());
        v.extend_from_slice(&self.free);
        v.extend_from_slice(&self.fixed);
        v
    }

    pub fn len(&self) -> usize {
        self.free.len() + self.fixed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same values, all free.
    pub fn thawed(&self) -> Self {
        Self::free(self.values())
    }

    /// Same values, all fixed.
    pub fn frozen(&self) -> Self {
        Self::fixed(self.values())
    }
}

/// A full parameter set, one record per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    pub rv: ParamGroup,
    pub norm: ParamGroup,
    pub wave: ParamGroup,
    pub ip: ParamGroup,
    pub atm: ParamGroup,
    pub bkg: ParamGroup,
}

impl ParamSet {
    /// Every value fixed at `p`.
    pub fn fixed_at(p: &ModelParams) -> Self {
        Self {
            rv: ParamGroup::fixed(vec![p.rv]),
            norm: ParamGroup::fixed(p.norm.clone()),
            wave: ParamGroup::fixed(p.wave.clone()),
            ip: ParamGroup::fixed(p.ip.clone()),
            atm: ParamGroup::fixed(p.atm.clone()),
            bkg: ParamGroup::fixed(p.bkg.clone()),
        }
    }

    pub fn group(&self, kind: GroupKind) -> &ParamGroup {
        match kind {
            GroupKind::Rv => &self.rv,
            GroupKind::Norm => &self.norm,
            GroupKind::Wave => &self.wave,
            GroupKind::Ip => &self.ip,
            GroupKind::Atm => &self.atm,
            GroupKind::Bkg => &self.bkg,
        }
    }

    pub fn group_mut(&mut self, kind: GroupKind) -> &mut ParamGroup {
        match kind {
            GroupKind::Rv => &mut self.rv,
            GroupKind::Norm => &mut self.norm,
            GroupKind::Wave => &mut self.wave,
            GroupKind::Ip => &mut self.ip,
            GroupKind::Atm => &mut self.atm,
            GroupKind::Bkg => &mut self.bkg,
        }
    }

    pub fn free_len(&self) -> usize {
        GroupKind::ALL.iter().map(|&g| self.group(g).free.len()).sum()
    }

    /// Index range of a group inside the flat free vector.
    pub fn group_range(&self, kind: GroupKind) -> Range<usize> {
        let mut start = 0;
        for g in GroupKind::ALL {
            let len = self.group(g).free.len();
            if g == kind {
                return start..start + len;
            }
            start += len;
        }
        start..start
    }

    /// Flat free vector in group order.
    pub fn free_vector(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.free_len());
        for g in GroupKind::ALL {
            out.extend_from_slice(&self.group(g).free);
        }
        out
    }

    /// Typical magnitude of each free value, in flat order, for difference steps.
    ///
    /// Term `k` of the continuum and wavelength polynomials scales as
    /// `|a0| / half_span^k`, so every term moves the model by about as much at
    /// the chunk edge as the constant does. Denominator term `k` multiplies
    /// `x^(k+1)`.
    pub fn free_typical(&self, half_span: f64, denominator: usize) -> Vec<f64> {
        let span = half_span.abs().max(1.0);
        let poly_scales = |values: &[f64], den: usize| -> Vec<f64> {
            let level = values.first().map(|v| v.abs()).filter(|v| *v > 0.0).unwrap_or(1.0);
            let num = values.len().saturating_sub(den);
            (0..values.len())
                .map(|i| {
                    if i < num {
                        level / span.powi(i as i32)
                    } else {
                        1.0 / span.powi((i - num + 1) as i32)
                    }
                })
                .collect()
        };
        let mut out = Vec::with_capacity(self.free_len());
        for g in GroupKind::ALL {
            let group = self.group(g);
            let n = group.free.len();
            match g {
                GroupKind::Norm => out.extend_from_slice(&poly_scales(&group.values(), denominator)[..n]),
                GroupKind::Wave => out.extend_from_slice(&poly_scales(&group.values(), 0)[..n]),
                _ => out.extend(std::iter::repeat_n(1.0, n)),
            }
        }
        out
    }

    /// `(group, position within the free part)` for each flat index.
    pub fn free_labels(&self) -> Vec<(GroupKind, usize)> {
        GroupKind::ALL
            .iter()
            .flat_map(|&g| (0..self.group(g).free.len()).map(move |i| (g, i)))
            .collect()
    }

    /// Copy of `self` with the free parts replaced from a flat vector.
    pub fn with_free(&self, free: &[f64]) -> Result<ParamSet, AppError> {
        if free.len() != self.free_len() {
            return Err(AppError::input(format!(
                "Flat parameter vector has {} values, layout expects {}.",
                free.len(),
                self.free_len()
            )));
        }
        let mut out = self.clone();
        for g in GroupKind::ALL {
            let range = self.group_range(g);
            out.group_mut(g).free.copy_from_slice(&free[range]);
        }
        Ok(out)
    }

    /// Reassemble evaluator arguments (`free ++ fixed` per group).
    pub fn model_params(&self) -> Result<ModelParams, AppError> {
        let rv = self.rv.values();
        if rv.len() != 1 {
            return Err(AppError::input(format!(
                "RV group must hold exactly one value (free or fixed), got {}.",
                rv.len()
            )));
        }
        Ok(ModelParams {
            rv: rv[0],
            norm: self.norm.values(),
            wave: self.wave.values(),
            ip: self.ip.values(),
            atm: self.atm.values(),
            bkg: self.bkg.values(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamSet {
        ParamSet {
            rv: ParamGroup::free(vec![1.5]),
            norm: ParamGroup {
                free: vec![1.0],
                fixed: vec![0.0, 0.0],
            },
            wave: ParamGroup::free(vec![6000.0, 0.05]),
            ip: ParamGroup::fixed(vec![2.2]),
            atm: ParamGroup::free(vec![0.8, 1.1]),
            bkg: ParamGroup::fixed(vec![0.0]),
        }
    }

    #[test]
    fn flatten_and_unflatten_preserve_group_order() {
        let set = sample();
        assert_eq!(set.free_vector(), vec![1.5, 1.0, 6000.0, 0.05, 0.8, 1.1]);
        assert_eq!(set.group_range(GroupKind::Rv), 0..1);
        assert_eq!(set.group_range(GroupKind::Wave), 2..4);
        assert_eq!(set.group_range(GroupKind::Ip), 4..4);
        assert_eq!(set.group_range(GroupKind::Atm), 4..6);

        let moved = set.with_free(&[2.0, 0.9, 6001.0, 0.06, 0.7, 1.2]).unwrap();
        let p = moved.model_params().unwrap();
        assert_eq!(p.rv, 2.0);
        assert_eq!(p.norm, vec![0.9, 0.0, 0.0]);
        assert_eq!(p.wave, vec![6001.0, 0.06]);
        assert_eq!(p.ip, vec![2.2]);
        assert_eq!(p.atm, vec![0.7, 1.2]);
    }

    #[test]
    fn wrong_flat_length_is_rejected() {
        assert!(sample().with_free(&[1.0]).is_err());
    }

    #[test]
    fn rv_group_needs_exactly_one_value() {
        let mut set = sample();
        set.rv = ParamGroup::empty();
        assert!(set.model_params().is_err());
    }

    #[test]
    fn labels_follow_flat_order() {
        let labels = sample().free_labels();
        assert_eq!(labels[0], (GroupKind::Rv, 0));
        assert_eq!(labels[3], (GroupKind::Wave, 1));
        assert_eq!(labels[5], (GroupKind::Atm, 1));
    }

    #[test]
    fn typical_magnitudes_follow_polynomial_order() {
        let mut set = sample();
        set.wave = ParamGroup::free(vec![6000.0, 0.05, 1e-16, -4e-21]);
        set.norm = ParamGroup::free(vec![2.0, 0.0, 0.0]);
        let typical = set.free_typical(100.0, 1);
        // rv, norm (2 numerator + 1 denominator), wave (4), atm (2)
        assert_eq!(typical.len(), 10);
        assert_eq!(typical[0], 1.0);
        assert_eq!(&typical[1..4], &[2.0, 0.02, 0.01]);
        assert_eq!(typical[4], 6000.0);
        assert!((typical[7] - 6000.0 / 1e6).abs() < 1e-15);
        assert_eq!(&typical[8..], &[1.0, 1.0]);
    }
}
