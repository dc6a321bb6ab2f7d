//! Rank-based marginal distribution of one response variable.
//!
//! Built once, in batch, from every observed continuous (non-atom,
//! non-missing) cell of a variable. The canonical state is a compressed
//! probability grid with matching quantile values; raw data is discarded
//! after compression, so a restored distribution reproduces quantile and CDF
//! outputs exactly without ever replaying training data.

use crate::error::ImputeError;
use crate::probability::{normal_cdf, normal_quantile};
use serde::{Deserialize, Serialize};

const GRID_SIZE: usize = 201;

/// Losslessly round-trippable persisted form of an [`EmpiricalDistribution`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmpiricalDistributionState {
    pub nobs: u64,
    pub probs: Vec<f64>,
    pub quantiles: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct EmpiricalDistribution {
    state: EmpiricalDistributionState,
}

impl EmpiricalDistribution {
    /// Compress a batch of observed values into the quantile grid.
    pub fn from_values(values: &[f64]) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        if n == 0 {
            return Self {
                state: EmpiricalDistributionState {
                    nobs: 0,
                    probs: Vec::new(),
                    quantiles: Vec::new(),
                },
            };
        }
        let grid = GRID_SIZE.min(n.max(2));
        let mut probs = Vec::with_capacity(grid);
        let mut quantiles = Vec::with_capacity(grid);
        for g in 0..grid {
            let p = g as f64 / (grid - 1) as f64;
            probs.push(p);
            quantiles.push(sample_quantile(&sorted, p));
        }
        Self {
            state: EmpiricalDistributionState {
                nobs: n as u64,
                probs,
                quantiles,
            },
        }
    }

    /// Rebuild from persisted state, validating the grid invariants.
    pub fn from_state(state: EmpiricalDistributionState) -> Result<Self, ImputeError> {
        if state.probs.len() != state.quantiles.len() {
            return Err(ImputeError::DimensionMismatch {
                what: "empirical distribution grid",
                expected: state.probs.len(),
                found: state.quantiles.len(),
            });
        }
        let mut previous_p = -f64::INFINITY;
        let mut previous_q = -f64::INFINITY;
        for (&p, &q) in state.probs.iter().zip(state.quantiles.iter()) {
            if !(0.0..=1.0).contains(&p) || p < previous_p {
                return Err(ImputeError::InvalidArgument(format!(
                    "empirical probability grid must be non-decreasing in [0,1], got {p}"
                )));
            }
            if !q.is_finite() || q < previous_q {
                return Err(ImputeError::InvalidArgument(format!(
                    "empirical quantile grid must be finite and non-decreasing, got {q}"
                )));
            }
            previous_p = p;
            previous_q = q;
        }
        Ok(Self { state })
    }

    pub fn state(&self) -> &EmpiricalDistributionState {
        &self.state
    }

    pub fn nobs(&self) -> u64 {
        self.state.nobs
    }

    /// A distribution with no support or zero spread cannot carry a copula
    /// transform in either direction.
    pub fn is_degenerate(&self) -> bool {
        match (self.state.quantiles.first(), self.state.quantiles.last()) {
            (Some(lo), Some(hi)) => !(hi - lo).is_finite() || hi - lo <= 0.0,
            _ => true,
        }
    }

    /// Interpolated quantile at probability `p`.
    pub fn quantile(&self, p: f64) -> Result<f64, ImputeError> {
        if !(0.0..=1.0).contains(&p) {
            return Err(ImputeError::InvalidArgument(format!(
                "quantile probability must lie in [0,1], got {p}"
            )));
        }
        let probs = &self.state.probs;
        let quantiles = &self.state.quantiles;
        if probs.is_empty() {
            return Err(ImputeError::NumericalFailure(
                "quantile query on an empty empirical distribution".to_string(),
            ));
        }
        let upper = probs.partition_point(|&grid_p| grid_p < p);
        if upper == 0 {
            return Ok(quantiles[0]);
        }
        if upper == probs.len() {
            return Ok(quantiles[probs.len() - 1]);
        }
        let (p0, p1) = (probs[upper - 1], probs[upper]);
        let (q0, q1) = (quantiles[upper - 1], quantiles[upper]);
        if p1 <= p0 {
            return Ok(q1);
        }
        Ok(q0 + (q1 - q0) * (p - p0) / (p1 - p0))
    }

    /// Interpolated CDF at value `v`, clamped to the grid support.
    pub fn cdf(&self, v: f64) -> Result<f64, ImputeError> {
        let probs = &self.state.probs;
        let quantiles = &self.state.quantiles;
        if quantiles.is_empty() {
            return Err(ImputeError::NumericalFailure(
                "CDF query on an empty empirical distribution".to_string(),
            ));
        }
        if v <= quantiles[0] {
            return Ok(probs[0]);
        }
        let last = quantiles.len() - 1;
        if v >= quantiles[last] {
            return Ok(probs[last]);
        }
        let upper = quantiles.partition_point(|&q| q < v);
        let (q0, q1) = (quantiles[upper - 1], quantiles[upper]);
        let (p0, p1) = (probs[upper - 1], probs[upper]);
        if q1 <= q0 {
            return Ok(p1);
        }
        Ok(p0 + (p1 - p0) * (v - q0) / (q1 - q0))
    }

    /// Copula transform: Φ⁻¹(F(v)), with F clamped away from {0, 1}.
    pub fn copula_z(&self, v: f64) -> Result<f64, ImputeError> {
        self.require_spread()?;
        let eps = (0.5 / (self.state.nobs as f64 + 1.0)).max(1e-12);
        let p = self.cdf(v)?.clamp(eps, 1.0 - eps);
        normal_quantile(p)
    }

    /// Inverse copula transform: F⁻¹(Φ(z)).
    pub fn value_from_z(&self, z: f64) -> Result<f64, ImputeError> {
        self.require_spread()?;
        self.quantile(normal_cdf(z).clamp(0.0, 1.0))
    }

    fn require_spread(&self) -> Result<(), ImputeError> {
        if self.is_degenerate() {
            return Err(ImputeError::NumericalFailure(format!(
                "degenerate empirical distribution ({} observations, zero spread)",
                self.state.nobs
            )));
        }
        Ok(())
    }
}

fn sample_quantile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let position = p * (n - 1) as f64;
    let low = position.floor() as usize;
    let high = position.ceil() as usize;
    if low == high {
        return sorted[low];
    }
    let weight = position - low as f64;
    sorted[low] * (1.0 - weight) + sorted[high] * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> EmpiricalDistribution {
        EmpiricalDistribution::from_values(&[3.0, 1.0, 4.0, 1.5, 9.2, 2.6, 5.3, 5.8, 9.7, 0.4])
    }

    #[test]
    fn cdf_is_monotone_and_bounded() {
        let dist = example();
        let mut previous = -1.0;
        let mut v = -1.0;
        while v <= 11.0 {
            let p = dist.cdf(v).unwrap();
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= previous);
            previous = p;
            v += 0.37;
        }
    }

    #[test]
    fn quantile_inverts_cdf_inside_support() {
        let dist = example();
        for &v in &[1.1, 2.0, 4.5, 8.0] {
            let p = dist.cdf(v).unwrap();
            assert!((dist.quantile(p).unwrap() - v).abs() < 1e-9);
        }
    }

    #[test]
    fn state_round_trip_is_exact() {
        let dist = example();
        let restored = EmpiricalDistribution::from_state(dist.state().clone()).unwrap();
        for g in 0..=100 {
            let p = g as f64 / 100.0;
            assert_eq!(
                dist.quantile(p).unwrap().to_bits(),
                restored.quantile(p).unwrap().to_bits()
            );
        }
    }

    #[test]
    fn degenerate_distribution_refuses_transform() {
        let dist = EmpiricalDistribution::from_values(&[2.0, 2.0, 2.0]);
        assert!(dist.is_degenerate());
        assert!(matches!(
            dist.copula_z(2.0),
            Err(ImputeError::NumericalFailure(_))
        ));
    }

    #[test]
    fn copula_transform_round_trips_to_rank_scale() {
        let dist = example();
        let z = dist.copula_z(4.5).unwrap();
        let v = dist.value_from_z(z).unwrap();
        assert!((v - 4.5).abs() < 0.2);
    }

    #[test]
    fn restore_rejects_non_monotone_grid() {
        let state = EmpiricalDistributionState {
            nobs: 3,
            probs: vec![0.0, 0.5, 1.0],
            quantiles: vec![1.0, 0.5, 2.0],
        };
        assert!(EmpiricalDistribution::from_state(state).is_err());
    }
}
