//! Mixing weights of the latent error-pattern clusters.

use crate::error::ImputeError;
use crate::probability::draw_dirichlet;
use ndarray::Array1;
use rand::Rng;

/// Dirichlet-distributed cluster weights. Cluster labels themselves live with
/// the imputer; this type owns only the weight vector and its prior counts.
#[derive(Clone, Debug)]
pub struct MixingWeights {
    prior_counts: Array1<f64>,
    weights: Array1<f64>,
}

impl MixingWeights {
    pub fn new(nclusters: usize) -> Self {
        Self {
            prior_counts: Array1::from_elem(nclusters, 1.0),
            weights: Array1::from_elem(nclusters, 1.0 / nclusters as f64),
        }
    }

    pub fn nclusters(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn log_weights(&self) -> Array1<f64> {
        self.weights.mapv(|w| w.max(f64::MIN_POSITIVE).ln())
    }

    /// Symmetric Dirichlet prior with `count` pseudo-observations per cluster.
    pub fn set_uniform_prior(&mut self, count: f64) -> Result<(), ImputeError> {
        if !(count.is_finite() && count > 0.0) {
            return Err(ImputeError::InvalidArgument(format!(
                "mixing weight prior count must be positive, got {count}"
            )));
        }
        self.prior_counts.fill(count);
        Ok(())
    }

    pub fn set_prior(&mut self, counts: &[f64]) -> Result<(), ImputeError> {
        if counts.len() != self.nclusters() {
            return Err(ImputeError::DimensionMismatch {
                what: "mixing weight prior counts",
                expected: self.nclusters(),
                found: counts.len(),
            });
        }
        if counts.iter().any(|&c| !c.is_finite() || c <= 0.0) {
            return Err(ImputeError::InvalidArgument(
                "mixing weight prior counts must be positive".to_string(),
            ));
        }
        self.prior_counts = Array1::from_vec(counts.to_vec());
        Ok(())
    }

    /// Draw new weights from Dirichlet(prior + per-cluster occupancy).
    pub fn draw_posterior<R: Rng>(
        &mut self,
        occupancy: &Array1<f64>,
        rng: &mut R,
    ) -> Result<(), ImputeError> {
        if occupancy.len() != self.nclusters() {
            return Err(ImputeError::DimensionMismatch {
                what: "cluster occupancy counts",
                expected: self.nclusters(),
                found: occupancy.len(),
            });
        }
        let alpha: Vec<f64> = self
            .prior_counts
            .iter()
            .zip(occupancy.iter())
            .map(|(&prior, &count)| prior + count)
            .collect();
        self.weights = Array1::from_vec(draw_dirichlet(rng, &alpha)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn posterior_draw_tracks_occupancy() {
        let mut weights = MixingWeights::new(2);
        let mut rng = StdRng::seed_from_u64(5);
        let occupancy = array![90.0, 10.0];
        let mut mean_first = 0.0;
        for _ in 0..50 {
            weights.draw_posterior(&occupancy, &mut rng).unwrap();
            assert!((weights.weights().sum() - 1.0).abs() < 1e-9);
            mean_first += weights.weights()[0];
        }
        assert!(mean_first / 50.0 > 0.75);
    }

    #[test]
    fn prior_setters_reject_bad_input() {
        let mut weights = MixingWeights::new(3);
        assert!(weights.set_uniform_prior(0.0).is_err());
        assert!(weights.set_prior(&[1.0, 1.0]).is_err());
        assert!(weights.set_prior(&[1.0, -1.0, 1.0]).is_err());
    }
}
