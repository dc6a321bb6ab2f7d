//! The copula data imputer and its Gibbs driver.
//!
//! # Sweep anatomy
//!
//! One call to [`MvRegCopulaImputer::sample_posterior`] advances the posterior
//! by exactly one sweep, in two strictly ordered phases:
//!
//! 1. **Accumulate** (parallel over worker shards, deterministic): classify
//!    every cell against the atom catalog, copula-transform observed
//!    continuous cells, and reduce shard-local sufficient statistics plus
//!    per-observation cluster log scores.
//! 2. **Draw** (serial, single RNG stream): update the atom tables, the
//!    mixing weights, Beta, Sigma, the cluster labels, and the training-set
//!    imputations, in that order, each draw conditioning on the ones before
//!    it.
//!
//! Draws land in a staged copy of the posterior state and are committed only
//! when the whole sweep succeeds, so a numerical failure leaves the pre-sweep
//! posterior intact.

use crate::atoms::{AtomCatalog, CellCategory, ErrorCorrectionModel};
use crate::dataset::{DataSet, Observation, validate_row};
use crate::empirical::{EmpiricalDistribution, EmpiricalDistributionState};
use crate::error::ImputeError;
use crate::mixture::MixingWeights;
use crate::probability::{draw_categorical, draw_categorical_from_log};
use crate::regression::{CopulaRegression, RegressionPrior};
use crate::suffstats::{
    ShardResult, SuffStats, SweepContext, accumulate_range, classify_row, cluster_log_scores,
};
use crate::workers::WorkerPool;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

pub struct MvRegCopulaImputer {
    catalog: AtomCatalog,
    data: DataSet,
    assignments: Vec<usize>,
    mixing: MixingWeights,
    /// Error-correction models indexed `[cluster][variable]`.
    ecm: Vec<Vec<ErrorCorrectionModel>>,
    regression: CopulaRegression,
    empirical: Option<Vec<EmpiricalDistribution>>,
    imputed: Option<Array2<f64>>,
    pool: WorkerPool,
    rng: StdRng,
}

impl MvRegCopulaImputer {
    /// Build an imputer with `num_clusters` latent error-pattern clusters,
    /// one atom list per response variable (entries may be empty), `xdim`
    /// predictors, and a deterministic RNG seed. All priors start at their
    /// nearly-flat defaults, so imputation is well-defined before training.
    pub fn new(
        num_clusters: usize,
        atoms: Vec<Vec<f64>>,
        xdim: usize,
        seed: u64,
    ) -> Result<Self, ImputeError> {
        if num_clusters == 0 {
            return Err(ImputeError::InvalidArgument(
                "at least one cluster is required".to_string(),
            ));
        }
        if xdim == 0 {
            return Err(ImputeError::InvalidArgument(
                "at least one predictor is required (include an intercept column)".to_string(),
            ));
        }
        if atoms.is_empty() {
            return Err(ImputeError::InvalidArgument(
                "at least one response variable is required".to_string(),
            ));
        }
        let catalog = AtomCatalog::new(atoms)?;
        let ydim = catalog.nvars();
        let ecm = (0..num_clusters)
            .map(|_| {
                (0..ydim)
                    .map(|j| ErrorCorrectionModel::new(catalog.ncats(j)))
                    .collect()
            })
            .collect();
        Ok(Self {
            data: DataSet::new(xdim, ydim),
            assignments: Vec::new(),
            mixing: MixingWeights::new(num_clusters),
            ecm,
            regression: CopulaRegression::new(xdim, ydim),
            empirical: None,
            imputed: None,
            pool: WorkerPool::serial(),
            rng: StdRng::seed_from_u64(seed),
            catalog,
        })
    }

    pub fn nclusters(&self) -> usize {
        self.mixing.nclusters()
    }

    pub fn xdim(&self) -> usize {
        self.data.xdim()
    }

    pub fn ydim(&self) -> usize {
        self.data.ydim()
    }

    pub fn nobs(&self) -> usize {
        self.data.len()
    }

    pub fn atoms(&self) -> &[Vec<f64>] {
        self.catalog.atoms()
    }

    /// Register one training observation. NaN response cells are missing.
    pub fn add_data(&mut self, x: Array1<f64>, y: Array1<f64>) -> Result<(), ImputeError> {
        self.data.push(Observation::new(x, y))?;
        // Labels are re-drawn every sweep; round-robin seeding just spreads
        // the first accumulation across clusters.
        self.assignments
            .push((self.data.len() - 1) % self.nclusters());
        Ok(())
    }

    // ----- prior configuration ------------------------------------------

    /// Nearly-flat defaults on every model block at once.
    pub fn set_default_priors(&mut self) -> Result<(), ImputeError> {
        self.set_default_regression_prior(1.0)?;
        self.set_default_prior_for_mixing_weights(1.0)?;
        for models in &mut self.ecm {
            for (j, model) in models.iter_mut().enumerate() {
                let ncats = self.catalog.ncats(j);
                model.set_truth_prior(&ErrorCorrectionModel::default_truth_prior(ncats))?;
                model.set_obs_prior(&ErrorCorrectionModel::default_obs_prior(ncats))?;
            }
        }
        Ok(())
    }

    pub fn set_default_regression_prior(&mut self, sample_size: f64) -> Result<(), ImputeError> {
        self.regression.set_default_prior(sample_size)
    }

    pub fn set_regression_prior(&mut self, prior: RegressionPrior) -> Result<(), ImputeError> {
        self.regression.set_prior(prior)
    }

    pub fn set_default_prior_for_mixing_weights(&mut self, count: f64) -> Result<(), ImputeError> {
        self.mixing.set_uniform_prior(count)
    }

    pub fn set_mixing_weight_prior(&mut self, counts: &[f64]) -> Result<(), ImputeError> {
        self.mixing.set_prior(counts)
    }

    /// Dirichlet prior counts over a variable's truth categories, applied to
    /// every cluster. Length must be `n_atoms + 1` (the final element is the
    /// continuous category); a negative count structurally forbids that
    /// category as ground truth.
    pub fn set_atom_prior(&mut self, counts: &[f64], variable: usize) -> Result<(), ImputeError> {
        self.check_variable(variable)?;
        for models in &mut self.ecm {
            models[variable].set_truth_prior(counts)?;
        }
        Ok(())
    }

    /// Dirichlet prior counts for a variable's observation model, applied to
    /// every cluster. Rows index the true category, columns the observed
    /// category, both on the `n_atoms + 1` scale.
    pub fn set_atom_error_prior(
        &mut self,
        counts: &Array2<f64>,
        variable: usize,
    ) -> Result<(), ImputeError> {
        self.check_variable(variable)?;
        for models in &mut self.ecm {
            models[variable].set_obs_prior(counts)?;
        }
        Ok(())
    }

    // ----- training -----------------------------------------------------

    /// Allocate `nworkers` persistent accumulation threads. The previous pool
    /// is drained before being replaced.
    pub fn setup_worker_pool(&mut self, nworkers: usize) -> Result<(), ImputeError> {
        self.pool.configure(nworkers)
    }

    /// Advance the posterior by exactly one Gibbs sweep.
    pub fn sample_posterior(&mut self) -> Result<(), ImputeError> {
        if self.data.is_empty() {
            return Err(ImputeError::InvalidArgument(
                "no training data registered".to_string(),
            ));
        }
        self.ensure_empirical()?;
        let (stats, scores) = self.accumulate()?;

        // Stage every draw; commit only after the full sweep succeeds.
        let mut mixing = self.mixing.clone();
        let mut ecm = self.ecm.clone();
        let mut regression = self.regression.clone();
        let mut assignments = self.assignments.clone();

        for (k, models) in ecm.iter_mut().enumerate() {
            for (j, model) in models.iter_mut().enumerate() {
                model.draw_posterior(
                    &stats.truth_counts[k][j],
                    &stats.obs_counts[k][j],
                    &mut self.rng,
                )?;
            }
        }
        mixing.draw_posterior(&stats.occupancy, &mut self.rng)?;
        regression.draw_posterior(&stats.regression, &mut self.rng)?;
        for (i, slot) in assignments.iter_mut().enumerate() {
            *slot = draw_categorical_from_log(&mut self.rng, &scores.row(i).to_vec())?;
        }

        let empirical = self.empirical.as_deref().ok_or_else(|| {
            ImputeError::InvalidArgument("empirical distributions not built".to_string())
        })?;
        let mut imputed = Array2::zeros((self.data.len(), self.data.ydim()));
        for (i, row) in self.data.rows().iter().enumerate() {
            let values = impute_row_given_cluster(
                &self.catalog,
                empirical,
                &ecm,
                &regression,
                assignments[i],
                row,
                &mut self.rng,
            )?;
            imputed.row_mut(i).assign(&values);
        }

        log::debug!(
            "[imputer] sweep complete: {} observations, {} complete regression rows, occupancy {:?}",
            self.data.len(),
            stats.regression.nrows,
            stats.occupancy.to_vec()
        );

        self.mixing = mixing;
        self.ecm = ecm;
        self.regression = regression;
        self.assignments = assignments;
        self.imputed = Some(imputed);
        Ok(())
    }

    /// Posterior-predictive imputation of an external data set. Each call
    /// takes a single posterior draw per row conditioned on the current
    /// posterior state; the state itself is not advanced. Valid before the
    /// first sweep, where it reflects the priors only.
    pub fn impute_data_set(&mut self, rows: &[Observation]) -> Result<Array2<f64>, ImputeError> {
        for row in rows {
            validate_row(row, self.data.xdim(), self.data.ydim())?;
        }
        if self.empirical.is_none() {
            let source = if self.data.is_empty() {
                rows
            } else {
                self.data.rows()
            };
            self.empirical = Some(build_empirical(&self.catalog, source));
        }
        let empirical = self.empirical.as_deref().ok_or_else(|| {
            ImputeError::InvalidArgument("empirical distributions not built".to_string())
        })?;
        let mut out = Array2::zeros((rows.len(), self.data.ydim()));
        for (i, row) in rows.iter().enumerate() {
            let (categories, observed) = classify_row(&self.catalog, empirical, &row.y)?;
            let scores = cluster_log_scores(
                &self.mixing,
                &self.ecm,
                &self.regression,
                &row.x,
                &categories,
                &observed,
            )?;
            let cluster = draw_categorical_from_log(&mut self.rng, &scores)?;
            let values = impute_row_given_cluster(
                &self.catalog,
                empirical,
                &self.ecm,
                &self.regression,
                cluster,
                row,
                &mut self.rng,
            )?;
            out.row_mut(i).assign(&values);
        }
        Ok(out)
    }

    // ----- posterior queries --------------------------------------------

    /// Regression coefficients on the copula scale; rows are responses,
    /// columns predictors.
    pub fn coefficients(&self) -> Array2<f64> {
        self.regression.coefficients().clone()
    }

    /// Residual covariance on the copula scale.
    pub fn residual_variance(&self) -> Array2<f64> {
        self.regression.residual_variance().clone()
    }

    /// Truth-category probabilities for one (cluster, variable); the final
    /// entry is the continuous category.
    pub fn atom_probs(&self, cluster: usize, variable: usize) -> Result<Array1<f64>, ImputeError> {
        self.check_cluster(cluster)?;
        self.check_variable(variable)?;
        Ok(self.ecm[cluster][variable].truth_probs().clone())
    }

    /// Per-atom probability that an observed atom value is a disguised error.
    pub fn atom_error_probs(
        &self,
        cluster: usize,
        variable: usize,
    ) -> Result<Array1<f64>, ImputeError> {
        self.check_cluster(cluster)?;
        self.check_variable(variable)?;
        Ok(self.ecm[cluster][variable].error_probs())
    }

    /// Row-stochastic P(observed category | true category) for one
    /// (cluster, variable). Lossless counterpart of [`Self::atom_error_probs`]
    /// for persistence.
    pub fn atom_observation_probs(
        &self,
        cluster: usize,
        variable: usize,
    ) -> Result<Array2<f64>, ImputeError> {
        self.check_cluster(cluster)?;
        self.check_variable(variable)?;
        Ok(self.ecm[cluster][variable].obs_probs().clone())
    }

    /// The most recent training-set imputations, one row per observation.
    pub fn imputed_data(&self) -> Option<&Array2<f64>> {
        self.imputed.as_ref()
    }

    // ----- persistence --------------------------------------------------

    /// Restore serialized truth probabilities without replaying training.
    pub fn set_atom_probs(
        &mut self,
        cluster: usize,
        variable: usize,
        probs: &[f64],
    ) -> Result<(), ImputeError> {
        self.check_cluster(cluster)?;
        self.check_variable(variable)?;
        self.ecm[cluster][variable].set_truth_probs(probs)
    }

    /// Restore a serialized observation model without replaying training.
    pub fn set_atom_error_probs(
        &mut self,
        cluster: usize,
        variable: usize,
        probs: &Array2<f64>,
    ) -> Result<(), ImputeError> {
        self.check_cluster(cluster)?;
        self.check_variable(variable)?;
        self.ecm[cluster][variable].set_obs_probs(probs)
    }

    /// Warm-start override of the coefficient matrix; use between sweeps.
    pub fn set_coefficients(&mut self, beta: &Array2<f64>) -> Result<(), ImputeError> {
        self.regression.set_coefficients(beta)
    }

    /// Warm-start override of the residual covariance; use between sweeps.
    pub fn set_residual_variance(&mut self, sigma: &Array2<f64>) -> Result<(), ImputeError> {
        self.regression.set_residual_variance(sigma)
    }

    /// Persisted per-variable marginal distributions, building them from the
    /// registered training data if they do not exist yet.
    pub fn empirical_distributions(
        &mut self,
    ) -> Result<Vec<EmpiricalDistributionState>, ImputeError> {
        self.ensure_empirical()?;
        let empirical = self.empirical.as_deref().ok_or_else(|| {
            ImputeError::InvalidArgument("empirical distributions not built".to_string())
        })?;
        Ok(empirical.iter().map(|d| d.state().clone()).collect())
    }

    /// Restore marginal distributions from serialized state. Subsequent
    /// quantile and CDF queries reproduce the serialized outputs exactly.
    pub fn set_empirical_distributions(
        &mut self,
        states: Vec<EmpiricalDistributionState>,
    ) -> Result<(), ImputeError> {
        if states.len() != self.data.ydim() {
            return Err(ImputeError::DimensionMismatch {
                what: "empirical distribution list",
                expected: self.data.ydim(),
                found: states.len(),
            });
        }
        let restored = states
            .into_iter()
            .map(EmpiricalDistribution::from_state)
            .collect::<Result<Vec<_>, _>>()?;
        self.empirical = Some(restored);
        Ok(())
    }

    // ----- internals ----------------------------------------------------

    fn ensure_empirical(&mut self) -> Result<(), ImputeError> {
        if self.empirical.is_none() {
            if self.data.is_empty() {
                return Err(ImputeError::InvalidArgument(
                    "cannot build empirical distributions without training data".to_string(),
                ));
            }
            self.empirical = Some(build_empirical(&self.catalog, self.data.rows()));
        }
        Ok(())
    }

    /// Parallel half of the sweep: merged additive statistics plus the
    /// stitched `(nobs × nclusters)` cluster log-score matrix.
    fn accumulate(&self) -> Result<(SuffStats, Array2<f64>), ImputeError> {
        let empirical = self.empirical.as_deref().ok_or_else(|| {
            ImputeError::InvalidArgument("empirical distributions not built".to_string())
        })?;
        let ctx = SweepContext {
            catalog: &self.catalog,
            mixing: &self.mixing,
            ecm: &self.ecm,
            regression: &self.regression,
            empirical,
            data: self.data.rows(),
            assignments: &self.assignments,
        };
        let shards = self.pool.partition(self.data.len());
        let results: Vec<Result<ShardResult, ImputeError>> =
            self.pool.run(shards, |range| accumulate_range(&ctx, range));

        let nclusters = self.mixing.nclusters();
        let mut stats = SuffStats::zeros(&self.catalog, nclusters, self.data.xdim());
        let mut scores = Array2::zeros((self.data.len(), nclusters));
        for result in results {
            let shard = result?;
            stats.merge(&shard.stats);
            for (offset, row) in shard.scores.chunks(nclusters).enumerate() {
                for (k, &value) in row.iter().enumerate() {
                    scores[[shard.start + offset, k]] = value;
                }
            }
        }
        Ok((stats, scores))
    }

    fn check_cluster(&self, cluster: usize) -> Result<(), ImputeError> {
        if cluster >= self.nclusters() {
            return Err(ImputeError::InvalidArgument(format!(
                "cluster index {cluster} out of range for {} clusters",
                self.nclusters()
            )));
        }
        Ok(())
    }

    fn check_variable(&self, variable: usize) -> Result<(), ImputeError> {
        if variable >= self.data.ydim() {
            return Err(ImputeError::InvalidArgument(format!(
                "variable index {variable} out of range for {} variables",
                self.data.ydim()
            )));
        }
        Ok(())
    }
}

fn build_empirical(catalog: &AtomCatalog, rows: &[Observation]) -> Vec<EmpiricalDistribution> {
    (0..catalog.nvars())
        .map(|j| {
            let values: Vec<f64> = rows
                .iter()
                .map(|row| row.y[j])
                .filter(|&v| catalog.classify(j, v) == CellCategory::Continuous)
                .collect();
            EmpiricalDistribution::from_values(&values)
        })
        .collect()
}

/// Posterior-predictive imputation of one row given its cluster label.
///
/// Observed continuous cells pass through unchanged. For atom and missing
/// cells, a true category is drawn from the cluster's error-correction
/// posterior; atom truths resolve to the catalog value, and continuous truths
/// are drawn jointly from the regression conditional on the observed cells,
/// then mapped back to the data scale through the empirical marginal.
fn impute_row_given_cluster<R: Rng>(
    catalog: &AtomCatalog,
    empirical: &[EmpiricalDistribution],
    ecm: &[Vec<ErrorCorrectionModel>],
    regression: &CopulaRegression,
    cluster: usize,
    row: &Observation,
    rng: &mut R,
) -> Result<Array1<f64>, ImputeError> {
    let ydim = catalog.nvars();
    let (categories, observed) = classify_row(catalog, empirical, &row.y)?;
    let mut out = Array1::from_elem(ydim, f64::NAN);
    let mut latent = Vec::new();
    for (j, &category) in categories.iter().enumerate() {
        match category {
            CellCategory::Continuous => out[j] = row.y[j],
            _ => {
                let posterior = ecm[cluster][j].truth_posterior(category);
                let truth = draw_categorical(rng, &posterior.to_vec())?;
                if truth + 1 == catalog.ncats(j) {
                    latent.push(j);
                } else {
                    out[j] = catalog.atom_value(j, truth);
                }
            }
        }
    }
    if !latent.is_empty() {
        let draws = regression.conditional_draw(&row.x, &observed, &latent, rng)?;
        for (&j, z) in latent.iter().zip(draws) {
            out[j] = empirical[j].value_from_z(z)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn seeded_imputer(seed: u64) -> MvRegCopulaImputer {
        let mut imputer = MvRegCopulaImputer::new(2, vec![vec![0.0], vec![]], 2, seed).unwrap();
        let ys = [
            [0.0, 1.0],
            [1.4, 2.1],
            [f64::NAN, 0.4],
            [0.0, -1.3],
            [2.8, 0.9],
            [3.1, f64::NAN],
            [0.7, 1.8],
            [1.9, -0.2],
        ];
        for (i, y) in ys.iter().enumerate() {
            imputer
                .add_data(array![1.0, i as f64 * 0.25], array![y[0], y[1]])
                .unwrap();
        }
        imputer
    }

    #[test]
    fn sufficient_statistics_are_partition_invariant() {
        let mut serial = seeded_imputer(99);
        let mut sharded = seeded_imputer(99);
        serial.ensure_empirical().unwrap();
        sharded.ensure_empirical().unwrap();
        sharded.setup_worker_pool(4).unwrap();

        let (stats_1, scores_1) = serial.accumulate().unwrap();
        let (stats_4, scores_4) = sharded.accumulate().unwrap();

        for k in 0..2 {
            assert!((stats_1.occupancy[k] - stats_4.occupancy[k]).abs() < 1e-9);
            for j in 0..2 {
                let diff = (&stats_1.truth_counts[k][j] - &stats_4.truth_counts[k][j])
                    .iter()
                    .fold(0.0f64, |m, v| m.max(v.abs()));
                assert!(diff < 1e-9);
            }
        }
        let xtx_diff = (&stats_1.regression.xtx - &stats_4.regression.xtx)
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(xtx_diff < 1e-9);
        assert_eq!(stats_1.regression.nrows, stats_4.regression.nrows);
        let score_diff = (&scores_1 - &scores_4)
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(score_diff < 1e-9);
    }

    #[test]
    fn failed_sweep_leaves_posterior_untouched() {
        let mut imputer = MvRegCopulaImputer::new(2, vec![vec![0.0]], 1, 3).unwrap();
        // Single continuous value: the empirical distribution is degenerate,
        // so the copula transform inside the sweep must fail.
        imputer.add_data(array![1.0], array![5.0]).unwrap();
        imputer.add_data(array![1.0], array![5.0]).unwrap();
        let before = imputer.coefficients();
        let result = imputer.sample_posterior();
        assert!(matches!(result, Err(ImputeError::NumericalFailure(_))));
        assert_eq!(imputer.coefficients(), before);
        assert!(imputer.imputed_data().is_none());
    }

    #[test]
    fn index_checks_fire_before_any_work() {
        let imputer = seeded_imputer(1);
        assert!(imputer.atom_probs(2, 0).is_err());
        assert!(imputer.atom_probs(0, 5).is_err());
        assert!(imputer.atom_error_probs(0, 5).is_err());
    }
}
