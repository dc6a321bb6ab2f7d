//! Additive sweep statistics accumulated shard-by-shard.
//!
//! Every field is a plain sum over observations, so the merged total is
//! independent of the shard partition and of merge order (up to floating
//! rounding). Cluster-score rows are not sums; each observation owns exactly
//! one row, shards cover disjoint index ranges, and the coordinator stitches
//! the rows back together, which preserves the same partition-invariance.

use crate::atoms::{AtomCatalog, CellCategory, ErrorCorrectionModel};
use crate::dataset::Observation;
use crate::empirical::EmpiricalDistribution;
use crate::error::ImputeError;
use crate::mixture::MixingWeights;
use crate::regression::{CopulaRegression, RegressionSuffStats};
use ndarray::{Array1, Array2};
use std::ops::Range;

/// Read-only view of the posterior state a sweep accumulates against.
/// Workers share it immutably; nothing here is written during accumulation.
pub(crate) struct SweepContext<'a> {
    pub catalog: &'a AtomCatalog,
    pub mixing: &'a MixingWeights,
    pub ecm: &'a [Vec<ErrorCorrectionModel>],
    pub regression: &'a CopulaRegression,
    pub empirical: &'a [EmpiricalDistribution],
    pub data: &'a [Observation],
    pub assignments: &'a [usize],
}

/// Merged additive statistics for one sweep.
pub(crate) struct SuffStats {
    pub occupancy: Array1<f64>,
    /// Expected truth-category counts, indexed `[cluster][variable]`.
    pub truth_counts: Vec<Vec<Array1<f64>>>,
    /// Expected (truth, observed) pair counts, indexed `[cluster][variable]`.
    pub obs_counts: Vec<Vec<Array2<f64>>>,
    pub regression: RegressionSuffStats,
}

impl SuffStats {
    pub fn zeros(catalog: &AtomCatalog, nclusters: usize, xdim: usize) -> Self {
        let ydim = catalog.nvars();
        let truth_counts = (0..nclusters)
            .map(|_| (0..ydim).map(|j| Array1::zeros(catalog.ncats(j))).collect())
            .collect();
        let obs_counts = (0..nclusters)
            .map(|_| {
                (0..ydim)
                    .map(|j| Array2::zeros((catalog.ncats(j), catalog.ncats(j))))
                    .collect()
            })
            .collect();
        Self {
            occupancy: Array1::zeros(nclusters),
            truth_counts,
            obs_counts,
            regression: RegressionSuffStats::zeros(xdim, ydim),
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.occupancy += &other.occupancy;
        for (mine, theirs) in self.truth_counts.iter_mut().zip(other.truth_counts.iter()) {
            for (a, b) in mine.iter_mut().zip(theirs.iter()) {
                *a += b;
            }
        }
        for (mine, theirs) in self.obs_counts.iter_mut().zip(other.obs_counts.iter()) {
            for (a, b) in mine.iter_mut().zip(theirs.iter()) {
                *a += b;
            }
        }
        self.regression.merge(&other.regression);
    }
}

/// Statistics produced by one worker over one contiguous observation range.
pub(crate) struct ShardResult {
    pub start: usize,
    pub stats: SuffStats,
    /// Row-major `(range length × nclusters)` cluster log scores.
    pub scores: Vec<f64>,
}

/// Classify one row and copula-transform its observed continuous cells.
pub(crate) fn classify_row(
    catalog: &AtomCatalog,
    empirical: &[EmpiricalDistribution],
    y: &Array1<f64>,
) -> Result<(Vec<CellCategory>, Vec<(usize, f64)>), ImputeError> {
    let ydim = catalog.nvars();
    let mut categories = Vec::with_capacity(ydim);
    let mut observed = Vec::new();
    for j in 0..ydim {
        let category = catalog.classify(j, y[j]);
        if category == CellCategory::Continuous {
            observed.push((j, empirical[j].copula_z(y[j])?));
        }
        categories.push(category);
    }
    Ok((categories, observed))
}

/// Per-cluster unnormalized log posterior of one observation's label:
/// mixing weight, observed-category likelihood per variable, and the Gaussian
/// residual likelihood of the copula-transformed cells (shared across
/// clusters, since Beta and Sigma are common to all of them).
pub(crate) fn cluster_log_scores(
    mixing: &MixingWeights,
    ecm: &[Vec<ErrorCorrectionModel>],
    regression: &CopulaRegression,
    x: &Array1<f64>,
    categories: &[CellCategory],
    observed: &[(usize, f64)],
) -> Result<Vec<f64>, ImputeError> {
    let gaussian = regression.observed_log_density(x, observed)?;
    let log_weights = mixing.log_weights();
    let mut scores = Vec::with_capacity(mixing.nclusters());
    for (k, models) in ecm.iter().enumerate() {
        let mut score = log_weights[k] + gaussian;
        for (j, &category) in categories.iter().enumerate() {
            score += models[j].observed_log_likelihood(category);
        }
        scores.push(score);
    }
    Ok(scores)
}

/// Accumulate one shard. Deterministic: no random draws happen here, so the
/// merged statistics match for any worker count.
pub(crate) fn accumulate_range(
    ctx: &SweepContext<'_>,
    range: Range<usize>,
) -> Result<ShardResult, ImputeError> {
    let nclusters = ctx.mixing.nclusters();
    let ydim = ctx.catalog.nvars();
    let xdim = ctx.regression.xdim();
    let mut stats = SuffStats::zeros(ctx.catalog, nclusters, xdim);
    let mut scores = Vec::with_capacity(range.len() * nclusters);

    for i in range.clone() {
        let row = &ctx.data[i];
        let cluster = ctx.assignments[i];
        let (categories, observed) = classify_row(ctx.catalog, ctx.empirical, &row.y)?;
        scores.extend(cluster_log_scores(
            ctx.mixing,
            ctx.ecm,
            ctx.regression,
            &row.x,
            &categories,
            &observed,
        )?);

        stats.occupancy[cluster] += 1.0;
        for (j, &category) in categories.iter().enumerate() {
            let posterior = ctx.ecm[cluster][j].truth_posterior(category);
            stats.truth_counts[cluster][j] += &posterior;
            if let Some(c) = category.observed_index(ctx.catalog.ncats(j)) {
                for t in 0..ctx.catalog.ncats(j) {
                    stats.obs_counts[cluster][j][[t, c]] += posterior[t];
                }
            }
        }

        if observed.len() == ydim {
            let z = Array1::from_iter(observed.iter().map(|&(_, z)| z));
            stats.regression.add_complete_row(&row.x, &z);
        }
    }

    Ok(ShardResult {
        start: range.start,
        stats,
        scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn merge_adds_every_field() {
        let catalog = AtomCatalog::new(vec![vec![0.0]]).unwrap();
        let mut a = SuffStats::zeros(&catalog, 2, 1);
        let mut b = SuffStats::zeros(&catalog, 2, 1);
        a.occupancy[0] = 2.0;
        b.occupancy[0] = 3.0;
        a.truth_counts[0][0][1] = 1.5;
        b.truth_counts[0][0][1] = 0.5;
        a.obs_counts[1][0][[0, 0]] = 1.0;
        b.obs_counts[1][0][[0, 0]] = 2.0;
        a.regression.add_complete_row(&array![1.0], &array![0.5]);
        b.regression.add_complete_row(&array![2.0], &array![-0.5]);

        a.merge(&b);
        assert_eq!(a.occupancy[0], 5.0);
        assert_eq!(a.truth_counts[0][0][1], 2.0);
        assert_eq!(a.obs_counts[1][0][[0, 0]], 3.0);
        assert_eq!(a.regression.nrows, 2.0);
        assert!((a.regression.xtx[[0, 0]] - 5.0).abs() < 1e-12);
    }
}
