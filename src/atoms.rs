//! Atom catalogs and the per-(cluster, variable) error-correction model.
//!
//! An atom is a pre-declared special value (0, 99999, ...) that may be a
//! genuine measurement or a data-entry artifact. Each variable's categories
//! are its atoms in catalog order, plus an implicit "continuous" category at
//! index `n_atoms`. The error-correction model carries a categorical truth
//! distribution over those categories and a row-stochastic observation model
//! P(observed category | true category); the probability that an observed atom
//! is an error is derived from the two, never stored.

use crate::error::ImputeError;
use crate::probability::draw_dirichlet;
use ndarray::{Array1, Array2};
use rand::Rng;

/// Matching tolerance when classifying a raw cell against the catalog.
const ATOM_MATCH_TOL: f64 = 1e-9;

const DEFAULT_TRUTH_PRIOR_COUNT: f64 = 1.0;
const DEFAULT_OBS_PRIOR_DIAGONAL: f64 = 1.0;
const DEFAULT_OBS_PRIOR_OFF_DIAGONAL: f64 = 0.1;

/// Classification of one response cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellCategory {
    Missing,
    Atom(usize),
    Continuous,
}

impl CellCategory {
    /// Observed category index on the `n_atoms + 1` scale, `None` for missing.
    pub fn observed_index(self, ncats: usize) -> Option<usize> {
        match self {
            CellCategory::Missing => None,
            CellCategory::Atom(a) => Some(a),
            CellCategory::Continuous => Some(ncats - 1),
        }
    }
}

/// Immutable per-variable list of atom values.
#[derive(Clone, Debug)]
pub struct AtomCatalog {
    atoms: Vec<Vec<f64>>,
}

impl AtomCatalog {
    pub fn new(atoms: Vec<Vec<f64>>) -> Result<Self, ImputeError> {
        for (variable, values) in atoms.iter().enumerate() {
            for (i, &v) in values.iter().enumerate() {
                if !v.is_finite() {
                    return Err(ImputeError::InvalidArgument(format!(
                        "atom {i} of variable {variable} is not finite"
                    )));
                }
                if values[..i].iter().any(|&prior| atom_matches(v, prior)) {
                    return Err(ImputeError::InvalidArgument(format!(
                        "atom {v} appears twice for variable {variable}"
                    )));
                }
            }
        }
        Ok(Self { atoms })
    }

    pub fn nvars(&self) -> usize {
        self.atoms.len()
    }

    pub fn n_atoms(&self, variable: usize) -> usize {
        self.atoms[variable].len()
    }

    /// Number of truth categories for a variable: atoms plus continuous.
    pub fn ncats(&self, variable: usize) -> usize {
        self.atoms[variable].len() + 1
    }

    pub fn atoms(&self) -> &[Vec<f64>] {
        &self.atoms
    }

    pub fn atom_value(&self, variable: usize, atom: usize) -> f64 {
        self.atoms[variable][atom]
    }

    /// Classify one raw cell: NaN is the missing sentinel, catalog matches are
    /// atoms, everything else is continuous.
    pub fn classify(&self, variable: usize, value: f64) -> CellCategory {
        if value.is_nan() {
            return CellCategory::Missing;
        }
        for (index, &atom) in self.atoms[variable].iter().enumerate() {
            if atom_matches(value, atom) {
                return CellCategory::Atom(index);
            }
        }
        CellCategory::Continuous
    }
}

fn atom_matches(value: f64, atom: f64) -> bool {
    (value - atom).abs() <= ATOM_MATCH_TOL * atom.abs().max(1.0)
}

/// Truth and observation model for one (cluster, variable) pair.
#[derive(Clone, Debug)]
pub struct ErrorCorrectionModel {
    truth_prior: Array1<f64>,
    obs_prior: Array2<f64>,
    truth_probs: Array1<f64>,
    obs_probs: Array2<f64>,
}

impl ErrorCorrectionModel {
    /// Uniform default prior counts over truth categories.
    pub fn default_truth_prior(ncats: usize) -> Vec<f64> {
        vec![DEFAULT_TRUTH_PRIOR_COUNT; ncats]
    }

    /// Diagonal-heavy default prior for the observation model: observed
    /// categories mostly agree with the truth.
    pub fn default_obs_prior(ncats: usize) -> Array2<f64> {
        Array2::from_shape_fn((ncats, ncats), |(t, c)| {
            if t == c {
                DEFAULT_OBS_PRIOR_DIAGONAL
            } else {
                DEFAULT_OBS_PRIOR_OFF_DIAGONAL
            }
        })
    }

    pub fn new(ncats: usize) -> Self {
        let truth_prior = Array1::from_vec(Self::default_truth_prior(ncats));
        let obs_prior = Self::default_obs_prior(ncats);
        let truth_probs = normalized_clamped(&truth_prior);
        let obs_probs = row_normalized(&obs_prior);
        Self {
            truth_prior,
            obs_prior,
            truth_probs,
            obs_probs,
        }
    }

    pub fn ncats(&self) -> usize {
        self.truth_prior.len()
    }

    /// Dirichlet prior counts over truth categories. A negative count is a
    /// structural prohibition: that category is clamped to zero posterior mass
    /// in every sweep, and the negative value never reaches a sampler.
    pub fn set_truth_prior(&mut self, counts: &[f64]) -> Result<(), ImputeError> {
        if counts.len() != self.ncats() {
            return Err(ImputeError::DimensionMismatch {
                what: "atom prior counts",
                expected: self.ncats(),
                found: counts.len(),
            });
        }
        if counts.iter().all(|&c| c < 0.0) {
            return Err(ImputeError::InvalidArgument(
                "atom prior forbids every category".to_string(),
            ));
        }
        self.truth_prior = Array1::from_vec(counts.to_vec());
        self.truth_probs = normalized_clamped(&self.truth_prior);
        Ok(())
    }

    /// Dirichlet prior counts for the observation model. Row = true category,
    /// column = observed category.
    pub fn set_obs_prior(&mut self, counts: &Array2<f64>) -> Result<(), ImputeError> {
        let n = self.ncats();
        if counts.nrows() != n || counts.ncols() != n {
            return Err(ImputeError::DimensionMismatch {
                what: "atom error prior matrix",
                expected: n,
                found: counts.nrows().max(counts.ncols()),
            });
        }
        for row in counts.rows() {
            let total: f64 = row.iter().map(|&c| c.max(0.0)).sum();
            if row.iter().any(|&c| c < 0.0) || total <= 0.0 {
                return Err(ImputeError::InvalidArgument(
                    "atom error prior rows must be non-negative with positive mass".to_string(),
                ));
            }
        }
        self.obs_prior = counts.clone();
        self.obs_probs = row_normalized(&self.obs_prior);
        Ok(())
    }

    pub fn truth_probs(&self) -> &Array1<f64> {
        &self.truth_probs
    }

    pub fn obs_probs(&self) -> &Array2<f64> {
        &self.obs_probs
    }

    /// Restore a serialized truth distribution, re-applying structural zeros.
    pub fn set_truth_probs(&mut self, probs: &[f64]) -> Result<(), ImputeError> {
        if probs.len() != self.ncats() {
            return Err(ImputeError::DimensionMismatch {
                what: "atom probabilities",
                expected: self.ncats(),
                found: probs.len(),
            });
        }
        let mut restored = Array1::from_vec(probs.to_vec());
        let mut total = 0.0;
        for (t, slot) in restored.iter_mut().enumerate() {
            if !slot.is_finite() || *slot < 0.0 {
                return Err(ImputeError::InvalidArgument(format!(
                    "atom probability {slot} is not a probability"
                )));
            }
            if self.truth_prior[t] < 0.0 {
                *slot = 0.0;
            }
            total += *slot;
        }
        if (total - 1.0).abs() > 1e-6 {
            return Err(ImputeError::InvalidArgument(format!(
                "atom probabilities sum to {total}, expected 1"
            )));
        }
        self.truth_probs = &restored / total;
        Ok(())
    }

    /// Restore a serialized observation model (row-stochastic).
    pub fn set_obs_probs(&mut self, probs: &Array2<f64>) -> Result<(), ImputeError> {
        let n = self.ncats();
        if probs.nrows() != n || probs.ncols() != n {
            return Err(ImputeError::DimensionMismatch {
                what: "atom error probabilities",
                expected: n,
                found: probs.nrows().max(probs.ncols()),
            });
        }
        let mut restored = probs.clone();
        for mut row in restored.rows_mut() {
            let total: f64 = row.iter().sum();
            if row.iter().any(|&p| !p.is_finite() || p < 0.0) || (total - 1.0).abs() > 1e-6 {
                return Err(ImputeError::InvalidArgument(
                    "atom error probability rows must be distributions".to_string(),
                ));
            }
            row.mapv_inplace(|p| p / total);
        }
        self.obs_probs = restored;
        Ok(())
    }

    /// log P(observed category | this cluster), marginalized over truth.
    /// Missing cells are uninformative for the pattern model.
    pub fn observed_log_likelihood(&self, category: CellCategory) -> f64 {
        match category.observed_index(self.ncats()) {
            None => 0.0,
            Some(c) => {
                let mut total = 0.0;
                for t in 0..self.ncats() {
                    total += self.truth_probs[t] * self.obs_probs[[t, c]];
                }
                total.max(f64::MIN_POSITIVE).ln()
            }
        }
    }

    /// Posterior over the true category given one observed cell.
    pub fn truth_posterior(&self, category: CellCategory) -> Array1<f64> {
        match category.observed_index(self.ncats()) {
            None => self.truth_probs.clone(),
            Some(c) => {
                let mut posterior = Array1::zeros(self.ncats());
                let mut total = 0.0;
                for t in 0..self.ncats() {
                    let mass = self.truth_probs[t] * self.obs_probs[[t, c]];
                    posterior[t] = mass;
                    total += mass;
                }
                if total > 0.0 {
                    posterior /= total;
                } else {
                    posterior.assign(&self.truth_probs);
                }
                posterior
            }
        }
    }

    /// P(error | atom a observed) = 1 − P(truth = a | observed = a), per atom.
    pub fn error_probs(&self) -> Array1<f64> {
        let n_atoms = self.ncats() - 1;
        let mut out = Array1::zeros(n_atoms);
        for a in 0..n_atoms {
            let posterior = self.truth_posterior(CellCategory::Atom(a));
            out[a] = (1.0 - posterior[a]).clamp(0.0, 1.0);
        }
        out
    }

    /// One Gibbs update from accumulated truth and (truth, observed) counts.
    pub fn draw_posterior<R: Rng>(
        &mut self,
        truth_counts: &Array1<f64>,
        obs_counts: &Array2<f64>,
        rng: &mut R,
    ) -> Result<(), ImputeError> {
        let n = self.ncats();
        let mut alpha = vec![0.0; n];
        for t in 0..n {
            alpha[t] = if self.truth_prior[t] < 0.0 {
                0.0
            } else {
                self.truth_prior[t] + truth_counts[t]
            };
        }
        self.truth_probs = Array1::from_vec(draw_dirichlet(rng, &alpha)?);
        for t in 0..n {
            let row_alpha: Vec<f64> = (0..n)
                .map(|c| self.obs_prior[[t, c]] + obs_counts[[t, c]])
                .collect();
            let row = draw_dirichlet(rng, &row_alpha)?;
            for c in 0..n {
                self.obs_probs[[t, c]] = row[c];
            }
        }
        Ok(())
    }
}

fn normalized_clamped(counts: &Array1<f64>) -> Array1<f64> {
    let clamped = counts.mapv(|c| c.max(0.0));
    let total: f64 = clamped.sum();
    if total > 0.0 {
        clamped / total
    } else {
        Array1::from_elem(counts.len(), 1.0 / counts.len() as f64)
    }
}

fn row_normalized(counts: &Array2<f64>) -> Array2<f64> {
    let mut out = counts.mapv(|c| c.max(0.0));
    for mut row in out.rows_mut() {
        let total: f64 = row.iter().sum();
        if total > 0.0 {
            row.mapv_inplace(|c| c / total);
        } else {
            row.fill(1.0 / counts.ncols() as f64);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn classify_matches_atoms_and_missing() {
        let catalog = AtomCatalog::new(vec![vec![0.0, 99.0], vec![]]).unwrap();
        assert_eq!(catalog.classify(0, 0.0), CellCategory::Atom(0));
        assert_eq!(catalog.classify(0, 99.0), CellCategory::Atom(1));
        assert_eq!(catalog.classify(0, 1.5), CellCategory::Continuous);
        assert_eq!(catalog.classify(0, f64::NAN), CellCategory::Missing);
        assert_eq!(catalog.classify(1, 0.0), CellCategory::Continuous);
        assert_eq!(catalog.ncats(0), 3);
        assert_eq!(catalog.ncats(1), 1);
    }

    #[test]
    fn duplicate_atoms_are_rejected() {
        assert!(AtomCatalog::new(vec![vec![1.0, 1.0]]).is_err());
    }

    #[test]
    fn truth_posterior_sums_to_one() {
        let model = ErrorCorrectionModel::new(3);
        for category in [
            CellCategory::Missing,
            CellCategory::Atom(0),
            CellCategory::Atom(1),
            CellCategory::Continuous,
        ] {
            let posterior = model.truth_posterior(category);
            assert!((posterior.sum() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn structural_zero_survives_draws() {
        let mut model = ErrorCorrectionModel::new(2);
        model.set_truth_prior(&[-1.0, 1.0]).unwrap();
        assert_eq!(model.truth_probs()[0], 0.0);
        let mut rng = StdRng::seed_from_u64(11);
        let truth_counts = array![5.0, 2.0];
        let obs_counts = array![[4.0, 1.0], [1.0, 1.0]];
        for _ in 0..25 {
            model
                .draw_posterior(&truth_counts, &obs_counts, &mut rng)
                .unwrap();
            assert_eq!(model.truth_probs()[0], 0.0);
            assert!((model.truth_probs().sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn error_prob_is_one_minus_self_posterior() {
        let mut model = ErrorCorrectionModel::new(2);
        model.set_truth_probs(&[0.3, 0.7]).unwrap();
        model
            .set_obs_probs(&array![[0.9, 0.1], [0.4, 0.6]])
            .unwrap();
        // P(truth=0 | obs=0) = .3*.9 / (.3*.9 + .7*.4)
        let expected = 1.0 - 0.27 / (0.27 + 0.28);
        assert!((model.error_probs()[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn prior_setters_validate_shapes() {
        let mut model = ErrorCorrectionModel::new(2);
        assert!(model.set_truth_prior(&[1.0]).is_err());
        assert!(model.set_obs_prior(&array![[1.0, 1.0]]).is_err());
        assert!(model.set_truth_prior(&[-1.0, -2.0]).is_err());
    }
}
