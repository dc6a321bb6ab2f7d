//! Multivariate weighted regression on the copula scale.
//!
//! Responses are mapped through each variable's empirical CDF composed with
//! Φ⁻¹ before they reach this model, so the regression sees latent standard
//! normal margins. The coefficient matrix `beta` has one row per response and
//! one column per predictor; `sigma` is the residual covariance on the
//! transformed scale. Both are updated by one pair of conditional conjugate
//! draws per sweep: Beta | Sigma from a matrix-normal posterior, then
//! Sigma | Beta from an inverse-Wishart posterior.

use crate::error::ImputeError;
use crate::linalg::{cholesky, cholesky_with_ridge, solve_lower_transpose, spd_inverse, symmetrize};
use crate::probability::draw_standard_normal;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::{ChiSquared, Distribution};
use serde::{Deserialize, Serialize};

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Nearly-flat conjugate prior for the regression block.
///
/// `coefficient_shrinkage` is the scalar precision of the matrix-normal
/// coefficient prior (columns shrink independently toward
/// `coefficient_mean`); `sigma_df` and `sigma_scale` parameterize the
/// inverse-Wishart residual prior.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegressionPrior {
    pub coefficient_mean: Array2<f64>,
    pub coefficient_shrinkage: f64,
    pub sigma_df: f64,
    pub sigma_scale: Array2<f64>,
}

impl RegressionPrior {
    pub fn nearly_flat(xdim: usize, ydim: usize) -> Self {
        Self {
            coefficient_mean: Array2::zeros((ydim, xdim)),
            coefficient_shrinkage: 1.0,
            sigma_df: ydim as f64 + 2.0,
            sigma_scale: Array2::eye(ydim),
        }
    }
}

/// Complete-row cross products feeding the conjugate updates.
///
/// A row contributes if and only if every response cell is an observed
/// continuous value; rows with any atom-flagged or missing cell carry weight
/// zero. All fields are plain sums, so shard results merge by addition.
#[derive(Clone, Debug)]
pub struct RegressionSuffStats {
    pub xtx: Array2<f64>,
    pub xty: Array2<f64>,
    pub yty: Array2<f64>,
    pub nrows: f64,
}

impl RegressionSuffStats {
    pub fn zeros(xdim: usize, ydim: usize) -> Self {
        Self {
            xtx: Array2::zeros((xdim, xdim)),
            xty: Array2::zeros((xdim, ydim)),
            yty: Array2::zeros((ydim, ydim)),
            nrows: 0.0,
        }
    }

    /// Add one fully observed row on the copula scale.
    pub fn add_complete_row(&mut self, x: &Array1<f64>, z: &Array1<f64>) {
        let p = x.len();
        let d = z.len();
        for i in 0..p {
            for j in 0..p {
                self.xtx[[i, j]] += x[i] * x[j];
            }
            for j in 0..d {
                self.xty[[i, j]] += x[i] * z[j];
            }
        }
        for i in 0..d {
            for j in 0..d {
                self.yty[[i, j]] += z[i] * z[j];
            }
        }
        self.nrows += 1.0;
    }

    pub fn merge(&mut self, other: &Self) {
        self.xtx += &other.xtx;
        self.xty += &other.xty;
        self.yty += &other.yty;
        self.nrows += other.nrows;
    }
}

#[derive(Clone, Debug)]
pub struct CopulaRegression {
    xdim: usize,
    ydim: usize,
    beta: Array2<f64>,
    sigma: Array2<f64>,
    prior: RegressionPrior,
}

impl CopulaRegression {
    pub fn new(xdim: usize, ydim: usize) -> Self {
        Self {
            xdim,
            ydim,
            beta: Array2::zeros((ydim, xdim)),
            sigma: Array2::eye(ydim),
            prior: RegressionPrior::nearly_flat(xdim, ydim),
        }
    }

    pub fn xdim(&self) -> usize {
        self.xdim
    }

    pub fn ydim(&self) -> usize {
        self.ydim
    }

    pub fn coefficients(&self) -> &Array2<f64> {
        &self.beta
    }

    pub fn residual_variance(&self) -> &Array2<f64> {
        &self.sigma
    }

    /// Warm-start override; legal only between sweeps.
    pub fn set_coefficients(&mut self, beta: &Array2<f64>) -> Result<(), ImputeError> {
        if beta.nrows() != self.ydim || beta.ncols() != self.xdim {
            return Err(ImputeError::DimensionMismatch {
                what: "coefficient matrix",
                expected: self.ydim * self.xdim,
                found: beta.nrows() * beta.ncols(),
            });
        }
        if beta.iter().any(|v| !v.is_finite()) {
            return Err(ImputeError::InvalidArgument(
                "coefficient matrix must be finite".to_string(),
            ));
        }
        self.beta = beta.clone();
        Ok(())
    }

    /// Warm-start override; the input must be symmetric positive definite.
    pub fn set_residual_variance(&mut self, sigma: &Array2<f64>) -> Result<(), ImputeError> {
        if sigma.nrows() != self.ydim || sigma.ncols() != self.ydim {
            return Err(ImputeError::DimensionMismatch {
                what: "residual variance matrix",
                expected: self.ydim,
                found: sigma.nrows().max(sigma.ncols()),
            });
        }
        let mut candidate = sigma.clone();
        symmetrize(&mut candidate);
        let asymmetry = (sigma - &candidate).iter().fold(0.0f64, |m, v| m.max(v.abs()));
        if asymmetry > 1e-8 {
            return Err(ImputeError::InvalidArgument(
                "residual variance matrix must be symmetric".to_string(),
            ));
        }
        if cholesky(&candidate).is_err() {
            return Err(ImputeError::InvalidArgument(
                "residual variance matrix must be positive definite".to_string(),
            ));
        }
        self.sigma = candidate;
        Ok(())
    }

    pub fn set_prior(&mut self, prior: RegressionPrior) -> Result<(), ImputeError> {
        if prior.coefficient_mean.nrows() != self.ydim
            || prior.coefficient_mean.ncols() != self.xdim
        {
            return Err(ImputeError::DimensionMismatch {
                what: "coefficient prior mean",
                expected: self.ydim * self.xdim,
                found: prior.coefficient_mean.nrows() * prior.coefficient_mean.ncols(),
            });
        }
        if !(prior.coefficient_shrinkage.is_finite() && prior.coefficient_shrinkage > 0.0) {
            return Err(ImputeError::InvalidArgument(
                "coefficient shrinkage must be positive".to_string(),
            ));
        }
        if prior.sigma_df <= self.ydim as f64 - 1.0 {
            return Err(ImputeError::InvalidArgument(format!(
                "inverse-Wishart degrees of freedom {} too small for dimension {}",
                prior.sigma_df, self.ydim
            )));
        }
        if prior.sigma_scale.nrows() != self.ydim || prior.sigma_scale.ncols() != self.ydim {
            return Err(ImputeError::DimensionMismatch {
                what: "residual prior scale",
                expected: self.ydim,
                found: prior.sigma_scale.nrows().max(prior.sigma_scale.ncols()),
            });
        }
        self.prior = prior;
        Ok(())
    }

    /// Reset to the nearly-flat default with `sample_size` pseudo-observations.
    pub fn set_default_prior(&mut self, sample_size: f64) -> Result<(), ImputeError> {
        if !(sample_size.is_finite() && sample_size > 0.0) {
            return Err(ImputeError::InvalidArgument(format!(
                "regression prior sample size must be positive, got {sample_size}"
            )));
        }
        self.set_prior(RegressionPrior {
            coefficient_mean: Array2::zeros((self.ydim, self.xdim)),
            coefficient_shrinkage: sample_size,
            sigma_df: self.ydim as f64 + 1.0 + sample_size,
            sigma_scale: Array2::eye(self.ydim) * sample_size,
        })
    }

    /// Conditional mean of the copula-scale response.
    pub fn predict(&self, x: &Array1<f64>) -> Array1<f64> {
        self.beta.dot(x)
    }

    /// Log density of the observed continuous cells under N(Beta x, Sigma),
    /// marginalized to the observed coordinate subset. Empty subsets carry no
    /// information and score zero.
    pub fn observed_log_density(
        &self,
        x: &Array1<f64>,
        observed: &[(usize, f64)],
    ) -> Result<f64, ImputeError> {
        if observed.is_empty() {
            return Ok(0.0);
        }
        let mean = self.predict(x);
        let m = observed.len();
        let sub_sigma = Array2::from_shape_fn((m, m), |(i, j)| {
            self.sigma[[observed[i].0, observed[j].0]]
        });
        let residual = Array1::from_iter(observed.iter().map(|&(j, z)| z - mean[j]));
        let factor = cholesky_with_ridge(&sub_sigma)?;
        let quad = residual.dot(&factor.solve_vec(&residual));
        Ok(-0.5 * (m as f64 * LN_2PI + factor.log_det() + quad))
    }

    /// Draw the latent copula-scale values of `missing` cells from their
    /// conditional normal given the observed continuous cells.
    pub fn conditional_draw<R: Rng>(
        &self,
        x: &Array1<f64>,
        observed: &[(usize, f64)],
        missing: &[usize],
        rng: &mut R,
    ) -> Result<Vec<f64>, ImputeError> {
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        let mean = self.predict(x);
        let m = missing.len();
        let sigma_mm =
            Array2::from_shape_fn((m, m), |(i, j)| self.sigma[[missing[i], missing[j]]]);
        let (mut cond_mean, mut cond_cov) = (
            Array1::from_iter(missing.iter().map(|&j| mean[j])),
            sigma_mm,
        );
        if !observed.is_empty() {
            let o = observed.len();
            let sigma_oo = Array2::from_shape_fn((o, o), |(i, j)| {
                self.sigma[[observed[i].0, observed[j].0]]
            });
            let sigma_om = Array2::from_shape_fn((o, m), |(i, j)| {
                self.sigma[[observed[i].0, missing[j]]]
            });
            let residual = Array1::from_iter(observed.iter().map(|&(j, z)| z - mean[j]));
            let factor = cholesky_with_ridge(&sigma_oo)?;
            let weights = factor.solve_mat(&sigma_om);
            cond_mean = &cond_mean + &weights.t().dot(&residual);
            cond_cov = &cond_cov - &weights.t().dot(&sigma_om);
            symmetrize(&mut cond_cov);
        }
        let lower = cholesky_with_ridge(&cond_cov)?.lower();
        let noise = Array1::from_shape_fn(m, |_| draw_standard_normal(rng));
        Ok((cond_mean + lower.dot(&noise)).to_vec())
    }

    /// One pair of conditional conjugate draws:
    /// Beta | Sigma (matrix-normal), then Sigma | Beta (inverse-Wishart).
    pub fn draw_posterior<R: Rng>(
        &mut self,
        stats: &RegressionSuffStats,
        rng: &mut R,
    ) -> Result<(), ImputeError> {
        let p = self.xdim;
        let d = self.ydim;
        let kappa = self.prior.coefficient_shrinkage;

        let mut precision = stats.xtx.clone();
        for i in 0..p {
            precision[[i, i]] += kappa;
        }
        symmetrize(&mut precision);
        let factor = cholesky(&precision)?;

        // Posterior mean and draw of B = betaᵀ (predictors × responses).
        let b0t = self.prior.coefficient_mean.t().to_owned();
        let rhs = &stats.xty + &(&b0t * kappa);
        let bn = factor.solve_mat(&rhs);
        let lp = factor.lower();
        let ls = cholesky_with_ridge(&self.sigma)?.lower();
        let noise = Array2::from_shape_fn((p, d), |_| draw_standard_normal(rng));
        let b = &bn + &solve_lower_transpose(&lp, &noise).dot(&ls.t());

        // Sigma | Beta: residual cross products plus the coefficient prior
        // spread, which conditions on Sigma through the matrix-normal row
        // covariance.
        let bt_xty = b.t().dot(&stats.xty);
        let sse = &stats.yty - &bt_xty - &bt_xty.t() + b.t().dot(&stats.xtx).dot(&b);
        let spread = &b - &b0t;
        let mut scale = &self.prior.sigma_scale + &sse + &(&spread.t().dot(&spread) * kappa);
        symmetrize(&mut scale);
        let df = self.prior.sigma_df + stats.nrows + p as f64;
        self.sigma = draw_inverse_wishart(rng, df, &scale)?;
        self.beta = b.t().to_owned();
        Ok(())
    }
}

/// Inverse-Wishart draw via the Bartlett decomposition of the inverse scale.
fn draw_inverse_wishart<R: Rng>(
    rng: &mut R,
    df: f64,
    scale: &Array2<f64>,
) -> Result<Array2<f64>, ImputeError> {
    let d = scale.nrows();
    if df <= d as f64 - 1.0 {
        return Err(ImputeError::NumericalFailure(format!(
            "inverse-Wishart degrees of freedom {df} too small for dimension {d}"
        )));
    }
    let scale_inv = spd_inverse(scale)?;
    let l = cholesky_with_ridge(&scale_inv)?.lower();
    let mut bartlett = Array2::<f64>::zeros((d, d));
    for i in 0..d {
        let chi = ChiSquared::new(df - i as f64).map_err(|e| {
            ImputeError::NumericalFailure(format!("invalid chi-square dof {}: {e}", df - i as f64))
        })?;
        bartlett[[i, i]] = chi.sample(rng).sqrt();
        for j in 0..i {
            bartlett[[i, j]] = draw_standard_normal(rng);
        }
    }
    let la = l.dot(&bartlett);
    let wishart = la.dot(&la.t());
    let mut sigma = spd_inverse(&wishart)?;
    symmetrize(&mut sigma);
    if sigma.iter().any(|v| !v.is_finite()) {
        return Err(ImputeError::NumericalFailure(
            "inverse-Wishart draw produced non-finite entries".to_string(),
        ));
    }
    Ok(sigma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn strong_stats(beta_t: &Array2<f64>, n: f64, noise: f64) -> RegressionSuffStats {
        // Synthetic cross products for x ~ orthonormal design, z = Bᵀx + e.
        let p = beta_t.nrows();
        let xtx = Array2::eye(p) * n;
        let xty = xtx.dot(beta_t);
        let yty = beta_t.t().dot(&xtx).dot(beta_t) + Array2::<f64>::eye(beta_t.ncols()) * (n * noise);
        RegressionSuffStats {
            xtx,
            xty,
            yty,
            nrows: n,
        }
    }

    #[test]
    fn posterior_concentrates_on_generating_coefficients() {
        let beta_t = array![[1.0, 0.5], [0.0, -1.0]]; // predictors × responses
        let stats = strong_stats(&beta_t, 500.0, 0.01);
        let mut model = CopulaRegression::new(2, 2);
        let mut rng = StdRng::seed_from_u64(1234);
        let mut mean = Array2::<f64>::zeros((2, 2));
        let draws = 100;
        for _ in 0..draws {
            model.draw_posterior(&stats, &mut rng).unwrap();
            mean += model.coefficients();
        }
        mean /= draws as f64;
        let expected = beta_t.t();
        for i in 0..2 {
            for j in 0..2 {
                assert!(
                    (mean[[i, j]] - expected[[i, j]]).abs() < 0.05,
                    "beta[{i},{j}] = {} vs {}",
                    mean[[i, j]],
                    expected[[i, j]]
                );
            }
        }
        // Residual variance should be small and positive.
        for i in 0..2 {
            assert!(model.residual_variance()[[i, i]] > 0.0);
            assert!(model.residual_variance()[[i, i]] < 0.2);
        }
    }

    #[test]
    fn observed_log_density_matches_univariate_normal() {
        let mut model = CopulaRegression::new(1, 2);
        model
            .set_coefficients(&array![[2.0], [0.0]])
            .unwrap();
        model
            .set_residual_variance(&array![[4.0, 0.0], [0.0, 1.0]])
            .unwrap();
        let x = array![1.0];
        let density = model.observed_log_density(&x, &[(0, 3.0)]).unwrap();
        // N(2, 4) at 3: -0.5*(ln 2π + ln 4 + 0.25)
        let expected = -0.5 * (LN_2PI + 4.0f64.ln() + 0.25);
        assert!((density - expected).abs() < 1e-10);
        assert_eq!(model.observed_log_density(&x, &[]).unwrap(), 0.0);
    }

    #[test]
    fn conditional_draw_tracks_correlated_cell() {
        let mut model = CopulaRegression::new(1, 2);
        model
            .set_coefficients(&array![[0.0], [0.0]])
            .unwrap();
        model
            .set_residual_variance(&array![[1.0, 0.9], [0.9, 1.0]])
            .unwrap();
        let x = array![1.0];
        let mut rng = StdRng::seed_from_u64(9);
        let mut mean = 0.0;
        let draws = 400;
        for _ in 0..draws {
            let z = model
                .conditional_draw(&x, &[(0, 2.0)], &[1], &mut rng)
                .unwrap();
            mean += z[0];
        }
        mean /= draws as f64;
        // E[z1 | z0 = 2] = 0.9 * 2 = 1.8, sd = sqrt(1 - 0.81) ≈ 0.44.
        assert!((mean - 1.8).abs() < 0.1, "conditional mean {mean}");
    }

    #[test]
    fn setters_validate_input() {
        let mut model = CopulaRegression::new(2, 2);
        assert!(model.set_coefficients(&array![[1.0, 2.0]]).is_err());
        assert!(
            model
                .set_residual_variance(&array![[1.0, 2.0], [0.0, 1.0]])
                .is_err()
        );
        assert!(
            model
                .set_residual_variance(&array![[1.0, 2.0], [2.0, 1.0]])
                .is_err()
        );
        assert!(model.set_default_prior(0.0).is_err());
        assert!(model.set_default_prior(1.0).is_ok());
    }

    #[test]
    fn inverse_wishart_mean_tracks_scale() {
        let mut rng = StdRng::seed_from_u64(77);
        let scale = array![[2.0, 0.3], [0.3, 1.0]];
        let df = 12.0;
        let mut mean = Array2::<f64>::zeros((2, 2));
        let draws = 500;
        for _ in 0..draws {
            mean += &draw_inverse_wishart(&mut rng, df, &scale).unwrap();
        }
        mean /= draws as f64;
        // E[IW(df, S)] = S / (df - d - 1) = S / 9.
        for i in 0..2 {
            for j in 0..2 {
                assert!(
                    (mean[[i, j]] - scale[[i, j]] / 9.0).abs() < 0.08,
                    "mean[{i},{j}] = {}",
                    mean[[i, j]]
                );
            }
        }
    }
}
