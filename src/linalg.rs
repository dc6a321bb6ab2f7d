//! Bridge between `ndarray` state and `faer` factorizations.
//!
//! All posterior draws run through symmetric positive-definite solves. The
//! factorization policy is LLT with an LDLT fallback for plain solves, and
//! LLT with a single ridge retry where an explicit triangular factor is
//! required (multivariate normal and Wishart draws).

use crate::error::ImputeError;
use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2};

fn to_faer(a: &Array2<f64>) -> Mat<f64> {
    Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

/// Cholesky factor of a symmetric positive-definite matrix.
pub struct CholeskyFactor {
    factor: FaerLlt<f64>,
}

impl CholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let col = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let solved = self.factor.solve(col.as_ref());
        Array1::from_iter((0..rhs.len()).map(|i| solved[(i, 0)]))
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let solved = self.factor.solve(to_faer(rhs).as_ref());
        mat_to_array(solved.as_ref())
    }

    /// The lower-triangular factor L with A = L Lᵀ.
    pub fn lower(&self) -> Array2<f64> {
        let mut out = mat_to_array(self.factor.L());
        let n = out.nrows();
        for i in 0..n {
            for j in (i + 1)..n {
                out[[i, j]] = 0.0;
            }
        }
        out
    }

    /// log |A| computed from the factor diagonal.
    pub fn log_det(&self) -> f64 {
        let l = self.factor.L();
        let mut acc = 0.0;
        for i in 0..l.nrows() {
            acc += l[(i, i)].ln();
        }
        2.0 * acc
    }
}

/// Factor a symmetric positive-definite matrix, or fail with `NumericalFailure`.
pub fn cholesky(a: &Array2<f64>) -> Result<CholeskyFactor, ImputeError> {
    let factor = to_faer(a).as_ref().llt(Side::Lower).map_err(|e| {
        ImputeError::NumericalFailure(format!("Cholesky factorization failed: {e:?}"))
    })?;
    Ok(CholeskyFactor { factor })
}

/// Factor with a single diagonal-ridge retry for marginally non-PD inputs.
///
/// Conditional covariance blocks computed by subtraction can lose definiteness
/// in the last few bits; the ridge is scaled to the mean diagonal so the retry
/// perturbs the draw below sampling noise.
pub fn cholesky_with_ridge(a: &Array2<f64>) -> Result<CholeskyFactor, ImputeError> {
    if let Ok(factor) = cholesky(a) {
        return Ok(factor);
    }
    let n = a.nrows();
    let mean_diag = (0..n).map(|i| a[[i, i]].abs()).sum::<f64>() / n.max(1) as f64;
    let ridge = 1e-8 * mean_diag.max(1e-8);
    log::warn!("[imputer] Cholesky failed; retrying with ridge {ridge:.3e}");
    let mut padded = a.clone();
    for i in 0..n {
        padded[[i, i]] += ridge;
    }
    cholesky(&padded)
}

/// Solve A X = B for symmetric A, trying LLT first and LDLT as fallback.
pub fn solve_spd(a: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>, ImputeError> {
    let lhs = to_faer(a);
    let rhs = to_faer(b);
    if let Ok(llt) = lhs.as_ref().llt(Side::Lower) {
        return Ok(mat_to_array(llt.solve(rhs.as_ref()).as_ref()));
    }
    let ldlt = FaerLdlt::new(lhs.as_ref(), Side::Lower).map_err(|e| {
        ImputeError::NumericalFailure(format!("LDLT factorization failed: {e:?}"))
    })?;
    Ok(mat_to_array(ldlt.solve(rhs.as_ref()).as_ref()))
}

/// A⁻¹ for symmetric positive-definite A.
pub fn spd_inverse(a: &Array2<f64>) -> Result<Array2<f64>, ImputeError> {
    let mut inverse = solve_spd(a, &Array2::eye(a.nrows()))?;
    symmetrize(&mut inverse);
    Ok(inverse)
}

/// Solve Lᵀ W = B by back-substitution, given the lower factor L.
///
/// Dimensions here are the predictor/response widths, so a direct loop beats
/// setting up a general factorization.
pub fn solve_lower_transpose(l: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let k = b.ncols();
    let mut out = Array2::<f64>::zeros((n, k));
    for col in 0..k {
        for i in (0..n).rev() {
            let mut acc = b[[i, col]];
            for j in (i + 1)..n {
                // Lᵀ[i, j] = L[j, i]
                acc -= l[[j, i]] * out[[j, col]];
            }
            out[[i, col]] = acc / l[[i, i]];
        }
    }
    out
}

/// Force exact symmetry after accumulated floating error.
pub fn symmetrize(a: &mut Array2<f64>) {
    let n = a.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (a[[i, j]] + a[[j, i]]);
            a[[i, j]] = avg;
            a[[j, i]] = avg;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn spd_example() -> Array2<f64> {
        array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]]
    }

    #[test]
    fn cholesky_reconstructs_input() {
        let a = spd_example();
        let l = cholesky(&a).unwrap().lower();
        let reconstructed = l.dot(&l.t());
        for i in 0..3 {
            for j in 0..3 {
                assert!((reconstructed[[i, j]] - a[[i, j]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn spd_inverse_times_input_is_identity() {
        let a = spd_example();
        let product = a.dot(&spd_inverse(&a).unwrap());
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((product[[i, j]] - expected).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn lower_transpose_solve_matches_direct() {
        let a = spd_example();
        let factor = cholesky(&a).unwrap();
        let l = factor.lower();
        let b = array![[1.0, 0.0], [2.0, -1.0], [0.5, 3.0]];
        let w = solve_lower_transpose(&l, &b);
        let recovered = l.t().dot(&w);
        for i in 0..3 {
            for j in 0..2 {
                assert!((recovered[[i, j]] - b[[i, j]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(cholesky(&a).is_err());
    }

    #[test]
    fn log_det_matches_known_value() {
        let a = array![[2.0, 0.0], [0.0, 8.0]];
        let factor = cholesky(&a).unwrap();
        assert!((factor.log_det() - 16.0_f64.ln()).abs() < 1e-12);
    }
}
