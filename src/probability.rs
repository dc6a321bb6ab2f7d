use crate::error::ImputeError;
use rand::Rng;
use rand_distr::{Distribution, Gamma, StandardNormal};

/// Standard normal PDF φ(x).
#[inline]
pub fn normal_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal CDF Φ(x) using a stable Abramowitz-Stegun-style approximation.
#[inline]
pub fn normal_cdf(x: f64) -> f64 {
    let z = x.abs().clamp(0.0, 30.0);
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let poly = (((((1.330_274_429 * t - 1.821_255_978) * t) + 1.781_477_937) * t - 0.356_563_782)
        * t
        + 0.319_381_530)
        * t;
    let cdf_pos = 1.0 - normal_pdf(z) * poly;
    if x >= 0.0 { cdf_pos } else { 1.0 - cdf_pos }
}

/// Standard normal quantile Φ⁻¹(p) using Acklam's rational approximation.
///
/// The copula transform feeds this clamped empirical CDF values, so p is
/// required to lie strictly inside (0, 1).
#[inline]
pub fn normal_quantile(p: f64) -> Result<f64, ImputeError> {
    if !(p.is_finite() && p > 0.0 && p < 1.0) {
        return Err(ImputeError::NumericalFailure(format!(
            "normal quantile requires p in (0,1), got {p}"
        )));
    }

    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;
    const P_HIGH: f64 = 1.0 - P_LOW;

    let x = if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= P_HIGH {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };
    Ok(x)
}

/// log(Σ exp(x_i)) without overflow.
#[inline]
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Draw from a Dirichlet distribution assembled from independent Gamma draws.
///
/// Entries with `alpha <= 0` are treated as structurally excluded and receive
/// exactly zero mass. At least one entry must be positive.
pub fn draw_dirichlet<R: Rng>(rng: &mut R, alpha: &[f64]) -> Result<Vec<f64>, ImputeError> {
    let mut draws = vec![0.0; alpha.len()];
    let mut total = 0.0;
    for (slot, &a) in draws.iter_mut().zip(alpha.iter()) {
        if a <= 0.0 {
            continue;
        }
        let gamma = Gamma::new(a, 1.0).map_err(|e| {
            ImputeError::NumericalFailure(format!("invalid Dirichlet count {a}: {e}"))
        })?;
        let g: f64 = gamma.sample(rng);
        *slot = g;
        total += g;
    }
    if !(total.is_finite() && total > 0.0) {
        return Err(ImputeError::NumericalFailure(format!(
            "Dirichlet draw degenerate: counts {alpha:?}"
        )));
    }
    for slot in &mut draws {
        *slot /= total;
    }
    Ok(draws)
}

/// Draw a category index from unnormalized log probabilities.
pub fn draw_categorical_from_log<R: Rng>(
    rng: &mut R,
    log_probs: &[f64],
) -> Result<usize, ImputeError> {
    let norm = log_sum_exp(log_probs);
    if !norm.is_finite() {
        return Err(ImputeError::NumericalFailure(format!(
            "categorical draw from degenerate log weights {log_probs:?}"
        )));
    }
    let u: f64 = rng.random();
    let mut cumulative = 0.0;
    for (index, &lp) in log_probs.iter().enumerate() {
        cumulative += (lp - norm).exp();
        if u < cumulative {
            return Ok(index);
        }
    }
    Ok(log_probs.len() - 1)
}

/// Draw a category index from non-negative (not necessarily normalized) weights.
pub fn draw_categorical<R: Rng>(rng: &mut R, probs: &[f64]) -> Result<usize, ImputeError> {
    let total: f64 = probs.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(ImputeError::NumericalFailure(format!(
            "categorical draw from degenerate weights {probs:?}"
        )));
    }
    let u: f64 = rng.random::<f64>() * total;
    let mut cumulative = 0.0;
    for (index, &p) in probs.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return Ok(index);
        }
    }
    Ok(probs.len() - 1)
}

/// One standard normal draw.
#[inline]
pub fn draw_standard_normal<R: Rng>(rng: &mut R) -> f64 {
    rng.sample(StandardNormal)
}
