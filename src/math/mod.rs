//! Numerical kernels: normal distribution, Gauss quadrature rules and root bracketing.

use std::f64::consts::PI;

use nalgebra::{DMatrix, SymmetricEigen};
use statrs::function::erf::erfc;

use crate::core::CreditError;

pub mod correlation;
pub mod fast_rng;
pub mod least_squares;

#[derive(Debug, Clone, PartialEq)]
pub enum MathError {
    NonConvergence,
    InvalidInput(&'static str),
}

impl From<MathError> for CreditError {
    fn from(err: MathError) -> Self {
        match err {
            MathError::NonConvergence => {
                CreditError::ConvergenceFailure("root search did not converge".to_string())
            }
            MathError::InvalidInput(msg) => CreditError::InvalidInput(msg.to_string()),
        }
    }
}

/// Standard normal CDF through `statrs` `erfc`.
///
/// Relative error is of order `1e-11` in the tails (about `4e-11` at `x = -3`), short of
/// machine precision.
pub fn normal_cdf(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Inverse standard normal CDF.
///
/// Acklam's rational approximation followed by one Halley step against [`normal_cdf`],
/// which brings the relative error down to ~1e-15. Returns `-inf`/`+inf` at 0/1.
pub fn normal_inv_cdf(p: f64) -> f64 {
    if p.is_nan() || !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
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
    const P_LOW: f64 = 0.024_25;
    const P_HIGH: f64 = 1.0 - P_LOW;

    let x = if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        C[0].mul_add(q, C[1]).mul_add(q, C[2]).mul_add(q, C[3]).mul_add(q, C[4]).mul_add(q, C[5])
            / D[0].mul_add(q, D[1]).mul_add(q, D[2]).mul_add(q, D[3]).mul_add(q, 1.0)
    } else if p <= P_HIGH {
        let q = p - 0.5;
        let r = q * q;
        A[0].mul_add(r, A[1]).mul_add(r, A[2]).mul_add(r, A[3]).mul_add(r, A[4]).mul_add(r, A[5]) * q
            / B[0].mul_add(r, B[1]).mul_add(r, B[2]).mul_add(r, B[3]).mul_add(r, B[4]).mul_add(r, 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -C[0].mul_add(q, C[1]).mul_add(q, C[2]).mul_add(q, C[3]).mul_add(q, C[4]).mul_add(q, C[5])
            / D[0].mul_add(q, D[1]).mul_add(q, D[2]).mul_add(q, D[3]).mul_add(q, 1.0)
    };

    // Halley refinement; the upper tail is refined on the complementary probability.
    let (err, sign) = if p > 0.5 {
        (normal_cdf(-x) - (1.0 - p), -1.0)
    } else {
        (normal_cdf(x) - p, 1.0)
    };
    let u = sign * err * (2.0 * PI).sqrt() * (0.5 * x * x).exp();
    let refined = x - u / (1.0 + 0.5 * x * u);
    if refined.is_finite() { refined } else { x }
}

fn legendre_polynomial_and_derivative(n: usize, x: f64) -> (f64, f64) {
    if n == 0 {
        return (1.0, 0.0);
    }
    if n == 1 {
        return (x, 1.0);
    }

    let mut p_nm2 = 1.0;
    let mut p_nm1 = x;
    for k in 2..=n {
        let kf = k as f64;
        let p_n = ((2.0 * kf - 1.0) * x * p_nm1 - (kf - 1.0) * p_nm2) / kf;
        p_nm2 = p_nm1;
        p_nm1 = p_n;
    }

    let p_n = p_nm1;
    let p_n_minus_1 = p_nm2;
    let dp_n = (n as f64) * (x * p_n - p_n_minus_1) / (x * x - 1.0);
    (p_n, dp_n)
}

/// Gauss-Legendre nodes and weights on `[-1, 1]`.
pub fn gauss_legendre_nodes_weights(n: usize) -> Result<(Vec<f64>, Vec<f64>), MathError> {
    if n == 0 {
        return Err(MathError::InvalidInput("n must be > 0"));
    }

    let mut nodes = vec![0.0_f64; n];
    let mut weights = vec![0.0_f64; n];
    let m = n.div_ceil(2);

    for i in 0..m {
        let i1 = i as f64 + 1.0;
        let nn = n as f64;
        let mut z = (PI * (i1 - 0.25) / (nn + 0.5)).cos();

        for _ in 0..80 {
            let (p, dp) = legendre_polynomial_and_derivative(n, z);
            let dz = -p / dp;
            z += dz;
            if dz.abs() < 1e-15 {
                break;
            }
        }

        let (_, dp) = legendre_polynomial_and_derivative(n, z);
        let w = 2.0 / ((1.0 - z * z) * dp * dp);

        nodes[i] = -z;
        nodes[n - 1 - i] = z;
        weights[i] = w;
        weights[n - 1 - i] = w;
    }

    Ok((nodes, weights))
}

/// Gauss-Hermite rule for the standard normal density (probabilists' weight `phi(x)`).
///
/// Nodes are the eigenvalues of the Jacobi matrix of the He_n recurrence
/// (Golub-Welsch); weights are the squared first eigenvector components and sum to one.
/// Nodes are returned in ascending order.
pub fn gauss_hermite_nodes_weights(n: usize) -> Result<(Vec<f64>, Vec<f64>), MathError> {
    if n == 0 {
        return Err(MathError::InvalidInput("n must be > 0"));
    }
    if n == 1 {
        return Ok((vec![0.0], vec![1.0]));
    }

    let mut jacobi = DMatrix::<f64>::zeros(n, n);
    for k in 1..n {
        let off = (k as f64).sqrt();
        jacobi[(k - 1, k)] = off;
        jacobi[(k, k - 1)] = off;
    }

    let eig = SymmetricEigen::new(jacobi);
    let mut pairs = (0..n)
        .map(|i| {
            let v0 = eig.eigenvectors[(0, i)];
            (eig.eigenvalues[i], v0 * v0)
        })
        .collect::<Vec<_>>();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Enforce the exact symmetry of the rule; eigen-solver noise is ~1e-15.
    for i in 0..n / 2 {
        let j = n - 1 - i;
        let x = 0.5 * (pairs[j].0 - pairs[i].0);
        let w = 0.5 * (pairs[i].1 + pairs[j].1);
        pairs[i] = (-x, w);
        pairs[j] = (x, w);
    }
    if n % 2 == 1 {
        pairs[n / 2].0 = 0.0;
    }

    let total = pairs.iter().map(|p| p.1).sum::<f64>();
    let nodes = pairs.iter().map(|p| p.0).collect();
    let weights = pairs.iter().map(|p| p.1 / total).collect();
    Ok((nodes, weights))
}

/// Bisection on a monotone function for `f(x) = target` inside `[lo, hi]`.
///
/// `f` may be increasing or decreasing; the bracket must straddle the target.
pub fn bisect_monotone<F>(
    f: F,
    target: f64,
    mut lo: f64,
    mut hi: f64,
    tol: f64,
    max_iter: usize,
) -> Result<f64, MathError>
where
    F: Fn(f64) -> f64,
{
    if !(lo < hi) || tol <= 0.0 {
        return Err(MathError::InvalidInput("bisection needs lo < hi and tol > 0"));
    }
    let f_lo = f(lo) - target;
    let f_hi = f(hi) - target;
    if f_lo == 0.0 {
        return Ok(lo);
    }
    if f_hi == 0.0 {
        return Ok(hi);
    }
    if f_lo.signum() == f_hi.signum() {
        return Err(MathError::InvalidInput("bisection bracket does not straddle target"));
    }

    let increasing = f_hi > f_lo;
    for _ in 0..max_iter {
        let mid = 0.5 * (lo + hi);
        let f_mid = f(mid) - target;
        if f_mid == 0.0 || (hi - lo) < tol {
            return Ok(mid);
        }
        if (f_mid < 0.0) == increasing {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Err(MathError::NonConvergence)
}
