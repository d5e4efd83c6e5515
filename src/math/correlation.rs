//! Correlation-matrix validation, repair and low-rank factorization.
//!
//! References:
//! - Higham, N. (2002), *Computing the nearest correlation matrix*.
//! - Andersen, Sidenius and Basu (2003), *All your hedges in one basket*, section 3
//!   on least-squares factor reduction of name correlation matrices.
//!
//! The factorizer turns an `N x N` correlation matrix into `N x K` loadings `F` with
//! row norms `<= 1`; the implied correlation is `F F^T` off the diagonal and one on it.
//! With `K = N` the (PSD-tolerant) Cholesky factor reproduces the input exactly; with
//! `K < N` the truncated Cholesky factor seeds a row-norm-constrained least-squares fit.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use tracing::debug;

use crate::core::CreditError;
use crate::math::least_squares::{LmOptions, TerminationReason, projected_levenberg_marquardt};

/// Configuration for nearest-PSD / nearest-correlation projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsdProjectionConfig {
    /// Convergence tolerance in Frobenius norm.
    pub tol: f64,
    /// Maximum number of Higham alternating-projection iterations.
    pub max_iterations: usize,
}

impl Default for PsdProjectionConfig {
    fn default() -> Self {
        Self {
            tol: 1.0e-10,
            max_iterations: 100,
        }
    }
}

/// Output of [`factorize_correlation`].
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationFactorization {
    /// `N x K` loadings, each row with L2 norm `<= 1`.
    pub loadings: Vec<Vec<f64>>,
    /// Sum of squared off-diagonal errors of the truncated, renormalized Cholesky factor.
    pub truncated_error: f64,
    /// Sum of squared off-diagonal errors of the returned loadings.
    pub error: f64,
    /// Least-squares iterations used (zero for the full-rank case).
    pub iterations: usize,
    /// Whether the input needed a nearest-correlation repair before factorization.
    pub repaired: bool,
}

/// Validates that `corr_matrix` is a finite, symmetric `n_assets x n_assets`
/// correlation matrix with unit diagonal and entries in `[-1, 1]`.
pub fn validate_correlation_matrix(
    corr_matrix: &[Vec<f64>],
    n_assets: usize,
) -> Result<(), String> {
    if corr_matrix.len() != n_assets || corr_matrix.iter().any(|row| row.len() != n_assets) {
        return Err("correlation matrix dimensions must match asset count".to_string());
    }

    for (i, row_i) in corr_matrix.iter().enumerate().take(n_assets) {
        let di = row_i[i];
        if !di.is_finite() || (di - 1.0).abs() > 1.0e-8 {
            return Err("correlation matrix diagonal must be 1".to_string());
        }
        for (j, rho) in row_i.iter().copied().enumerate().take(n_assets) {
            if !rho.is_finite() || !(-1.0 - 1.0e-10..=1.0 + 1.0e-10).contains(&rho) {
                return Err("correlation entries must be finite and in [-1, 1]".to_string());
            }
            if (rho - corr_matrix[j][i]).abs() > 1.0e-8 {
                return Err("correlation matrix must be symmetric".to_string());
            }
        }
    }

    Ok(())
}

/// Returns the minimum eigenvalue of a symmetric matrix.
pub fn min_eigenvalue_symmetric(matrix: &[Vec<f64>]) -> Option<f64> {
    let n = matrix.len();
    if n == 0 || matrix.iter().any(|row| row.len() != n) {
        return None;
    }

    let m = to_dmatrix(matrix);
    let eig = SymmetricEigen::new(m);
    eig.eigenvalues.iter().copied().reduce(f64::min)
}

/// Returns `true` if matrix is positive semidefinite within tolerance `tol`.
pub fn is_positive_semidefinite(matrix: &[Vec<f64>], tol: f64) -> bool {
    min_eigenvalue_symmetric(matrix).is_some_and(|lmin| lmin >= -tol)
}

/// Computes a nearest correlation matrix using Higham (2002) alternating projections.
pub fn nearest_correlation_matrix_higham(
    matrix: &[Vec<f64>],
    cfg: PsdProjectionConfig,
) -> Result<Vec<Vec<f64>>, String> {
    let n = matrix.len();
    if n == 0 || matrix.iter().any(|row| row.len() != n) {
        return Err("matrix must be square and non-empty".to_string());
    }

    let mut y = symmetrize(&to_dmatrix(matrix));
    for i in 0..n {
        y[(i, i)] = 1.0;
    }

    let mut delta_s = DMatrix::<f64>::zeros(n, n);

    for _ in 0..cfg.max_iterations {
        let r = symmetrize(&(y.clone() - delta_s.clone()));
        let x = project_psd(&r);
        delta_s = x.clone() - r;

        let mut y_next = x;
        for i in 0..n {
            y_next[(i, i)] = 1.0;
        }
        y_next = symmetrize(&y_next);

        let diff = frobenius_norm(&(y_next.clone() - y.clone()));
        y = y_next;
        if diff < cfg.tol {
            break;
        }
    }

    y = project_psd(&symmetrize(&y));
    let mut out = from_dmatrix(&y);
    // Rescale to unit diagonal, which keeps the matrix PSD.
    let diag = (0..n).map(|i| out[i][i].max(1.0e-300).sqrt()).collect::<Vec<_>>();
    for i in 0..n {
        for j in 0..n {
            out[i][j] = if i == j {
                1.0
            } else {
                (out[i][j] / (diag[i] * diag[j])).clamp(-1.0, 1.0)
            };
        }
    }

    Ok(out)
}

/// Cholesky decomposition for symmetric positive semidefinite matrices.
///
/// Returns lower-triangular `L` such that `L L^T ~= matrix`.
pub fn cholesky_lower_psd(matrix: &[Vec<f64>], tol: f64) -> Option<Vec<Vec<f64>>> {
    let n = matrix.len();
    if n == 0 || matrix.iter().any(|row| row.len() != n) {
        return None;
    }

    let mut l = vec![vec![0.0_f64; n]; n];

    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[i][j];
            for (&lik, &ljk) in l[i].iter().zip(l[j].iter()).take(j) {
                sum -= lik * ljk;
            }

            if i == j {
                if sum < -tol {
                    return None;
                }
                l[i][j] = sum.max(0.0).sqrt();
            } else if l[j][j] > tol {
                l[i][j] = sum / l[j][j];
            }
        }
    }

    Some(l)
}

/// Correlation implied by loadings: `F F^T` off the diagonal, one on the diagonal.
pub fn implied_correlation(loadings: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = loadings.len();
    let mut corr = vec![vec![0.0; n]; n];
    for i in 0..n {
        corr[i][i] = 1.0;
        for j in (i + 1)..n {
            let rho = dot(&loadings[i], &loadings[j]).clamp(-1.0, 1.0);
            corr[i][j] = rho;
            corr[j][i] = rho;
        }
    }
    corr
}

/// Sum of squared errors between implied and target correlations over all `i != j`.
pub fn correlation_sum_square_error(loadings: &[Vec<f64>], target: &[Vec<f64>]) -> f64 {
    let n = loadings.len();
    let mut sse = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let e = dot(&loadings[i], &loadings[j]) - target[i][j];
            sse += 2.0 * e * e;
        }
    }
    sse
}

/// Factorizes a correlation matrix into `n_factors` systemic loadings per name.
pub fn factorize_correlation(
    matrix: &[Vec<f64>],
    n_factors: usize,
    options: LmOptions,
) -> Result<CorrelationFactorization, CreditError> {
    let n = matrix.len();
    if n == 0 || matrix.iter().any(|row| row.len() != n) {
        return Err(CreditError::dimension(format!(
            "correlation matrix must be square and non-empty, got {} rows",
            n
        )));
    }
    if n_factors == 0 || n_factors > n {
        return Err(CreditError::dimension(format!(
            "factor count must be in [1, {n}], got {n_factors}"
        )));
    }
    validate_correlation_matrix(matrix, n).map_err(CreditError::InvalidInput)?;

    let (target, repaired) = match cholesky_lower_psd(matrix, 1.0e-10) {
        Some(_) => (matrix.to_vec(), false),
        None => {
            let fixed = nearest_correlation_matrix_higham(matrix, PsdProjectionConfig::default())
                .map_err(CreditError::NumericalError)?;
            (fixed, true)
        }
    };
    let chol = cholesky_lower_psd(&target, 1.0e-10).ok_or_else(|| {
        CreditError::NumericalError("cholesky failed after nearest-correlation repair".to_string())
    })?;

    let mut full = chol;
    for row in &mut full {
        normalize_row(row);
    }

    if n_factors == n {
        let error = correlation_sum_square_error(&full, &target);
        return Ok(CorrelationFactorization {
            loadings: full,
            truncated_error: error,
            error,
            iterations: 0,
            repaired,
        });
    }

    let mut truncated = full
        .iter()
        .map(|row| row[..n_factors].to_vec())
        .collect::<Vec<_>>();
    for row in &mut truncated {
        normalize_row(row);
    }
    let truncated_error = correlation_sum_square_error(&truncated, &target);

    let k = n_factors;
    let pairs = (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .collect::<Vec<_>>();
    let initial = truncated.iter().flatten().copied().collect::<Vec<_>>();

    let residual_fn = |x: &[f64]| {
        pairs
            .iter()
            .map(|&(i, j)| {
                let bi = &x[i * k..(i + 1) * k];
                let bj = &x[j * k..(j + 1) * k];
                dot(bi, bj) - target[i][j]
            })
            .collect::<Vec<_>>()
    };
    let jacobian_fn = |x: &[f64]| {
        let mut jac = DMatrix::<f64>::zeros(pairs.len(), n * k);
        for (r, &(i, j)) in pairs.iter().enumerate() {
            for c in 0..k {
                jac[(r, i * k + c)] = x[j * k + c];
                jac[(r, j * k + c)] = x[i * k + c];
            }
        }
        jac
    };
    let project = |x: &mut [f64]| {
        for row in x.chunks_mut(k) {
            let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 1.0 {
                for v in row.iter_mut() {
                    *v /= norm;
                }
            }
        }
    };

    let fit = projected_levenberg_marquardt(&initial, options, residual_fn, jacobian_fn, project)?;
    if matches!(fit.reason, TerminationReason::NumericalFailure) {
        return Err(CreditError::NumericalError(
            "least-squares correlation refinement produced non-finite gradients".to_string(),
        ));
    }

    let refined = fit
        .x
        .chunks(k)
        .map(|row| row.to_vec())
        .collect::<Vec<_>>();
    let refined_error = correlation_sum_square_error(&refined, &target);

    debug!(
        names = n,
        factors = k,
        truncated_error,
        refined_error,
        iterations = fit.iterations,
        reason = ?fit.reason,
        "refined truncated correlation factorization"
    );

    // Only improving steps are accepted, but keep the truncation if the fit stalled at it.
    let (loadings, error) = if refined_error <= truncated_error {
        (refined, refined_error)
    } else {
        (truncated, truncated_error)
    };

    Ok(CorrelationFactorization {
        loadings,
        truncated_error,
        error,
        iterations: fit.iterations,
        repaired,
    })
}

fn normalize_row(row: &mut [f64]) {
    let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 1.0e-300 {
        for v in row.iter_mut() {
            *v /= norm;
        }
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn to_dmatrix(matrix: &[Vec<f64>]) -> DMatrix<f64> {
    let n = matrix.len();
    let data = matrix
        .iter()
        .flat_map(|row| row.iter().copied())
        .collect::<Vec<_>>();
    DMatrix::from_row_slice(n, n, &data)
}

fn from_dmatrix(matrix: &DMatrix<f64>) -> Vec<Vec<f64>> {
    let n = matrix.nrows();
    let mut out = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            out[i][j] = matrix[(i, j)];
        }
    }
    out
}

fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

fn project_psd(m: &DMatrix<f64>) -> DMatrix<f64> {
    let eig = SymmetricEigen::new(symmetrize(m));
    let vals = eig
        .eigenvalues
        .iter()
        .map(|v| (*v).max(0.0))
        .collect::<Vec<_>>();
    let d = DMatrix::from_diagonal(&DVector::from_vec(vals));
    symmetrize(&(eig.eigenvectors.clone() * d * eig.eigenvectors.transpose()))
}

fn frobenius_norm(m: &DMatrix<f64>) -> f64 {
    m.iter().map(|x| x * x).sum::<f64>().sqrt()
}
