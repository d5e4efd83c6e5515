//! Correlation inputs and their canonical factor-loading form.
//!
//! Every correlation input is normalized at the basket boundary into [`FactorLoadings`]:
//! one row of `K` systemic loadings per name, with row norm at most one. The name's
//! idiosyncratic weight `sqrt(1 - |row|^2)` completes the row to unit length, so the
//! latent variable `X_i = b_i . M + w_i * eps_i` always has unit variance.

use serde::{Deserialize, Serialize};

use crate::core::{CreditError, Result};
use crate::math::correlation::factorize_correlation;
use crate::math::least_squares::LmOptions;

const ROW_NORM_TOL: f64 = 1.0e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CorrelationSpec {
    /// Uniform pairwise correlation through one factor with loading `sqrt(rho)`.
    Flat(f64),
    /// `K x N` loading matrix: one row per factor, one column per name.
    Factors(Vec<Vec<f64>>),
    /// Full `N x N` correlation matrix reduced to `factors` systemic factors.
    Full { matrix: Vec<Vec<f64>>, factors: usize },
}

impl Default for CorrelationSpec {
    fn default() -> Self {
        Self::Flat(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactorLoadings {
    n_factors: usize,
    /// Row-major `N x K`.
    data: Vec<f64>,
}

impl FactorLoadings {
    /// Builds loadings from per-name rows.
    pub fn new(rows: Vec<Vec<f64>>) -> Result<Self> {
        let n_factors = rows.first().map_or(1, Vec::len);
        if n_factors == 0 {
            return Err(CreditError::dimension("loading rows must have at least one factor"));
        }
        let mut data = Vec::with_capacity(rows.len() * n_factors);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_factors {
                return Err(CreditError::dimension(format!(
                    "loading row {i} has {} factors, expected {n_factors}",
                    row.len()
                )));
            }
            if row.iter().any(|b| !b.is_finite()) {
                return Err(CreditError::invalid(format!("loading row {i} is not finite")));
            }
            let norm_sq = row.iter().map(|b| b * b).sum::<f64>();
            if norm_sq > 1.0 + ROW_NORM_TOL {
                return Err(CreditError::invalid(format!(
                    "loading row {i} has norm {} > 1",
                    norm_sq.sqrt()
                )));
            }
            let scale = if norm_sq > 1.0 { norm_sq.sqrt().recip() } else { 1.0 };
            data.extend(row.iter().map(|b| b * scale));
        }
        Ok(Self { n_factors, data })
    }

    /// Single-factor loadings `sqrt(rho)` for `n` names.
    pub fn flat(n: usize, rho: f64) -> Result<Self> {
        if !rho.is_finite() || !(0.0..=1.0).contains(&rho) {
            return Err(CreditError::invalid(format!(
                "flat correlation must be in [0, 1], got {rho}"
            )));
        }
        Ok(Self {
            n_factors: 1,
            data: vec![rho.sqrt(); n],
        })
    }

    /// Normalizes a correlation input for `n_names` names.
    pub fn from_spec(spec: &CorrelationSpec, n_names: usize) -> Result<Self> {
        match spec {
            CorrelationSpec::Flat(rho) => Self::flat(n_names, *rho),
            CorrelationSpec::Factors(matrix) => {
                if matrix.is_empty() {
                    return Err(CreditError::dimension("factor matrix has no rows"));
                }
                if let Some(row) = matrix.iter().find(|row| row.len() != n_names) {
                    return Err(CreditError::dimension(format!(
                        "factor matrix rows must have {n_names} columns, got {}",
                        row.len()
                    )));
                }
                let rows = (0..n_names)
                    .map(|i| matrix.iter().map(|factor| factor[i]).collect())
                    .collect();
                Self::new(rows)
            }
            CorrelationSpec::Full { matrix, factors } => {
                if matrix.len() != n_names {
                    return Err(CreditError::dimension(format!(
                        "correlation matrix is {0}x{0}, basket has {n_names} names",
                        matrix.len()
                    )));
                }
                let fact = factorize_correlation(matrix, *factors, LmOptions::default())?;
                Self::new(fact.loadings)
            }
        }
    }

    pub fn n_names(&self) -> usize {
        self.data.len() / self.n_factors
    }

    pub fn n_factors(&self) -> usize {
        self.n_factors
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_factors..(i + 1) * self.n_factors]
    }

    #[inline]
    pub fn idiosyncratic_weight(&self, i: usize) -> f64 {
        idiosyncratic_weight(self.row(i))
    }

    /// Pairwise correlation implied between names `i` and `j`.
    pub fn correlation(&self, i: usize, j: usize) -> f64 {
        if i == j {
            return 1.0;
        }
        self.row(i).iter().zip(self.row(j)).map(|(a, b)| a * b).sum()
    }

    /// Whether every name carries the same loading row.
    pub fn is_uniform(&self) -> bool {
        let n = self.n_names();
        (1..n).all(|i| {
            self.row(i)
                .iter()
                .zip(self.row(0))
                .all(|(a, b)| (a - b).abs() <= 1.0e-15)
        })
    }

    /// Multiplies every loading by `scale`; fails if a row would exceed unit norm.
    pub fn scaled(&self, scale: f64) -> Result<Self> {
        if !scale.is_finite() {
            return Err(CreditError::invalid("factor scale must be finite"));
        }
        let rows = (0..self.n_names())
            .map(|i| self.row(i).iter().map(|b| b * scale).collect())
            .collect();
        Self::new(rows)
    }

    /// Loadings of the names at `indices`, in that order.
    pub(crate) fn select(&self, indices: &[usize]) -> Self {
        let data = indices
            .iter()
            .flat_map(|&i| self.row(i).iter().copied())
            .collect();
        Self {
            n_factors: self.n_factors,
            data,
        }
    }
}

#[inline]
pub fn idiosyncratic_weight(loadings: &[f64]) -> f64 {
    (1.0 - loadings.iter().map(|b| b * b).sum::<f64>()).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn flat_spec_gives_sqrt_rho_loadings() {
        let f = FactorLoadings::from_spec(&CorrelationSpec::Flat(0.3), 4).unwrap();
        assert_eq!(f.n_names(), 4);
        assert_eq!(f.n_factors(), 1);
        assert_relative_eq!(f.correlation(0, 3), 0.3, epsilon = 1e-15);
        assert_relative_eq!(f.idiosyncratic_weight(2), 0.7_f64.sqrt(), epsilon = 1e-15);
        assert!(f.is_uniform());
    }

    #[test]
    fn factor_matrix_is_transposed_to_name_rows() {
        let spec = CorrelationSpec::Factors(vec![vec![0.5, 0.4, 0.0], vec![0.1, 0.0, 0.6]]);
        let f = FactorLoadings::from_spec(&spec, 3).unwrap();
        assert_eq!(f.row(0), &[0.5, 0.1]);
        assert_eq!(f.row(2), &[0.0, 0.6]);
        assert_relative_eq!(f.correlation(0, 2), 0.06, epsilon = 1e-15);
    }

    #[test]
    fn dimension_and_norm_errors_fail_fast() {
        let spec = CorrelationSpec::Factors(vec![vec![0.5, 0.4]]);
        assert!(matches!(
            FactorLoadings::from_spec(&spec, 3),
            Err(CreditError::DimensionMismatch(_))
        ));

        let too_big = CorrelationSpec::Factors(vec![vec![0.9], vec![0.9]]);
        assert!(matches!(
            FactorLoadings::from_spec(&too_big, 1),
            Err(CreditError::InvalidInput(_))
        ));

        let full = CorrelationSpec::Full {
            matrix: vec![vec![1.0, 0.2], vec![0.2, 1.0]],
            factors: 1,
        };
        assert!(matches!(
            FactorLoadings::from_spec(&full, 3),
            Err(CreditError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn scaling_sweeps_correlation_and_rejects_overflow() {
        let f = FactorLoadings::flat(3, 0.25).unwrap();
        let g = f.scaled(1.2).unwrap();
        assert_relative_eq!(g.correlation(0, 1), 0.36, epsilon = 1e-14);
        assert!(f.scaled(2.5).is_err());
    }

    #[test]
    fn full_matrix_is_factorized() {
        let full = CorrelationSpec::Full {
            matrix: vec![
                vec![1.0, 0.3, 0.3],
                vec![0.3, 1.0, 0.3],
                vec![0.3, 0.3, 1.0],
            ],
            factors: 3,
        };
        let f = FactorLoadings::from_spec(&full, 3).unwrap();
        assert_relative_eq!(f.correlation(1, 2), 0.3, epsilon = 1e-12);
    }
}
