//! Quadrature over the systemic factors.
//!
//! Gaussian factors use a tensor product of probabilists' Gauss-Hermite rules. A Student-t
//! common factor uses Gauss-Legendre in probability space mapped through the (unit
//! variance) t quantile, which keeps the heavy tails inside the node set.
//!
//! [`FactorQuadrature::integrate`] evaluates a vector-valued integrand at every node and
//! returns the weighted sum. With the `parallel` feature, nodes are split into fixed-size
//! chunks that run on the rayon pool; chunk partial sums are added back in chunk order, so
//! the result is bit-identical to a serial run.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{CreditError, Result};
use crate::math::{gauss_hermite_nodes_weights, gauss_legendre_nodes_weights};

use super::copula::CopulaEngine;

/// Largest tensor grid accepted for multi-factor integration.
pub const MAX_TENSOR_NODES: usize = 1 << 18;
const CHUNK_NODES: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct FactorQuadrature {
    n_factors: usize,
    /// Row-major `n_nodes x n_factors`.
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl FactorQuadrature {
    /// Tensor Gauss-Hermite grid with `order` points per factor.
    pub fn gaussian(n_factors: usize, order: usize) -> Result<Self> {
        if n_factors == 0 || order == 0 {
            return Err(CreditError::invalid(
                "factor quadrature needs at least one factor and one node",
            ));
        }
        let total = (0..n_factors).try_fold(1_usize, |acc, _| {
            acc.checked_mul(order).filter(|&n| n <= MAX_TENSOR_NODES)
        });
        let Some(total) = total else {
            return Err(CreditError::unsupported(format!(
                "{order}^{n_factors} tensor nodes exceed the limit of {MAX_TENSOR_NODES}"
            )));
        };

        let (x, w) = gauss_hermite_nodes_weights(order)?;
        let mut nodes = Vec::with_capacity(total * n_factors);
        let mut weights = Vec::with_capacity(total);
        let mut idx = vec![0_usize; n_factors];
        for _ in 0..total {
            nodes.extend(idx.iter().map(|&i| x[i]));
            weights.push(idx.iter().map(|&i| w[i]).product());
            for digit in idx.iter_mut().rev() {
                *digit += 1;
                if *digit < order {
                    break;
                }
                *digit = 0;
            }
        }

        Ok(Self {
            n_factors,
            nodes,
            weights,
        })
    }

    /// Gauss-Legendre rule in probability space for a single common factor.
    pub fn probability_space<Q>(order: usize, quantile: Q) -> Result<Self>
    where
        Q: Fn(f64) -> f64,
    {
        let (x, w) = gauss_legendre_nodes_weights(order)?;
        Ok(Self {
            n_factors: 1,
            nodes: x.iter().map(|&xi| quantile(0.5 * (xi + 1.0))).collect(),
            weights: w.iter().map(|&wi| 0.5 * wi).collect(),
        })
    }

    /// Rule matching the factor law of `engine`.
    pub fn for_copula(engine: &CopulaEngine, n_factors: usize, order: usize) -> Result<Self> {
        if engine.is_gaussian() {
            return Self::gaussian(n_factors, order);
        }
        if n_factors != 1 {
            return Err(CreditError::unsupported(format!(
                "Student-t copula supports one systemic factor, got {n_factors}"
            )));
        }
        Self::probability_space(order, |p| engine.factor_quantile(p))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn n_factors(&self) -> usize {
        self.n_factors
    }

    #[inline]
    pub fn node(&self, j: usize) -> &[f64] {
        &self.nodes[j * self.n_factors..(j + 1) * self.n_factors]
    }

    pub fn weight(&self, j: usize) -> f64 {
        self.weights[j]
    }

    /// `sum_j w_j f(m_j)` for an integrand writing `len` values into its output slice.
    ///
    /// `f` receives the node, a zeroed output buffer, and a scratch state created by `init`
    /// once per chunk.
    pub fn integrate<S, I, F>(&self, len: usize, init: I, f: F) -> Result<Vec<f64>>
    where
        I: Fn() -> S + Sync,
        F: Fn(&[f64], &mut [f64], &mut S) -> Result<()> + Sync,
    {
        let n = self.len();
        let n_chunks = n.div_ceil(CHUNK_NODES);
        let chunk = |c: usize| -> Result<Vec<f64>> {
            let mut state = init();
            let mut acc = vec![0.0; len];
            let mut out = vec![0.0; len];
            for j in (c * CHUNK_NODES)..((c + 1) * CHUNK_NODES).min(n) {
                out.iter_mut().for_each(|v| *v = 0.0);
                f(self.node(j), &mut out, &mut state)?;
                let w = self.weights[j];
                for (a, v) in acc.iter_mut().zip(&out) {
                    *a += w * v;
                }
            }
            Ok(acc)
        };

        #[cfg(feature = "parallel")]
        let partials = (0..n_chunks)
            .into_par_iter()
            .map(chunk)
            .collect::<Result<Vec<_>>>()?;
        #[cfg(not(feature = "parallel"))]
        let partials = (0..n_chunks).map(chunk).collect::<Result<Vec<_>>>()?;

        let mut total = vec![0.0; len];
        for part in &partials {
            for (t, v) in total.iter_mut().zip(part) {
                *t += v;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::credit::copula::Copula;

    #[test]
    fn tensor_grid_integrates_cross_moments() {
        let q = FactorQuadrature::gaussian(2, 8).unwrap();
        assert_eq!(q.len(), 64);
        let m = q
            .integrate(
                3,
                || (),
                |x, out, _| {
                    out[0] = 1.0;
                    out[1] = x[0] * x[0] * x[1] * x[1];
                    out[2] = x[0] * x[1];
                    Ok(())
                },
            )
            .unwrap();
        assert_relative_eq!(m[0], 1.0, epsilon = 1e-13);
        assert_relative_eq!(m[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(m[2], 0.0, epsilon = 1e-13);
    }

    #[test]
    fn oversized_tensor_grids_are_rejected() {
        assert!(matches!(
            FactorQuadrature::gaussian(6, 64),
            Err(CreditError::Unsupported(_))
        ));
    }

    #[test]
    fn student_t_rule_has_unit_variance() {
        let engine = CopulaEngine::new(Copula::StudentT {
            common_dof: 8.0,
            idiosyncratic_dof: 8.0,
        })
        .unwrap();
        let q = FactorQuadrature::for_copula(&engine, 1, 200).unwrap();
        let var = q
            .integrate(1, || (), |x, out, _| {
                out[0] = x[0] * x[0];
                Ok(())
            })
            .unwrap()[0];
        assert!((var - 1.0).abs() < 2e-2, "var = {var}");
        assert!(FactorQuadrature::for_copula(&engine, 2, 16).is_err());
    }

    #[test]
    fn errors_from_the_integrand_propagate() {
        let q = FactorQuadrature::gaussian(1, 5).unwrap();
        let res = q.integrate(1, || (), |_, _, _| Err(CreditError::invalid("boom")));
        assert!(res.is_err());
    }
}
