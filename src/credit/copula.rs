//! Factor copulas: default thresholds, conditional default probabilities and sampling.
//!
//! Name `i` defaults by `t` when its latent variable `X_i = b_i . M + w_i * eps_i` falls
//! below the threshold `c_i(t)` with `P(X_i <= c_i(t)) = 1 - S_i(t)`. Conditional on the
//! systemic factors `M = m`, names are independent and
//! `P(default by t | m) = F_eps((c_i(t) - b_i . m) / w_i)`.
//!
//! - Gaussian: `M` and `eps` standard normal, so `X_i ~ N(0, 1)` and `c = Phi^-1(1 - S)`.
//! - Double-t (Hull and White, 2004): one common factor and the idiosyncratic terms are
//!   unit-variance Student-t variables. `X_i` has no closed-form law; its CDF is the
//!   mixture `H_b(x) = E_M[F_eps((x - b M) / w)]`, evaluated by quadrature, and thresholds
//!   solve `H_b(c) = 1 - S`.
//!
//! Probabilities at or beyond 0 and 1 map to infinite thresholds, and infinite thresholds
//! map back to exact 0/1 conditional probabilities, so the recursion never sees NaN.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal, StudentT};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::core::{CreditError, Result};
use crate::math::{bisect_monotone, gauss_legendre_nodes_weights, normal_cdf, normal_inv_cdf};

use super::factor::idiosyncratic_weight;

const MIXTURE_ORDER: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Copula {
    #[default]
    Gaussian,
    /// Double-t copula; both degrees of freedom must exceed 2.
    StudentT {
        common_dof: f64,
        idiosyncratic_dof: f64,
    },
}

/// Student-t variable rescaled to unit variance.
#[derive(Debug, Clone)]
struct UnitStudentT {
    dof: f64,
    scale: f64,
    dist: StudentsT,
    sampler: StudentT<f64>,
}

impl UnitStudentT {
    fn new(dof: f64) -> Result<Self> {
        if !dof.is_finite() || dof <= 2.0 {
            return Err(CreditError::invalid(format!(
                "Student-t degrees of freedom must be finite and > 2, got {dof}"
            )));
        }
        let scale = ((dof - 2.0) / dof).sqrt();
        let dist = StudentsT::new(0.0, scale, dof)
            .map_err(|e| CreditError::invalid(format!("Student-t distribution: {e}")))?;
        let sampler = StudentT::new(dof)
            .map_err(|e| CreditError::invalid(format!("Student-t sampler: {e}")))?;
        Ok(Self {
            dof,
            scale,
            dist,
            sampler,
        })
    }

    #[inline]
    fn cdf(&self, x: f64) -> f64 {
        if x == f64::INFINITY {
            1.0
        } else if x == f64::NEG_INFINITY {
            0.0
        } else {
            self.dist.cdf(x)
        }
    }

    fn quantile(&self, p: f64) -> f64 {
        if p <= 0.0 {
            f64::NEG_INFINITY
        } else if p >= 1.0 {
            f64::INFINITY
        } else {
            self.dist.inverse_cdf(p)
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.scale * self.sampler.sample(rng)
    }
}

#[derive(Debug, Clone)]
struct DoubleT {
    common: UnitStudentT,
    idiosyncratic: UnitStudentT,
    /// `(m_j, w_j)`: common-factor quadrature in probability space.
    mixture: Vec<(f64, f64)>,
}

impl DoubleT {
    fn marginal_cdf(&self, x: f64, b: f64) -> f64 {
        let b = b.abs();
        let w = (1.0 - b * b).max(0.0).sqrt();
        if w <= 1.0e-12 {
            return self.common.cdf(x / b.max(1.0e-300));
        }
        self.mixture
            .iter()
            .map(|&(m, wt)| wt * self.idiosyncratic.cdf((x - b * m) / w))
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }
}

/// Conditional-probability kernel for a [`Copula`].
#[derive(Debug, Clone)]
pub struct CopulaEngine {
    copula: Copula,
    double_t: Option<DoubleT>,
}

impl CopulaEngine {
    pub fn new(copula: Copula) -> Result<Self> {
        let double_t = match copula {
            Copula::Gaussian => None,
            Copula::StudentT {
                common_dof,
                idiosyncratic_dof,
            } => {
                let common = UnitStudentT::new(common_dof)?;
                let idiosyncratic = UnitStudentT::new(idiosyncratic_dof)?;
                let (x, w) = gauss_legendre_nodes_weights(MIXTURE_ORDER)?;
                let mixture = x
                    .iter()
                    .zip(&w)
                    .map(|(&xi, &wi)| (common.quantile(0.5 * (xi + 1.0)), 0.5 * wi))
                    .collect();
                Some(DoubleT {
                    common,
                    idiosyncratic,
                    mixture,
                })
            }
        };
        Ok(Self { copula, double_t })
    }

    pub fn copula(&self) -> Copula {
        self.copula
    }

    pub fn is_gaussian(&self) -> bool {
        self.double_t.is_none()
    }

    /// Degrees of freedom of the common factor, if it is Student-t.
    pub fn common_dof(&self) -> Option<f64> {
        self.double_t.as_ref().map(|t| t.common.dof)
    }

    /// Default threshold `c` with `P(X <= c) = default_prob` for a name with `loadings`.
    pub fn threshold(&self, default_prob: f64, loadings: &[f64]) -> Result<f64> {
        if default_prob <= 0.0 {
            return Ok(f64::NEG_INFINITY);
        }
        if default_prob >= 1.0 {
            return Ok(f64::INFINITY);
        }
        let Some(t) = &self.double_t else {
            return Ok(normal_inv_cdf(default_prob));
        };
        let b = single_loading(loadings)?;
        let target = default_prob;

        let mut lo = -8.0;
        let mut hi = 8.0;
        while t.marginal_cdf(lo, b) > target && lo > -1.0e6 {
            lo *= 2.0;
        }
        while t.marginal_cdf(hi, b) < target && hi < 1.0e6 {
            hi *= 2.0;
        }
        let f_lo = t.marginal_cdf(lo, b);
        let f_hi = t.marginal_cdf(hi, b);
        if target <= f_lo {
            return Ok(lo);
        }
        if target >= f_hi {
            return Ok(hi);
        }
        Ok(bisect_monotone(
            |x| t.marginal_cdf(x, b),
            target,
            lo,
            hi,
            1.0e-12,
            400,
        )?)
    }

    /// `P(default | factor)` for a name with the given threshold and loadings.
    #[inline]
    pub fn conditional_default_prob(&self, threshold: f64, loadings: &[f64], factor: &[f64]) -> f64 {
        if threshold == f64::NEG_INFINITY {
            return 0.0;
        }
        if threshold == f64::INFINITY {
            return 1.0;
        }
        let systematic = loadings.iter().zip(factor).map(|(b, m)| b * m).sum::<f64>();
        let w = idiosyncratic_weight(loadings);
        if w <= 1.0e-12 {
            return if systematic <= threshold { 1.0 } else { 0.0 };
        }
        let z = (threshold - systematic) / w;
        let p = match &self.double_t {
            None => normal_cdf(z),
            Some(t) => t.idiosyncratic.cdf(z),
        };
        p.clamp(0.0, 1.0)
    }

    /// Conditional survival probability of a name with unconditional `survival_prob`.
    pub fn conditional_survival(
        &self,
        survival_prob: f64,
        loadings: &[f64],
        factor: &[f64],
    ) -> Result<f64> {
        let c = self.threshold(1.0 - survival_prob.clamp(0.0, 1.0), loadings)?;
        Ok(1.0 - self.conditional_default_prob(c, loadings, factor))
    }

    /// CDF of the latent variable of a name with `loadings`.
    pub fn latent_cdf(&self, x: f64, loadings: &[f64]) -> Result<f64> {
        match &self.double_t {
            None => Ok(normal_cdf(x)),
            Some(t) => Ok(t.marginal_cdf(x, single_loading(loadings)?)),
        }
    }

    /// Quantile of the common factor (unit variance).
    pub fn factor_quantile(&self, p: f64) -> f64 {
        match &self.double_t {
            None => normal_inv_cdf(p),
            Some(t) => t.common.quantile(p),
        }
    }

    /// Fills `out` with one draw of the systemic factors.
    pub fn sample_factors<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        match &self.double_t {
            None => out.iter_mut().for_each(|m| *m = StandardNormal.sample(rng)),
            Some(t) => out.iter_mut().for_each(|m| *m = t.common.sample(rng)),
        }
    }

    /// One draw of an idiosyncratic term.
    pub fn sample_idiosyncratic<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match &self.double_t {
            None => StandardNormal.sample(rng),
            Some(t) => t.idiosyncratic.sample(rng),
        }
    }
}

fn single_loading(loadings: &[f64]) -> Result<f64> {
    match loadings {
        [b] => Ok(*b),
        _ => Err(CreditError::unsupported(format!(
            "double-t copula needs exactly one systemic factor, got {}",
            loadings.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::math::fast_rng::Xoshiro256PlusPlus;
    use crate::math::gauss_hermite_nodes_weights;

    #[test]
    fn gaussian_conditional_probabilities_integrate_to_marginal() {
        let engine = CopulaEngine::new(Copula::Gaussian).unwrap();
        let b = [0.3_f64.sqrt()];
        let (x, w) = gauss_hermite_nodes_weights(64).unwrap();
        let s = 0.97;
        let avg = x
            .iter()
            .zip(&w)
            .map(|(m, wi)| wi * engine.conditional_survival(s, &b, &[*m]).unwrap())
            .sum::<f64>();
        assert_relative_eq!(avg, s, epsilon = 1e-10);
    }

    #[test]
    fn double_t_thresholds_invert_the_mixture() {
        let engine = CopulaEngine::new(Copula::StudentT {
            common_dof: 4.0,
            idiosyncratic_dof: 6.0,
        })
        .unwrap();
        let b = [0.5];
        for p in [1.0e-4, 0.02, 0.3] {
            let c = engine.threshold(p, &b).unwrap();
            assert_relative_eq!(engine.latent_cdf(c, &b).unwrap(), p, max_relative = 1e-8);
        }
    }

    #[test]
    fn degenerate_inputs_return_exact_boundaries() {
        let engine = CopulaEngine::new(Copula::Gaussian).unwrap();
        let b = [0.6];
        assert_eq!(engine.conditional_survival(1.0, &b, &[2.0]).unwrap(), 1.0);
        assert_eq!(engine.conditional_survival(0.0, &b, &[-2.0]).unwrap(), 0.0);

        let full = [1.0];
        let c = engine.threshold(0.1, &full).unwrap();
        assert_eq!(engine.conditional_default_prob(c, &full, &[c - 0.1]), 1.0);
        assert_eq!(engine.conditional_default_prob(c, &full, &[c + 0.1]), 0.0);
    }

    #[test]
    fn invalid_student_t_configurations_fail_fast() {
        assert!(
            CopulaEngine::new(Copula::StudentT {
                common_dof: 2.0,
                idiosyncratic_dof: 5.0
            })
            .is_err()
        );
        let engine = CopulaEngine::new(Copula::StudentT {
            common_dof: 5.0,
            idiosyncratic_dof: 5.0,
        })
        .unwrap();
        assert!(matches!(
            engine.threshold(0.1, &[0.3, 0.2]),
            Err(CreditError::Unsupported(_))
        ));
    }

    #[test]
    fn unit_variance_factor_draws() {
        let engine = CopulaEngine::new(Copula::StudentT {
            common_dof: 5.0,
            idiosyncratic_dof: 5.0,
        })
        .unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        let n = 200_000;
        let mut buf = [0.0];
        let mut sum_sq = 0.0;
        for _ in 0..n {
            engine.sample_factors(&mut rng, &mut buf);
            sum_sq += buf[0] * buf[0];
        }
        assert!((sum_sq / n as f64 - 1.0).abs() < 0.05);
    }
}
