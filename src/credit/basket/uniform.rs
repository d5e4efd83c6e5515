//! Identical-name pool in closed form.
//!
//! Conditional on the factor every name defaults independently with the same probability
//! `d(m)`, so the default count is binomial and
//! `P(D = k) = E_M[C(n, k) d(M)^k (1 - d(M))^(n - k)]`. The loss at date `t` is
//! `D (1 - R(t)) p` and the amortization `D R(t) p`, so both distributions live on the
//! count axis scaled by a per-date unit. Used as the reference for the grid engines.

use statrs::function::factorial::ln_binomial;
use tracing::debug;

use crate::core::{CreditError, Result};
use crate::credit::distribution::{BasketDistribution, DistributionCache, GridDistribution};
use crate::credit::quadrature::FactorQuadrature;

use super::schedule::BasketSchedule;
use super::{Basket, BasketLossModel};

/// Writes the `Binomial(n, p)` probabilities of `0..=n` into `out`.
pub(crate) fn binomial_pmf(n: usize, p: f64, out: &mut [f64]) {
    out[..=n].iter_mut().for_each(|v| *v = 0.0);
    if p <= 0.0 {
        out[0] = 1.0;
        return;
    }
    if p >= 1.0 {
        out[n] = 1.0;
        return;
    }
    let (lp, lq) = (p.ln(), (-p).ln_1p());
    for (k, v) in out[..=n].iter_mut().enumerate() {
        *v = (ln_binomial(n as u64, k as u64) + k as f64 * lp + (n - k) as f64 * lq).exp();
    }
}

#[derive(Debug)]
pub struct UniformBasket {
    basket: Basket,
    cache: DistributionCache,
}

impl UniformBasket {
    pub fn new(basket: Basket) -> Result<Self> {
        check_uniform(&basket)?;
        Ok(Self {
            basket,
            cache: DistributionCache::default(),
        })
    }

    /// Probability of exactly `k` defaults by each basket date.
    pub fn default_count_distribution(&self) -> Result<Vec<Vec<f64>>> {
        Ok(self.distribution()?.loss.iter().map(|d| d.pmf.clone()).collect())
    }

    pub fn distribution(&self) -> Result<&BasketDistribution> {
        self.cache.get_or_try_init(|| {
            check_uniform(&self.basket)?;
            uniform_distribution(&self.basket)
        })
    }
}

fn check_uniform(basket: &Basket) -> Result<()> {
    if !basket.is_homogeneous() || basket.loadings().n_factors() != 1 {
        return Err(CreditError::unsupported(
            "uniform basket needs identical names on a single flat factor",
        ));
    }
    if basket.has_shorts()
        || basket.has_prepayment()
        || basket.has_stochastic_recovery()
        || basket.has_defaulted()
    {
        return Err(CreditError::unsupported(
            "uniform basket does not model shorts, prepayment, stochastic recovery or defaulted names",
        ));
    }
    Ok(())
}

fn uniform_distribution(basket: &Basket) -> Result<BasketDistribution> {
    let schedule = BasketSchedule::new(basket)?;
    let n = basket.len();
    let nd = schedule.n_dates;
    let quadrature = FactorQuadrature::for_copula(&schedule.engine, 1, basket.config().factor_order)?;

    let counts = quadrature.integrate(
        nd * (n + 1),
        || vec![0.0; n + 1],
        |m, out, pmf| {
            for j in 0..nd {
                binomial_pmf(n, schedule.default_prob(0, j, m), pmf);
                out[j * (n + 1)..(j + 1) * (n + 1)].copy_from_slice(pmf);
            }
            Ok(())
        },
    )?;

    let name = &schedule.obligors[0];
    let mut loss = Vec::with_capacity(nd);
    let mut amortization = Vec::with_capacity(nd);
    for (j, pmf) in counts.chunks(n + 1).enumerate() {
        let r = name.mean_recovery(j);
        loss.push(GridDistribution {
            unit: (1.0 - r) * name.principal,
            pmf: pmf.to_vec(),
        });
        amortization.push(GridDistribution {
            unit: r * name.principal,
            pmf: pmf.to_vec(),
        });
    }
    debug!(names = n, dates = nd, nodes = quadrature.len(), "rebuilt uniform basket distribution");
    Ok(BasketDistribution { loss, amortization })
}

impl BasketLossModel for UniformBasket {
    fn basket(&self) -> &Basket {
        &self.basket
    }

    fn basket_mut(&mut self) -> &mut Basket {
        &mut self.basket
    }

    fn reset(&mut self) {
        self.cache.clear();
    }

    fn loss_cdf(&self, date_index: usize, amount: f64) -> Result<f64> {
        Ok(self.distribution()?.loss[date_index].cdf(amount))
    }

    fn expected_capped_loss(&self, date_index: usize, amount: f64) -> Result<f64> {
        Ok(self.distribution()?.loss[date_index].expected_min(amount))
    }

    fn expected_capped_amortization(&self, date_index: usize, amount: f64) -> Result<f64> {
        Ok(self.distribution()?.amortization[date_index].expected_min(amount))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;

    use super::*;
    use crate::credit::basket::DateGrid;
    use crate::credit::factor::CorrelationSpec;
    use crate::credit::name::CreditName;
    use crate::credit::recovery::Recovery;
    use crate::credit::survival_curve::SurvivalCurve;

    fn pool(n: usize, rho: f64) -> Basket {
        let curve = Arc::new(SurvivalCurve::flat(0.02).unwrap());
        Basket::builder()
            .names((0..n).map(|i| {
                CreditName::new(format!("N{i}"), curve.clone(), Recovery::flat(0.4).unwrap(), 1.0)
            }))
            .correlation(CorrelationSpec::Flat(rho))
            .dates(DateGrid::new(vec![1.0, 5.0]).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn binomial_pmf_matches_closed_form() {
        let mut out = vec![0.0; 4];
        binomial_pmf(3, 0.2, &mut out);
        assert_relative_eq!(out[0], 0.512, epsilon = 1e-14);
        assert_relative_eq!(out[1], 0.384, epsilon = 1e-14);
        assert_relative_eq!(out[3], 0.008, epsilon = 1e-14);
        binomial_pmf(3, 1.0, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn independent_names_give_a_binomial_count() {
        let model = UniformBasket::new(pool(10, 0.0)).unwrap();
        let counts = model.default_count_distribution().unwrap();
        let d = 1.0 - (-0.02_f64 * 5.0).exp();
        let mut expected = vec![0.0; 11];
        binomial_pmf(10, d, &mut expected);
        for (a, b) in counts[1].iter().zip(&expected) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        let el = model.accumulated_loss(5.0, 0.0, 1.0).unwrap();
        assert_relative_eq!(el, 10.0 * 0.6 * d, epsilon = 1e-12);
    }

    #[test]
    fn correlation_fattens_the_tail() {
        let flat = UniformBasket::new(pool(50, 0.0)).unwrap();
        let corr = UniformBasket::new(pool(50, 0.5)).unwrap();
        let senior = |m: &UniformBasket| m.accumulated_loss(5.0, 0.15, 1.0).unwrap();
        assert!(senior(&corr) > senior(&flat));
    }

    #[test]
    fn shorts_are_unsupported() {
        let mut basket = pool(4, 0.2);
        basket.set_principal("N0", -1.0).unwrap();
        assert!(matches!(UniformBasket::new(basket), Err(CreditError::Unsupported(_))));
    }
}
