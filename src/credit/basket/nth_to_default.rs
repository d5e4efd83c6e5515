//! Nth-to-default baskets: the conditional recursion run on the default-count axis.
//!
//! With one exposure `p` and recovery `R` shared by every name, the loss at `t` is
//! `D (1 - R(t)) p` for the default count `D`, so the distribution of `D` determines every
//! tranche exactly. A product covering defaults `first..first + num - 1` pays
//! `(min(D, first - 1 + num) - (first - 1))^+` losses, which is the loss-window tranche
//! `((first - 1) e / P, (first - 1 + num) e / P)` with `e = (1 - R) p`.

use tracing::debug;

use crate::core::{CreditError, Result};
use crate::credit::distribution::{BasketDistribution, DistributionCache, GridDistribution, find_date};
use crate::credit::loss_grid::{NameStep, RecursionBuffer};
use crate::credit::quadrature::FactorQuadrature;
use crate::credit::tranche::{LossWindow, TrancheSpec};

use super::schedule::BasketSchedule;
use super::semi_analytic::check_copula_factors;
use super::{Basket, BasketLossModel};

#[derive(Debug)]
pub struct NthToDefaultBasket {
    basket: Basket,
    cache: DistributionCache,
}

fn check_exposures(basket: &Basket) -> Result<()> {
    if basket.has_shorts() || basket.has_prepayment() || basket.has_stochastic_recovery() {
        return Err(CreditError::unsupported(
            "nth-to-default basket does not model shorts, prepayment or stochastic recovery",
        ));
    }
    let names = basket.names();
    let first = &names[0];
    let identical = names.iter().all(|n| {
        (n.principal - first.principal).abs() <= 1.0e-12 * first.principal
            && n.recovery == first.recovery
    });
    if !identical {
        return Err(CreditError::unsupported(
            "nth-to-default basket needs the same principal and recovery for every name",
        ));
    }
    check_copula_factors(basket)
}

fn count_distribution(basket: &Basket) -> Result<BasketDistribution> {
    let schedule = BasketSchedule::new(basket)?;
    let n = basket.len();
    let nd = schedule.n_dates;
    let quadrature = FactorQuadrature::for_copula(
        &schedule.engine,
        basket.loadings().n_factors(),
        basket.config().factor_order,
    )?;

    let flat = quadrature.integrate(
        nd * (n + 1),
        || (RecursionBuffer::new(0, n), NameStep::default()),
        |m, out, (buffer, step)| {
            for j in 0..nd {
                buffer.reset();
                for i in 0..n {
                    let d = schedule.default_prob(i, j, m);
                    if d >= 1.0 {
                        step.certain(1.0);
                    } else {
                        step.clear();
                        step.push(d, 1.0);
                    }
                    buffer.add_name(step);
                }
                buffer.fold_into(&mut out[j * (n + 1)..(j + 1) * (n + 1)]);
            }
            Ok(())
        },
    )?;

    let name = &schedule.obligors[0];
    let (loss, amortization) = flat
        .chunks(n + 1)
        .enumerate()
        .map(|(j, pmf)| {
            let r = name.mean_recovery(j);
            (
                GridDistribution {
                    unit: (1.0 - r) * name.principal,
                    pmf: pmf.to_vec(),
                },
                GridDistribution {
                    unit: r * name.principal,
                    pmf: pmf.to_vec(),
                },
            )
        })
        .unzip();
    debug!(names = n, dates = nd, "rebuilt default-count distribution");
    Ok(BasketDistribution { loss, amortization })
}

impl NthToDefaultBasket {
    pub fn new(basket: Basket) -> Result<Self> {
        check_exposures(&basket)?;
        Ok(Self {
            basket,
            cache: DistributionCache::default(),
        })
    }

    pub fn distribution(&self) -> Result<&BasketDistribution> {
        self.cache.get_or_try_init(|| {
            check_exposures(&self.basket)?;
            count_distribution(&self.basket)
        })
    }

    /// `P(D_t = k)` for `k = 0..=n`.
    pub fn default_count_distribution(&self, date: f64) -> Result<&[f64]> {
        let idx = find_date(self.basket.dates(), date)?;
        Ok(&self.distribution()?.loss[idx].pmf)
    }

    /// Probability that at least `nth` names have defaulted by `date`.
    pub fn trigger_probability(&self, date: f64, nth: usize) -> Result<f64> {
        if nth < 1 || nth > self.basket.len() {
            return Err(CreditError::invalid(format!(
                "nth = {nth} must lie in 1..={}",
                self.basket.len()
            )));
        }
        let pmf = self.default_count_distribution(date)?;
        Ok(pmf[nth..].iter().sum::<f64>().clamp(0.0, 1.0))
    }

    /// Loss window of the defaults `first..first + num_covered - 1` at `date`.
    pub fn window(&self, date: f64, first: usize, num_covered: usize) -> Result<LossWindow> {
        TrancheSpec::NthToDefault { first, num_covered }.for_basket(&self.basket, date)
    }

    /// Expected loss of the defaults `first..first + num_covered - 1` at `date`.
    pub fn expected_tranche_loss(&self, date: f64, first: usize, num_covered: usize) -> Result<f64> {
        TrancheSpec::NthToDefault { first, num_covered }.validate(self.basket.len())?;
        let idx = find_date(self.basket.dates(), date)?;
        let dist = &self.distribution()?.loss[idx];
        let (lo, hi) = (first - 1, first - 1 + num_covered);
        Ok(dist
            .pmf
            .iter()
            .enumerate()
            .map(|(k, p)| p * (k.clamp(lo, hi) - lo) as f64 * dist.unit)
            .sum())
    }
}

impl BasketLossModel for NthToDefaultBasket {
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
    use crate::credit::basket::{DateGrid, HeterogeneousBasket};
    use crate::credit::factor::CorrelationSpec;
    use crate::credit::name::CreditName;
    use crate::credit::recovery::Recovery;
    use crate::credit::survival_curve::SurvivalCurve;

    fn mixed_pool() -> Basket {
        Basket::builder()
            .names((0..12).map(|i| {
                let h = 0.005 + 0.002 * i as f64;
                CreditName::new(
                    format!("N{i}"),
                    Arc::new(SurvivalCurve::flat(h).unwrap()),
                    Recovery::flat(0.4).unwrap(),
                    1.0,
                )
            }))
            .correlation(CorrelationSpec::Flat(0.3))
            .dates(DateGrid::new(vec![2.0, 5.0]).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn ntd_equals_the_matching_loss_tranche() {
        let ntd = NthToDefaultBasket::new(mixed_pool()).unwrap();
        let cdo = HeterogeneousBasket::new(mixed_pool()).unwrap();
        for &t in &[2.0, 5.0] {
            let w = ntd.window(t, 2, 3).unwrap();
            let a = ntd.expected_tranche_loss(t, 2, 3).unwrap();
            let b = cdo.accumulated_loss(t, w.low, w.high).unwrap();
            assert_relative_eq!(a, b, epsilon = 1e-10);
            assert_relative_eq!(ntd.accumulated_loss(t, w.low, w.high).unwrap(), a, epsilon = 1e-12);
        }
    }

    #[test]
    fn first_to_default_triggers_on_any_default() {
        let ntd = NthToDefaultBasket::new(mixed_pool()).unwrap();
        let pmf = ntd.default_count_distribution(5.0).unwrap();
        assert_relative_eq!(pmf.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(ntd.trigger_probability(5.0, 1).unwrap(), 1.0 - pmf[0], epsilon = 1e-12);
        assert!(ntd.trigger_probability(5.0, 2).unwrap() < ntd.trigger_probability(5.0, 1).unwrap());
        assert!(ntd.trigger_probability(5.0, 0).is_err());
    }

    #[test]
    fn invalid_windows_fail_fast() {
        let ntd = NthToDefaultBasket::new(mixed_pool()).unwrap();
        assert!(ntd.expected_tranche_loss(5.0, 0, 2).is_err());
        assert!(ntd.expected_tranche_loss(5.0, 10, 4).is_err());
        assert!(ntd.expected_tranche_loss(4.0, 1, 1).is_err());
    }

    #[test]
    fn unequal_exposures_are_unsupported() {
        let mut basket = mixed_pool();
        basket.set_principal("N3", 2.0).unwrap();
        assert!(matches!(
            NthToDefaultBasket::new(basket),
            Err(CreditError::Unsupported(_))
        ));
    }
}
