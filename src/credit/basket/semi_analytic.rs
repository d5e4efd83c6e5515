//! Semi-analytic engines: conditional recursion integrated over the systemic factors.
//!
//! For every quadrature node and date, [`PoolRecursion`] builds the conditional loss (or
//! amortization) distribution of a set of obligors on a [`LossGrid`]. The factor
//! integrator combines the node results into the unconditional per-date distributions.
//!
//! Per name and date the outcomes are: default with probability `d` (spread over the
//! recovery nodes when recovery is stochastic), prepayment with probability `(1 - d) pi`
//! and survival. A loss is only caused by default, so the loss axis never sees the
//! prepayment branch; the amortization axis collects recovered amounts and prepaid
//! principal. Names already defaulted have `d = 1` and shift deterministically.

use tracing::debug;

use crate::core::{CreditError, Result};
use crate::credit::copula::Copula;
use crate::credit::distribution::{BasketDistribution, DistributionCache, GridDistribution};
use crate::credit::loss_grid::{LossGrid, NameStep, RecursionBuffer, deposit};
use crate::credit::quadrature::FactorQuadrature;

use super::schedule::BasketSchedule;
use super::uniform::binomial_pmf;
use super::{Basket, BasketLossModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Axis {
    Loss,
    Amortization,
}

/// Recursion over a fixed set of obligors on one axis.
#[derive(Debug)]
pub(crate) struct PoolRecursion<'a> {
    schedule: &'a BasketSchedule,
    members: &'a [usize],
    pub grid: LossGrid,
    axis: Axis,
}

/// Worker-owned buffers of a [`PoolRecursion`].
#[derive(Debug, Clone)]
pub(crate) struct PoolScratch {
    buffer: RecursionBuffer,
    step: NameStep,
}

impl<'a> PoolRecursion<'a> {
    pub fn new(schedule: &'a BasketSchedule, members: &'a [usize], grid: LossGrid, axis: Axis) -> Self {
        Self {
            schedule,
            members,
            grid,
            axis,
        }
    }

    pub fn scratch(&self) -> PoolScratch {
        // Every branch moves at most the full principal.
        let bounds = self
            .members
            .iter()
            .map(|&i| self.grid.units(self.schedule.obligors[i].principal));
        PoolScratch {
            buffer: RecursionBuffer::for_shifts(bounds),
            step: NameStep::default(),
        }
    }

    /// Adds the conditional distribution at date `j` given `factor` into `out`.
    pub fn conditional(&self, j: usize, factor: &[f64], scratch: &mut PoolScratch, out: &mut [f64]) {
        let PoolScratch { buffer, step } = scratch;
        buffer.reset();
        for &i in self.members {
            let o = &self.schedule.obligors[i];
            let d = self.schedule.default_prob(i, j, factor);
            let p = o.principal;
            step.clear();
            match self.axis {
                Axis::Loss => {
                    for &(w, r) in &o.recovery[j] {
                        step.push(d * w, self.grid.units((1.0 - r) * p));
                    }
                }
                Axis::Amortization => {
                    for &(w, r) in &o.recovery[j] {
                        step.push(d * w, self.grid.units(r * p));
                    }
                    step.push((1.0 - d) * o.prepay[j], self.grid.units(p));
                }
            }
            if d >= 1.0 {
                step.stay = 0.0;
            }
            buffer.add_name(step);
        }
        buffer.fold_into(out);
    }
}

/// Loss and amortization grids of a schedule.
pub(crate) fn select_grids(schedule: &BasketSchedule, basket: &Basket) -> Result<(LossGrid, Option<LossGrid>)> {
    let cfg = basket.config();
    let p = schedule.notional;
    let loss = LossGrid::select(&schedule.loss_amounts(), p, cfg.grid_size, cfg.adaptive)?;
    let amounts = schedule.amortization_amounts();
    let amortization = if amounts.is_empty() {
        None
    } else {
        Some(LossGrid::select(&amounts, p, cfg.grid_size, cfg.adaptive)?)
    };
    Ok((loss, amortization))
}

/// Splits the integrated flat vector into per-date distributions.
fn unpack(
    flat: &[f64],
    n_dates: usize,
    loss: LossGrid,
    amortization: Option<LossGrid>,
) -> BasketDistribution {
    let wl = loss.width();
    let (lo, am) = flat.split_at(n_dates * wl);
    let loss_dists = lo
        .chunks(wl)
        .map(|pmf| GridDistribution {
            unit: loss.unit,
            pmf: pmf.to_vec(),
        })
        .collect();
    let amort_dists = match amortization {
        Some(grid) => am
            .chunks(grid.width())
            .map(|pmf| GridDistribution {
                unit: grid.unit,
                pmf: pmf.to_vec(),
            })
            .collect(),
        None => (0..n_dates)
            .map(|_| GridDistribution::point_mass(loss.unit, 0, 0))
            .collect(),
    };
    BasketDistribution {
        loss: loss_dists,
        amortization: amort_dists,
    }
}

fn factor_rule(schedule: &BasketSchedule, basket: &Basket) -> Result<FactorQuadrature> {
    FactorQuadrature::for_copula(
        &schedule.engine,
        basket.loadings().n_factors(),
        basket.config().factor_order,
    )
}

pub(crate) fn check_copula_factors(basket: &Basket) -> Result<()> {
    if matches!(basket.copula(), Copula::StudentT { .. }) && basket.loadings().n_factors() != 1 {
        return Err(CreditError::unsupported(
            "Student-t copula supports a single systemic factor",
        ));
    }
    Ok(())
}

fn heterogeneous_distribution(basket: &Basket) -> Result<BasketDistribution> {
    let schedule = BasketSchedule::new(basket)?;
    let (loss_grid, amort_grid) = select_grids(&schedule, basket)?;
    let quadrature = factor_rule(&schedule, basket)?;
    let members: Vec<usize> = (0..basket.len()).collect();
    let nd = schedule.n_dates;

    let loss = PoolRecursion::new(&schedule, &members, loss_grid, Axis::Loss);
    let amortization =
        amort_grid.map(|g| PoolRecursion::new(&schedule, &members, g, Axis::Amortization));
    let wl = loss_grid.width();
    let wa = amort_grid.map_or(0, |g| g.width());

    let flat = quadrature.integrate(
        nd * (wl + wa),
        || (loss.scratch(), amortization.as_ref().map(PoolRecursion::scratch)),
        |m, out, (ls, as_)| {
            let (lo, am) = out.split_at_mut(nd * wl);
            for j in 0..nd {
                loss.conditional(j, m, ls, &mut lo[j * wl..(j + 1) * wl]);
                if let (Some(rec), Some(scratch)) = (&amortization, as_.as_mut()) {
                    rec.conditional(j, m, scratch, &mut am[j * wa..(j + 1) * wa]);
                }
            }
            Ok(())
        },
    )?;

    debug!(
        names = basket.len(),
        dates = nd,
        nodes = quadrature.len(),
        loss_unit = loss_grid.unit,
        loss_levels = loss_grid.width(),
        "rebuilt heterogeneous basket distribution"
    );
    Ok(unpack(&flat, nd, loss_grid, amort_grid))
}

/// Full per-name recursion; handles every basket the inputs can describe.
#[derive(Debug)]
pub struct HeterogeneousBasket {
    basket: Basket,
    cache: DistributionCache,
}

impl HeterogeneousBasket {
    pub fn new(basket: Basket) -> Result<Self> {
        check_copula_factors(&basket)?;
        Ok(Self {
            basket,
            cache: DistributionCache::default(),
        })
    }

    /// Per-date loss and amortization distributions, computed on first use.
    pub fn distribution(&self) -> Result<&BasketDistribution> {
        self.cache.get_or_try_init(|| {
            check_copula_factors(&self.basket)?;
            heterogeneous_distribution(&self.basket)
        })
    }
}

impl BasketLossModel for HeterogeneousBasket {
    fn basket(&self) -> &Basket {
        &self.basket
    }

    fn basket_mut(&mut self) -> &mut Basket {
        &mut self.basket
    }

    fn reset(&mut self) {
        debug!("reset heterogeneous basket distribution");
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

fn check_homogeneous(basket: &Basket) -> Result<()> {
    check_copula_factors(basket)?;
    if !basket.is_homogeneous() {
        return Err(CreditError::unsupported(
            "homogeneous basket needs names with identical curves, recovery, principal and loadings",
        ));
    }
    if basket.has_stochastic_recovery() {
        return Err(CreditError::unsupported(
            "homogeneous basket does not model stochastic recovery",
        ));
    }
    Ok(())
}

fn homogeneous_distribution(basket: &Basket) -> Result<BasketDistribution> {
    let schedule = BasketSchedule::new(basket)?;
    let (loss_grid, amort_grid) = select_grids(&schedule, basket)?;
    let quadrature = factor_rule(&schedule, basket)?;
    let n = basket.len();
    let nd = schedule.n_dates;
    let name = &schedule.obligors[0];
    let p = name.principal;
    let wl = loss_grid.width();
    let wa = amort_grid.map_or(0, |g| g.width());

    let flat = quadrature.integrate(
        nd * (wl + wa),
        || (vec![0.0; n + 1], vec![0.0; n + 1]),
        |m, out, (defaults, prepaid)| {
            let (lo, am) = out.split_at_mut(nd * wl);
            for j in 0..nd {
                let d = schedule.default_prob(0, j, m);
                let r = name.mean_recovery(j);
                binomial_pmf(n, d, defaults);
                let row = &mut lo[j * wl..(j + 1) * wl];
                for (k, &q) in defaults.iter().enumerate() {
                    if q > 0.0 {
                        deposit(row, loss_grid.units(k as f64 * (1.0 - r) * p), q);
                    }
                }

                let Some(grid) = amort_grid else { continue };
                let row = &mut am[j * wa..(j + 1) * wa];
                let pi = name.prepay[j];
                for (k, &q) in defaults.iter().enumerate() {
                    if q <= 0.0 {
                        continue;
                    }
                    let recovered = k as f64 * r * p;
                    if pi <= 0.0 {
                        deposit(row, grid.units(recovered), q);
                        continue;
                    }
                    // Survivors prepay independently with probability pi.
                    binomial_pmf(n - k, pi, prepaid);
                    for (l, &s) in prepaid[..=n - k].iter().enumerate() {
                        if s > 0.0 {
                            deposit(row, grid.units(recovered + l as f64 * p), q * s);
                        }
                    }
                }
            }
            Ok(())
        },
    )?;

    debug!(
        names = n,
        dates = nd,
        nodes = quadrature.len(),
        "rebuilt homogeneous basket distribution"
    );
    Ok(unpack(&flat, nd, loss_grid, amort_grid))
}

/// Identical names: one conditional probability per node and binomial (trinomial with
/// prepayment) placement on the loss grid.
#[derive(Debug)]
pub struct HomogeneousBasket {
    basket: Basket,
    cache: DistributionCache,
}

impl HomogeneousBasket {
    pub fn new(basket: Basket) -> Result<Self> {
        check_homogeneous(&basket)?;
        Ok(Self {
            basket,
            cache: DistributionCache::default(),
        })
    }

    pub fn distribution(&self) -> Result<&BasketDistribution> {
        self.cache.get_or_try_init(|| {
            check_homogeneous(&self.basket)?;
            homogeneous_distribution(&self.basket)
        })
    }
}

impl BasketLossModel for HomogeneousBasket {
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
