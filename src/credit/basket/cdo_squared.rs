//! CDO-squared: a tranche on a portfolio of inner tranches.
//!
//! Inner tranche `s` references a pool of names with notional `P_s` and absorbs
//! `T_s = min((L_s - a_s P_s)^+, (d_s - a_s) P_s)` of the pool loss `L_s`. The outer
//! loss is `sum_s T_s` and its levels are fractions of `sum_s (d_s - a_s) P_s`.
//!
//! With disjoint pools the inner losses are conditionally independent given the factor.
//! [`CdoSquaredMethod::Recursion`] builds each inner conditional distribution with the
//! per-name recursion, maps it through the tranche payoff and convolves the resulting
//! per-pool steps on the outer grid. Overlapping pools break that independence and need
//! [`CdoSquaredMethod::MonteCarlo`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{CreditError, Result};
use crate::credit::distribution::{BasketDistribution, DistributionCache, GridDistribution};
use crate::credit::loss_grid::{LossGrid, NameStep, RecursionBuffer, deposit};
use crate::credit::quadrature::FactorQuadrature;
use crate::credit::tranche::LossWindow;
use crate::mc::McConfig;
use crate::mc::engine::{PathSimulator, fold_paths};

use super::schedule::BasketSchedule;
use super::semi_analytic::{Axis, PoolRecursion, check_copula_factors};
use super::{Basket, BasketLossModel};

/// Tranche `[attachment, detachment]` on the pool of `names`, as fractions of the pool
/// notional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerTranche {
    pub names: Vec<String>,
    pub attachment: f64,
    pub detachment: f64,
}

impl InnerTranche {
    pub fn new(names: Vec<String>, attachment: f64, detachment: f64) -> Result<Self> {
        let tranche = Self {
            names,
            attachment,
            detachment,
        };
        tranche.window()?;
        Ok(tranche)
    }

    fn window(&self) -> Result<LossWindow> {
        if self.names.is_empty() {
            return Err(CreditError::invalid("inner tranche references no names"));
        }
        LossWindow::new(self.attachment, self.detachment)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum CdoSquaredMethod {
    #[default]
    Recursion,
    MonteCarlo(McConfig),
}

/// Inner tranche bounds in currency units.
#[derive(Debug, Clone, Copy)]
struct TranchePayoff {
    low: f64,
    width: f64,
}

impl TranchePayoff {
    #[inline]
    fn apply(&self, pool_loss: f64) -> f64 {
        (pool_loss - self.low).clamp(0.0, self.width)
    }
}

#[derive(Debug)]
pub struct CdoSquaredBasket {
    basket: Basket,
    tranches: Vec<InnerTranche>,
    pools: Vec<Vec<usize>>,
    method: CdoSquaredMethod,
    cache: DistributionCache,
}

fn resolve_pools(basket: &Basket, tranches: &[InnerTranche]) -> Result<Vec<Vec<usize>>> {
    if tranches.is_empty() {
        return Err(CreditError::invalid("CDO-squared needs at least one inner tranche"));
    }
    tranches
        .iter()
        .map(|t| {
            t.window()?;
            let mut pool = Vec::with_capacity(t.names.len());
            for id in &t.names {
                let Some(i) = basket.names().iter().position(|n| &n.id == id) else {
                    return Err(CreditError::invalid(format!("unknown name '{id}' in inner tranche")));
                };
                if pool.contains(&i) {
                    return Err(CreditError::invalid(format!("name '{id}' listed twice in one pool")));
                }
                pool.push(i);
            }
            Ok(pool)
        })
        .collect()
}

fn check_cdo_squared(basket: &Basket, pools: &[Vec<usize>], method: &CdoSquaredMethod) -> Result<()> {
    check_copula_factors(basket)?;
    if basket.has_shorts() || basket.has_prepayment() {
        return Err(CreditError::unsupported(
            "CDO-squared does not model short names or prepayment",
        ));
    }
    if matches!(method, CdoSquaredMethod::Recursion) {
        let mut seen = vec![false; basket.len()];
        for &i in pools.iter().flatten() {
            if std::mem::replace(&mut seen[i], true) {
                return Err(CreditError::unsupported(format!(
                    "name '{}' sits in more than one pool; overlapping pools need Monte Carlo",
                    basket.names()[i].id
                )));
            }
        }
    }
    Ok(())
}

fn pool_notional(basket: &Basket, pool: &[usize]) -> f64 {
    pool.iter().map(|&i| basket.names()[i].principal.max(0.0)).sum()
}

fn payoffs(basket: &Basket, tranches: &[InnerTranche], pools: &[Vec<usize>]) -> Vec<TranchePayoff> {
    tranches
        .iter()
        .zip(pools)
        .map(|(t, pool)| {
            let p = pool_notional(basket, pool);
            TranchePayoff {
                low: t.attachment * p,
                width: (t.detachment - t.attachment) * p,
            }
        })
        .collect()
}

fn pool_loss_amounts(schedule: &BasketSchedule, pool: &[usize]) -> Vec<f64> {
    let mut out = Vec::new();
    for &i in pool {
        let o = &schedule.obligors[i];
        for nodes in &o.recovery {
            out.extend(nodes.iter().map(|(_, r)| (1.0 - r) * o.principal));
        }
    }
    out.retain(|a| *a > 0.0);
    out
}

/// Outer grid from the inner units and tranche bounds, so that tranche losses of inner grid
/// levels land on outer nodes whenever possible.
fn outer_grid(basket: &Basket, inner: &[LossGrid], payoffs: &[TranchePayoff]) -> Result<LossGrid> {
    let cfg = basket.config();
    let total = payoffs.iter().map(|p| p.width).sum::<f64>();
    let mut amounts: Vec<f64> = inner.iter().map(|g| g.unit).collect();
    amounts.extend(payoffs.iter().flat_map(|p| [p.low, p.width]));
    amounts.retain(|a| *a > 0.0);
    LossGrid::select(&amounts, total, cfg.grid_size, cfg.adaptive)
}

fn recursion_distribution(
    basket: &Basket,
    pools: &[Vec<usize>],
    payoffs: &[TranchePayoff],
) -> Result<BasketDistribution> {
    let schedule = BasketSchedule::new(basket)?;
    let cfg = basket.config();
    let nd = schedule.n_dates;
    let grids = pools
        .iter()
        .map(|pool| {
            let p = pool_notional(basket, pool);
            LossGrid::select(&pool_loss_amounts(&schedule, pool), p, cfg.grid_size, cfg.adaptive)
        })
        .collect::<Result<Vec<_>>>()?;
    let outer = outer_grid(basket, &grids, payoffs)?;
    let inner: Vec<PoolRecursion> = pools
        .iter()
        .zip(&grids)
        .map(|(pool, &grid)| PoolRecursion::new(&schedule, pool, grid, Axis::Loss))
        .collect();
    let quadrature = FactorQuadrature::for_copula(
        &schedule.engine,
        basket.loadings().n_factors(),
        cfg.factor_order,
    )?;
    let wo = outer.width();

    let flat = quadrature.integrate(
        nd * wo,
        || {
            (
                inner.iter().map(PoolRecursion::scratch).collect::<Vec<_>>(),
                grids.iter().map(|g| vec![0.0; g.width()]).collect::<Vec<_>>(),
                RecursionBuffer::for_shifts(payoffs.iter().map(|p| outer.units(p.width))),
                NameStep::default(),
            )
        },
        |m, out, (scratch, pmfs, buffer, step)| {
            for j in 0..nd {
                buffer.reset();
                for (s, rec) in inner.iter().enumerate() {
                    let pmf = &mut pmfs[s];
                    pmf.iter_mut().for_each(|v| *v = 0.0);
                    rec.conditional(j, m, &mut scratch[s], pmf);
                    step.clear();
                    for (k, &q) in pmf.iter().enumerate() {
                        let tranche_loss = payoffs[s].apply(k as f64 * rec.grid.unit);
                        if q > 0.0 && tranche_loss > 0.0 {
                            step.push(q, outer.units(tranche_loss));
                        }
                    }
                    buffer.add_name(step);
                }
                buffer.fold_into(&mut out[j * wo..(j + 1) * wo]);
            }
            Ok(())
        },
    )?;

    debug!(
        pools = pools.len(),
        dates = nd,
        outer_unit = outer.unit,
        outer_levels = wo,
        "rebuilt CDO-squared distribution by recursion"
    );
    Ok(tranche_only(
        flat.chunks(wo)
            .map(|pmf| GridDistribution {
                unit: outer.unit,
                pmf: pmf.to_vec(),
            })
            .collect(),
    ))
}

fn monte_carlo_distribution(
    basket: &Basket,
    pools: &[Vec<usize>],
    payoffs: &[TranchePayoff],
    config: &McConfig,
) -> Result<BasketDistribution> {
    let sim = PathSimulator::new(basket, config)?;
    let cfg = basket.config();
    let total = payoffs.iter().map(|p| p.width).sum::<f64>();
    let grid = LossGrid::fixed(total, cfg.grid_size)?;
    let nd = sim.dates().len();
    let w = grid.width();

    let hist = fold_paths(
        &sim,
        config.chunk_size,
        || vec![0.0; nd * w],
        |hist, path| {
            if path.weight <= 0.0 {
                return;
            }
            for j in 0..nd {
                let outer_loss = pools
                    .iter()
                    .zip(payoffs)
                    .map(|(pool, payoff)| {
                        payoff.apply(pool.iter().map(|&i| sim.name_loss(path, i, j)).sum())
                    })
                    .sum::<f64>();
                deposit(&mut hist[j * w..(j + 1) * w], grid.units(outer_loss), path.weight);
            }
        },
        |acc, part| {
            for (a, b) in acc.iter_mut().zip(part) {
                *a += b;
            }
        },
    )?;

    debug!(
        pools = pools.len(),
        paths = sim.total_paths(),
        "rebuilt CDO-squared distribution by simulation"
    );
    Ok(tranche_only(
        hist.chunks(w)
            .map(|h| GridDistribution::from_weights(grid.unit, h.to_vec()))
            .collect::<Result<Vec<_>>>()?,
    ))
}

fn tranche_only(loss: Vec<GridDistribution>) -> BasketDistribution {
    BasketDistribution {
        loss,
        amortization: Vec::new(),
    }
}

impl CdoSquaredBasket {
    /// `basket` holds every name referenced by `tranches`.
    pub fn new(basket: Basket, tranches: Vec<InnerTranche>, method: CdoSquaredMethod) -> Result<Self> {
        if let CdoSquaredMethod::MonteCarlo(cfg) = &method {
            cfg.validate()?;
        }
        let pools = resolve_pools(&basket, &tranches)?;
        check_cdo_squared(&basket, &pools, &method)?;
        Ok(Self {
            basket,
            tranches,
            pools,
            method,
            cache: DistributionCache::default(),
        })
    }

    pub fn tranches(&self) -> &[InnerTranche] {
        &self.tranches
    }

    pub fn method(&self) -> &CdoSquaredMethod {
        &self.method
    }

    /// Outer loss distributions per date; amortization is not produced.
    ///
    /// When every inner tranche has zero width the outer loss is identically zero.
    pub fn distribution(&self) -> Result<&BasketDistribution> {
        self.cache.get_or_try_init(|| {
            check_cdo_squared(&self.basket, &self.pools, &self.method)?;
            let payoffs = payoffs(&self.basket, &self.tranches, &self.pools);
            if payoffs.iter().all(|p| p.width <= 0.0) {
                let riskless = GridDistribution::point_mass(1.0, 0, 0);
                return Ok(tranche_only(vec![riskless; self.basket.dates().len()]));
            }
            match &self.method {
                CdoSquaredMethod::Recursion => recursion_distribution(&self.basket, &self.pools, &payoffs),
                CdoSquaredMethod::MonteCarlo(cfg) => {
                    monte_carlo_distribution(&self.basket, &self.pools, &payoffs, cfg)
                }
            }
        })
    }
}

impl BasketLossModel for CdoSquaredBasket {
    fn basket(&self) -> &Basket {
        &self.basket
    }

    fn basket_mut(&mut self) -> &mut Basket {
        &mut self.basket
    }

    fn reset(&mut self) {
        self.cache.clear();
    }

    /// `sum_s (d_s - a_s) P_s`.
    fn notional(&self) -> f64 {
        payoffs(&self.basket, &self.tranches, &self.pools)
            .iter()
            .map(|p| p.width)
            .sum()
    }

    fn loss_cdf(&self, date_index: usize, amount: f64) -> Result<f64> {
        Ok(self.distribution()?.loss[date_index].cdf(amount))
    }

    fn expected_capped_loss(&self, date_index: usize, amount: f64) -> Result<f64> {
        Ok(self.distribution()?.loss[date_index].expected_min(amount))
    }

    fn expected_capped_amortization(&self, _date_index: usize, _amount: f64) -> Result<f64> {
        Err(CreditError::unsupported("CDO-squared does not produce an amortization distribution"))
    }
}
