//! Monte Carlo basket engine.
//!
//! Simulated paths are folded into weighted histograms on the same loss grids the
//! semi-analytic engines use, so the tranche interface is shared. Per-date means and
//! standard errors of loss, default count and amortization are reported alongside in
//! [`McStatistics`]. Results are reproducible for a given seed and do not depend on the
//! number of worker threads.

use std::sync::OnceLock;

use tracing::{debug, info};

use crate::core::Result;
use crate::credit::distribution::BasketDistribution;
use crate::mc::accumulator::PathAggregator;
use crate::mc::engine::{PathSimulator, fold_paths};
use crate::mc::{McConfig, McStatistics};

use super::semi_analytic::select_grids;
use super::{Basket, BasketLossModel};

#[derive(Debug)]
pub struct MonteCarloBasket {
    basket: Basket,
    config: McConfig,
    cache: OnceLock<(BasketDistribution, McStatistics)>,
}

fn simulate(basket: &Basket, config: &McConfig) -> Result<(BasketDistribution, McStatistics)> {
    let sim = PathSimulator::new(basket, config)?;
    let (loss_grid, amort_grid) = select_grids(sim.schedule(), basket)?;
    let amort_grid = amort_grid.unwrap_or(loss_grid);
    let n_dates = sim.dates().len();

    let aggregate = fold_paths(
        &sim,
        config.chunk_size,
        || PathAggregator::new(n_dates, loss_grid, amort_grid),
        |acc, path| acc.observe(&sim, path),
        |acc, part| acc.merge(part),
    )?;
    let (distribution, stats) = aggregate.finish(sim.dates())?;
    info!(
        paths = stats.paths,
        weight = stats.weight_sum,
        horizon_loss = stats.expected_loss.last().copied().unwrap_or(0.0),
        "monte carlo basket simulation finished"
    );
    Ok((distribution, stats))
}

impl MonteCarloBasket {
    pub fn new(basket: Basket, config: McConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            basket,
            config,
            cache: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &McConfig {
        &self.config
    }

    /// Replaces the simulation controls and drops cached results.
    pub fn set_config(&mut self, config: McConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.reset();
        Ok(())
    }

    fn results(&self) -> Result<&(BasketDistribution, McStatistics)> {
        if let Some(r) = self.cache.get() {
            return Ok(r);
        }
        debug!(
            names = self.basket.len(),
            paths = self.config.total_paths(),
            "simulating monte carlo basket"
        );
        let r = simulate(&self.basket, &self.config)?;
        Ok(self.cache.get_or_init(|| r))
    }

    pub fn distribution(&self) -> Result<&BasketDistribution> {
        Ok(&self.results()?.0)
    }

    pub fn statistics(&self) -> Result<&McStatistics> {
        Ok(&self.results()?.1)
    }
}

impl BasketLossModel for MonteCarloBasket {
    fn basket(&self) -> &Basket {
        &self.basket
    }

    fn basket_mut(&mut self) -> &mut Basket {
        &mut self.basket
    }

    fn reset(&mut self) {
        self.cache.take();
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
