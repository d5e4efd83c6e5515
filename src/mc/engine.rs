//! Path simulation of default and prepayment dates.
//!
//! Name `i` defaults by date `t_j` when its latent variable `X_i = b_i . M + w_i eps_i`
//! falls to or below the threshold `c_i(t_j)`; thresholds increase with `j`, so the default
//! date is the first such `j`. Prepayment times are drawn by inverting the refinance curve
//! and are independent of the factor. At each date a default takes precedence over a
//! prepayment.
//!
//! With the stratified sampler the factor is drawn first, the horizon default count `k` is
//! fixed by the stratum, the defaulting names are sampled exactly from the conditional
//! Bernoulli law given the count, and each default date is drawn from the conditional
//! default-time distribution `d_i(t_j | m) / d_i(T | m)`.
//!
//! Path `i` always draws from the stream `PathStream::at_path(i)`, and chunks of paths are
//! folded in index order, so results do not depend on the number of threads.

use std::ops::Range;
use std::sync::Arc;

use rand::Rng;
use rand_distr::StandardNormal;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::debug;

use crate::core::{CreditError, Result};
use crate::credit::basket::Basket;
use crate::credit::basket::schedule::BasketSchedule;
use crate::credit::factor::idiosyncratic_weight;
use crate::credit::recovery::Recovery;
use crate::credit::survival_curve::SurvivalTermStructure;
use crate::math::fast_rng::{PathStream, Xoshiro256PlusPlus, uniform_open01};

use super::McConfig;
use super::sampler::{Sampler, StratifiedPlan};

/// Events of one simulated path.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedPath {
    pub index: u64,
    pub weight: f64,
    /// Index of the first basket date on or after the default, per obligor.
    pub default_date: Vec<Option<usize>>,
    /// Index of the first basket date on or after the prepayment, per obligor.
    pub prepay_date: Vec<Option<usize>>,
    /// Idiosyncratic recovery driver per obligor (zero for deterministic recovery).
    pub recovery_driver: Vec<f64>,
}

impl SimulatedPath {
    fn empty(n: usize) -> Self {
        Self {
            index: 0,
            weight: 0.0,
            default_date: vec![None; n],
            prepay_date: vec![None; n],
            recovery_driver: vec![0.0; n],
        }
    }

    pub fn is_defaulted(&self, i: usize, j: usize) -> bool {
        self.default_date[i].is_some_and(|d| d <= j)
    }

    pub fn is_prepaid(&self, i: usize, j: usize) -> bool {
        !self.is_defaulted(i, j) && self.prepay_date[i].is_some_and(|d| d <= j)
    }

    /// Number of obligors defaulted by date `j`.
    pub fn defaults_by(&self, j: usize) -> usize {
        self.default_date
            .iter()
            .filter(|d| d.is_some_and(|d| d <= j))
            .count()
    }
}

/// Worker-owned buffers for stratified sampling.
#[derive(Debug, Clone, Default)]
pub struct PathScratch {
    factor: Vec<f64>,
    horizon_pd: Vec<f64>,
    /// `table[r][k]`: probability of exactly `k` defaults among random names `r..`.
    table: Vec<Vec<f64>>,
}

#[derive(Debug)]
pub struct PathSimulator {
    schedule: BasketSchedule,
    dates: Vec<f64>,
    n_factors: usize,
    weights: Vec<f64>,
    refinance: Vec<Option<Arc<dyn SurvivalTermStructure>>>,
    recovery: Vec<Recovery>,
    /// Obligors without a pre-set default time.
    random: Vec<usize>,
    stream: PathStream,
    plan: Option<StratifiedPlan>,
    total_paths: usize,
}

impl PathSimulator {
    pub fn new(basket: &Basket, config: &McConfig) -> Result<Self> {
        config.validate()?;
        let schedule = BasketSchedule::new(basket)?;
        let random: Vec<usize> = basket
            .names()
            .iter()
            .enumerate()
            .filter(|(_, n)| n.default_time.is_none())
            .map(|(i, _)| i)
            .collect();
        let plan = match &config.sampler {
            Sampler::Plain => None,
            Sampler::Stratified(cfg) => Some(StratifiedPlan::new(cfg, random.len())?),
        };
        let total_paths = plan.as_ref().map_or(config.paths, StratifiedPlan::total_paths);
        let weights = schedule
            .obligors
            .iter()
            .map(|o| idiosyncratic_weight(&o.loadings))
            .collect();
        debug!(
            obligors = basket.len(),
            paths = total_paths,
            stratified = plan.is_some(),
            seed = config.seed,
            "prepared path simulator"
        );
        Ok(Self {
            schedule,
            dates: basket.dates().to_vec(),
            n_factors: basket.loadings().n_factors(),
            weights,
            refinance: basket.names().iter().map(|n| n.refinance.clone()).collect(),
            recovery: basket.names().iter().map(|n| n.recovery.clone()).collect(),
            random,
            stream: PathStream::new(config.seed),
            plan,
            total_paths,
        })
    }

    pub fn total_paths(&self) -> usize {
        self.total_paths
    }

    pub fn n_obligors(&self) -> usize {
        self.schedule.obligors.len()
    }

    pub fn dates(&self) -> &[f64] {
        &self.dates
    }

    pub(crate) fn schedule(&self) -> &BasketSchedule {
        &self.schedule
    }

    pub fn scratch(&self) -> PathScratch {
        let nr = self.random.len();
        PathScratch {
            factor: vec![0.0; self.n_factors],
            horizon_pd: vec![0.0; nr],
            table: if self.plan.is_some() {
                vec![vec![0.0; nr + 1]; nr + 1]
            } else {
                Vec::new()
            },
        }
    }

    pub fn simulate_path(&self, index: u64) -> SimulatedPath {
        let mut path = SimulatedPath::empty(self.n_obligors());
        self.simulate_into(index, &mut self.scratch(), &mut path);
        path
    }

    /// Overwrites `path` with path `index`.
    pub fn simulate_into(&self, index: u64, scratch: &mut PathScratch, path: &mut SimulatedPath) {
        let mut rng = self.stream.at_path(index);
        path.index = index;
        path.weight = 1.0;
        path.default_date.iter_mut().for_each(|d| *d = None);
        path.prepay_date.iter_mut().for_each(|d| *d = None);
        path.recovery_driver.iter_mut().for_each(|y| *y = 0.0);

        self.schedule.engine.sample_factors(&mut rng, &mut scratch.factor);
        match &self.plan {
            None => self.plain_defaults(&mut rng, &scratch.factor, path),
            Some(plan) => self.stratified_defaults(plan, &mut rng, scratch, path),
        }

        let last = self.dates.len() - 1;
        for (i, o) in self.schedule.obligors.iter().enumerate() {
            if o.defaulted_from.is_some() && path.default_date[i].is_none() {
                path.default_date[i] = o.defaulted_from;
            }
            if self.recovery[i].is_stochastic() {
                path.recovery_driver[i] = rng.sample(StandardNormal);
            }
            if let Some(curve) = &self.refinance[i] {
                let tau = curve.inverse_survival_prob(uniform_open01(rng.next_f64()));
                if tau <= self.dates[last] {
                    path.prepay_date[i] = self.dates.iter().position(|&t| t >= tau);
                }
            }
        }
    }

    fn plain_defaults(&self, rng: &mut Xoshiro256PlusPlus, factor: &[f64], path: &mut SimulatedPath) {
        for (i, o) in self.schedule.obligors.iter().enumerate() {
            let eps = self.schedule.engine.sample_idiosyncratic(rng);
            let systematic = o.loadings.iter().zip(factor).map(|(b, m)| b * m).sum::<f64>();
            let x = systematic + self.weights[i] * eps;
            path.default_date[i] = o.thresholds.iter().position(|&c| x <= c);
        }
    }

    fn stratified_defaults(
        &self,
        plan: &StratifiedPlan,
        rng: &mut Xoshiro256PlusPlus,
        scratch: &mut PathScratch,
        path: &mut SimulatedPath,
    ) {
        let Some((slot, local)) = plan.locate(path.index) else {
            path.weight = 0.0;
            return;
        };
        let nr = self.random.len();
        let last = self.dates.len() - 1;
        let factor = &scratch.factor;
        for (r, &i) in self.random.iter().enumerate() {
            scratch.horizon_pd[r] = self.schedule.default_prob(i, last, factor);
        }

        // Backward Poisson-binomial table over the random names.
        let table = &mut scratch.table;
        table[nr].iter_mut().for_each(|v| *v = 0.0);
        table[nr][0] = 1.0;
        for r in (0..nr).rev() {
            let d = scratch.horizon_pd[r];
            for k in 0..=nr {
                let stay = (1.0 - d) * table[r + 1][k];
                let hit = if k > 0 { d * table[r + 1][k - 1] } else { 0.0 };
                table[r][k] = stay + hit;
            }
        }

        let k = slot.count(local, rng.next_f64());
        let prob = table[0][k];
        path.weight = slot.width() as f64 * prob / slot.paths as f64;
        if prob <= 0.0 {
            return;
        }

        let mut remaining = k;
        for (r, &i) in self.random.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let d = scratch.horizon_pd[r];
            let p_default = d * table[r + 1][remaining - 1] / table[r][remaining];
            if rng.next_f64() < p_default {
                remaining -= 1;
                let v = rng.next_f64() * d;
                path.default_date[i] = (0..=last)
                    .find(|&j| v <= self.schedule.default_prob(i, j, factor))
                    .or(Some(last));
            }
        }
    }

    /// Loss of obligor `i` at date `j` on `path` (zero unless defaulted by `j`).
    pub fn name_loss(&self, path: &SimulatedPath, i: usize, j: usize) -> f64 {
        if !path.is_defaulted(i, j) {
            return 0.0;
        }
        let t = self.dates[j];
        let r = self.recovery[i].conditional_rate(t, path.recovery_driver[i]);
        (1.0 - r) * self.schedule.obligors[i].principal
    }

    /// Amortization of obligor `i` at date `j`: recovered amount or prepaid principal.
    pub fn name_amortization(&self, path: &SimulatedPath, i: usize, j: usize) -> f64 {
        let principal = self.schedule.obligors[i].principal;
        if path.is_defaulted(i, j) {
            let t = self.dates[j];
            self.recovery[i].conditional_rate(t, path.recovery_driver[i]) * principal
        } else if path.is_prepaid(i, j) {
            principal
        } else {
            0.0
        }
    }

    pub fn loss_at(&self, path: &SimulatedPath, j: usize) -> f64 {
        (0..self.n_obligors()).map(|i| self.name_loss(path, i, j)).sum()
    }

    pub fn amortization_at(&self, path: &SimulatedPath, j: usize) -> f64 {
        (0..self.n_obligors())
            .map(|i| self.name_amortization(path, i, j))
            .sum()
    }
}

/// Paths in `range`, simulated one after another.
pub fn simulate_paths(sim: &PathSimulator, range: Range<u64>) -> Vec<SimulatedPath> {
    let mut scratch = sim.scratch();
    range
        .map(|i| {
            let mut path = SimulatedPath::empty(sim.n_obligors());
            sim.simulate_into(i, &mut scratch, &mut path);
            path
        })
        .collect()
}

/// Paths in `range`, simulated across the rayon pool.
#[cfg(feature = "parallel")]
pub fn simulate_paths_parallel(sim: &PathSimulator, range: Range<u64>) -> Vec<SimulatedPath> {
    range
        .into_par_iter()
        .map_init(
            || sim.scratch(),
            |scratch, i| {
                let mut path = SimulatedPath::empty(sim.n_obligors());
                sim.simulate_into(i, scratch, &mut path);
                path
            },
        )
        .collect()
}

/// Paths in `range`; serial without the `parallel` feature.
#[cfg(not(feature = "parallel"))]
pub fn simulate_paths_parallel(sim: &PathSimulator, range: Range<u64>) -> Vec<SimulatedPath> {
    simulate_paths(sim, range)
}

/// Folds every path of `sim` into an accumulator.
///
/// Paths are split into chunks of `chunk_size`; each chunk folds into its own accumulator
/// and the chunk results are merged in chunk order.
pub fn fold_paths<A, I, V, M>(
    sim: &PathSimulator,
    chunk_size: usize,
    init: I,
    visit: V,
    merge: M,
) -> Result<A>
where
    A: Send,
    I: Fn() -> A + Sync,
    V: Fn(&mut A, &SimulatedPath) + Sync,
    M: Fn(&mut A, A),
{
    if chunk_size == 0 {
        return Err(CreditError::invalid("chunk size must be >= 1"));
    }
    let total = sim.total_paths();
    let n_chunks = total.div_ceil(chunk_size);
    let chunk = |c: usize| -> A {
        let mut acc = init();
        let mut scratch = sim.scratch();
        let mut path = SimulatedPath::empty(sim.n_obligors());
        for i in (c * chunk_size)..((c + 1) * chunk_size).min(total) {
            sim.simulate_into(i as u64, &mut scratch, &mut path);
            visit(&mut acc, &path);
        }
        acc
    };

    #[cfg(feature = "parallel")]
    let parts: Vec<A> = (0..n_chunks).into_par_iter().map(chunk).collect();
    #[cfg(not(feature = "parallel"))]
    let parts: Vec<A> = (0..n_chunks).map(chunk).collect();

    let mut parts = parts.into_iter();
    let mut acc = parts.next().unwrap_or_else(&init);
    for part in parts {
        merge(&mut acc, part);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::basket::DateGrid;
    use crate::credit::factor::CorrelationSpec;
    use crate::credit::name::CreditName;
    use crate::credit::survival_curve::SurvivalCurve;
    use crate::mc::sampler::StratifiedConfig;

    fn basket() -> Basket {
        Basket::builder()
            .names((0..6).map(|i| {
                CreditName::new(
                    format!("N{i}"),
                    Arc::new(SurvivalCurve::flat(0.05 + 0.01 * i as f64).unwrap()),
                    Recovery::flat(0.4).unwrap(),
                    1.0,
                )
                .with_refinance(Arc::new(SurvivalCurve::flat(0.05).unwrap()))
            }))
            .correlation(CorrelationSpec::Flat(0.4))
            .dates(DateGrid::new(vec![1.0, 2.0, 3.0]).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn same_index_gives_the_same_path() {
        let sim = PathSimulator::new(&basket(), &McConfig::default()).unwrap();
        assert_eq!(sim.simulate_path(17), sim.simulate_path(17));
        assert_ne!(sim.simulate_path(17), sim.simulate_path(18));
    }

    #[test]
    fn stratified_paths_hit_the_requested_count() {
        let cfg = McConfig {
            sampler: Sampler::Stratified(StratifiedConfig::single(7)),
            ..McConfig::default()
        };
        let sim = PathSimulator::new(&basket(), &cfg).unwrap();
        for (q, path) in simulate_paths(&sim, 0..7).iter().enumerate() {
            assert_eq!(path.defaults_by(2), q);
            assert!(path.weight > 0.0);
        }
    }

    #[test]
    fn default_precedes_prepayment() {
        let sim = PathSimulator::new(&basket(), &McConfig::default()).unwrap();
        for path in simulate_paths(&sim, 0..200) {
            for i in 0..6 {
                for j in 0..3 {
                    assert!(!(path.is_defaulted(i, j) && path.is_prepaid(i, j)));
                }
            }
        }
    }

    #[test]
    fn chunking_does_not_change_the_fold() {
        let cfg = McConfig {
            paths: 301,
            ..McConfig::default()
        };
        let sim = PathSimulator::new(&basket(), &cfg).unwrap();
        let sum = |chunk| {
            fold_paths(&sim, chunk, Vec::new, |acc: &mut Vec<u64>, p| acc.push(p.index), |a, b| a.extend(b))
                .unwrap()
        };
        let expected: Vec<u64> = (0..301).collect();
        assert_eq!(sum(7), expected);
        assert_eq!(sum(1000), expected);
    }
}
