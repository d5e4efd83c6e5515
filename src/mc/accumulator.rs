//! Streaming accumulators for weighted path statistics.
//!
//! Nothing here stores individual paths: moments are updated online (West's weighted
//! algorithm) and distributions are weighted histograms on a fixed loss grid, so memory
//! does not grow with the path count. Partial accumulators merge exactly (Chan et al.),
//! which is how chunks computed on different workers are combined.

use crate::core::Result;
use crate::credit::distribution::{BasketDistribution, GridDistribution};
use crate::credit::loss_grid::{LossGrid, deposit};

use super::McStatistics;
use super::engine::{PathSimulator, SimulatedPath};

/// Weighted running mean and variance.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OnlineMoments {
    weight: f64,
    weight_sq: f64,
    mean: f64,
    m2: f64,
    count: u64,
}

impl OnlineMoments {
    pub fn push(&mut self, x: f64, w: f64) {
        self.count += 1;
        if w <= 0.0 {
            return;
        }
        self.weight += w;
        self.weight_sq += w * w;
        let delta = x - self.mean;
        self.mean += delta * w / self.weight;
        self.m2 += w * delta * (x - self.mean);
    }

    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        if other.weight <= 0.0 {
            return;
        }
        if self.weight <= 0.0 {
            *self = Self {
                count: self.count,
                ..*other
            };
            return;
        }
        let total = self.weight + other.weight;
        let delta = other.mean - self.mean;
        self.mean += delta * other.weight / total;
        self.m2 += other.m2 + delta * delta * self.weight * other.weight / total;
        self.weight = total;
        self.weight_sq += other.weight_sq;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Self-normalized weighted mean.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.weight > 0.0 {
            self.m2 / self.weight
        } else {
            0.0
        }
    }

    /// Standard error of the mean using the effective sample size
    /// `(sum w)^2 / sum w^2`.
    pub fn standard_error(&self) -> f64 {
        if self.weight_sq <= 0.0 {
            return 0.0;
        }
        let effective = self.weight * self.weight / self.weight_sq;
        if effective <= 1.0 {
            return 0.0;
        }
        (self.variance() / (effective - 1.0)).sqrt()
    }
}

/// Per-date moments and histograms of simulated loss, defaults and amortization.
#[derive(Debug, Clone)]
pub struct PathAggregator {
    loss_grid: LossGrid,
    amort_grid: LossGrid,
    n_dates: usize,
    loss_hist: Vec<f64>,
    amort_hist: Vec<f64>,
    loss: Vec<OnlineMoments>,
    defaults: Vec<OnlineMoments>,
    amortization: Vec<OnlineMoments>,
}

impl PathAggregator {
    pub fn new(n_dates: usize, loss_grid: LossGrid, amort_grid: LossGrid) -> Self {
        Self {
            loss_grid,
            amort_grid,
            n_dates,
            loss_hist: vec![0.0; n_dates * loss_grid.width()],
            amort_hist: vec![0.0; n_dates * amort_grid.width()],
            loss: vec![OnlineMoments::default(); n_dates],
            defaults: vec![OnlineMoments::default(); n_dates],
            amortization: vec![OnlineMoments::default(); n_dates],
        }
    }

    pub fn observe(&mut self, sim: &PathSimulator, path: &SimulatedPath) {
        let w = path.weight;
        let (wl, wa) = (self.loss_grid.width(), self.amort_grid.width());
        for j in 0..self.n_dates {
            let loss = sim.loss_at(path, j).max(0.0);
            let amort = sim.amortization_at(path, j).max(0.0);
            self.loss[j].push(loss, w);
            self.amortization[j].push(amort, w);
            self.defaults[j].push(path.defaults_by(j) as f64, w);
            if w > 0.0 {
                deposit(&mut self.loss_hist[j * wl..(j + 1) * wl], self.loss_grid.units(loss), w);
                deposit(&mut self.amort_hist[j * wa..(j + 1) * wa], self.amort_grid.units(amort), w);
            }
        }
    }

    pub fn merge(&mut self, other: Self) {
        for (a, b) in self.loss_hist.iter_mut().zip(&other.loss_hist) {
            *a += b;
        }
        for (a, b) in self.amort_hist.iter_mut().zip(&other.amort_hist) {
            *a += b;
        }
        for (a, b) in self.loss.iter_mut().zip(&other.loss) {
            a.merge(b);
        }
        for (a, b) in self.defaults.iter_mut().zip(&other.defaults) {
            a.merge(b);
        }
        for (a, b) in self.amortization.iter_mut().zip(&other.amortization) {
            a.merge(b);
        }
    }

    pub fn finish(self, dates: &[f64]) -> Result<(BasketDistribution, McStatistics)> {
        let (wl, wa) = (self.loss_grid.width(), self.amort_grid.width());
        let loss = self
            .loss_hist
            .chunks(wl)
            .map(|h| GridDistribution::from_weights(self.loss_grid.unit, h.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        let amortization = self
            .amort_hist
            .chunks(wa)
            .map(|h| GridDistribution::from_weights(self.amort_grid.unit, h.to_vec()))
            .collect::<Result<Vec<_>>>()?;

        let stats = McStatistics {
            dates: dates.to_vec(),
            expected_loss: self.loss.iter().map(OnlineMoments::mean).collect(),
            loss_stderr: self.loss.iter().map(OnlineMoments::standard_error).collect(),
            expected_defaults: self.defaults.iter().map(OnlineMoments::mean).collect(),
            defaults_stderr: self.defaults.iter().map(OnlineMoments::standard_error).collect(),
            expected_amortization: self.amortization.iter().map(OnlineMoments::mean).collect(),
            amortization_stderr: self
                .amortization
                .iter()
                .map(OnlineMoments::standard_error)
                .collect(),
            paths: self.loss.first().map_or(0, |m| m.count() as usize),
            weight_sum: self.loss.first().map_or(0.0, OnlineMoments::weight),
        };
        Ok((BasketDistribution { loss, amortization }, stats))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn weighted_moments_match_direct_formulas() {
        let data = [(1.0, 0.5), (3.0, 1.0), (-2.0, 0.25), (4.0, 2.0), (0.5, 0.0)];
        let mut m = OnlineMoments::default();
        for &(x, w) in &data {
            m.push(x, w);
        }
        let sw = data.iter().map(|d| d.1).sum::<f64>();
        let mean = data.iter().map(|d| d.0 * d.1).sum::<f64>() / sw;
        let var = data.iter().map(|d| d.1 * (d.0 - mean).powi(2)).sum::<f64>() / sw;
        assert_relative_eq!(m.mean(), mean, epsilon = 1e-14);
        assert_relative_eq!(m.variance(), var, epsilon = 1e-13);
        assert_eq!(m.count(), 5);
    }

    #[test]
    fn merging_partials_equals_one_pass() {
        let xs: Vec<f64> = (0..50).map(|i| ((i * 37) % 11) as f64 * 0.3).collect();
        let mut whole = OnlineMoments::default();
        let mut left = OnlineMoments::default();
        let mut right = OnlineMoments::default();
        for (i, &x) in xs.iter().enumerate() {
            let w = 1.0 + (i % 3) as f64;
            whole.push(x, w);
            if i < 20 {
                left.push(x, w);
            } else {
                right.push(x, w);
            }
        }
        left.merge(&right);
        assert_relative_eq!(left.mean(), whole.mean(), epsilon = 1e-13);
        assert_relative_eq!(left.variance(), whole.variance(), epsilon = 1e-12);
        assert_eq!(left.count(), whole.count());
    }

    #[test]
    fn empty_accumulator_is_zero() {
        let m = OnlineMoments::default();
        assert_eq!(m.mean(), 0.0);
        assert_eq!(m.standard_error(), 0.0);
    }
}
