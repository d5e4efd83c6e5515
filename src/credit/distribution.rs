//! Loss and amortization distributions produced by the basket engines.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::core::{CreditError, Result};

use super::loss_grid::SNAP_TOLERANCE;

/// Probability mass function on an evenly spaced amount axis (`pmf[k]` at `k * unit`).
#[derive(Debug, Clone, PartialEq)]
pub struct GridDistribution {
    pub unit: f64,
    pub pmf: Vec<f64>,
}

impl GridDistribution {
    /// All mass on the amount `level * unit`.
    pub fn point_mass(unit: f64, top: usize, level: usize) -> Self {
        let mut pmf = vec![0.0; top + 1];
        pmf[level.min(top)] = 1.0;
        Self { unit, pmf }
    }

    /// Weighted histogram normalized to a probability mass function.
    pub fn from_weights(unit: f64, weights: Vec<f64>) -> Result<Self> {
        let total = weights.iter().sum::<f64>();
        if !(total > 0.0) || !total.is_finite() {
            return Err(CreditError::NumericalError(
                "distribution weights must have a positive finite sum".to_string(),
            ));
        }
        Ok(Self {
            unit,
            pmf: weights.into_iter().map(|w| w / total).collect(),
        })
    }

    pub fn top(&self) -> usize {
        self.pmf.len().saturating_sub(1)
    }

    /// `P(L <= amount)`.
    pub fn cdf(&self, amount: f64) -> f64 {
        if amount < 0.0 {
            return 0.0;
        }
        if self.unit <= 0.0 {
            return 1.0;
        }
        let y = amount / self.unit;
        if y >= self.top() as f64 {
            return 1.0;
        }
        let k = (y + SNAP_TOLERANCE * y.max(1.0)).floor() as usize;
        self.pmf[..=k.min(self.top())].iter().sum::<f64>().clamp(0.0, 1.0)
    }

    /// `E[min(L, amount)]`.
    pub fn expected_min(&self, amount: f64) -> f64 {
        if amount <= 0.0 {
            return 0.0;
        }
        self.pmf
            .iter()
            .enumerate()
            .map(|(k, p)| p * (k as f64 * self.unit).min(amount))
            .sum()
    }

    pub fn mean(&self) -> f64 {
        self.pmf
            .iter()
            .enumerate()
            .map(|(k, p)| p * k as f64 * self.unit)
            .sum()
    }
}

/// Per-date loss and amortization distributions of a basket.
#[derive(Debug, Clone, PartialEq)]
pub struct BasketDistribution {
    pub loss: Vec<GridDistribution>,
    pub amortization: Vec<GridDistribution>,
}

/// Lazily computed [`BasketDistribution`], dropped by `clear`.
#[derive(Debug, Default)]
pub struct DistributionCache(OnceLock<BasketDistribution>);

impl DistributionCache {
    pub fn get_or_try_init<F>(&self, compute: F) -> Result<&BasketDistribution>
    where
        F: FnOnce() -> Result<BasketDistribution>,
    {
        if let Some(d) = self.0.get() {
            return Ok(d);
        }
        let d = compute()?;
        Ok(self.0.get_or_init(|| d))
    }

    pub fn is_cached(&self) -> bool {
        self.0.get().is_some()
    }

    pub fn clear(&mut self) {
        self.0.take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionKind {
    /// `P(L_t <= x * P)`.
    CumulativeProbability,
    /// `E[min(L_t, x * P)]`, the expected loss of the base tranche `[0, x]`.
    ExpectedLoss,
    /// `E[min(A_t, x * P)]` for the amortized amount `A_t`.
    ExpectedAmortization,
}

/// Dense `dates x levels` table of distribution values, row-major by date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossDistributionGrid {
    pub kind: DistributionKind,
    pub dates: Vec<f64>,
    /// Loss levels as fractions of `notional`.
    pub levels: Vec<f64>,
    pub notional: f64,
    pub values: Vec<f64>,
}

impl LossDistributionGrid {
    pub fn value(&self, date_index: usize, level_index: usize) -> f64 {
        self.values[date_index * self.levels.len() + level_index]
    }

    pub fn row(&self, date_index: usize) -> &[f64] {
        let n = self.levels.len();
        &self.values[date_index * n..(date_index + 1) * n]
    }

    pub fn n_dates(&self) -> usize {
        self.dates.len()
    }

    /// Index of `date` on the date axis (exact lookup).
    pub fn date_index(&self, date: f64) -> Result<usize> {
        find_date(&self.dates, date)
    }
}

pub(crate) fn find_date(dates: &[f64], date: f64) -> Result<usize> {
    dates
        .iter()
        .position(|&t| (t - date).abs() <= 1.0e-9 * t.abs().max(1.0))
        .ok_or_else(|| CreditError::invalid(format!("date {date} is not on the basket date grid")))
}
