//! Date axis of a basket, in year fractions from the valuation date.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::core::{CreditError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateGrid {
    times: Vec<f64>,
}

impl DateGrid {
    /// Strictly ascending, non-negative year fractions.
    pub fn new(times: Vec<f64>) -> Result<Self> {
        if times.is_empty() {
            return Err(CreditError::invalid("date grid must not be empty"));
        }
        if times.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(CreditError::invalid("dates must be finite and >= 0"));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(CreditError::invalid("dates must be strictly ascending"));
        }
        Ok(Self { times })
    }

    /// `step, 2 step, ...` up to and including `horizon`.
    pub fn from_step(step: f64, horizon: f64) -> Result<Self> {
        if !(step > 0.0) || !(horizon > 0.0) || !step.is_finite() || !horizon.is_finite() {
            return Err(CreditError::invalid(format!(
                "date step ({step}) and horizon ({horizon}) must be positive"
            )));
        }
        let ratio = horizon / step;
        let whole = ratio.round();
        let times = if (ratio - whole).abs() <= 1.0e-9 * ratio.max(1.0) {
            let n = whole.max(1.0) as usize;
            (1..=n).map(|k| horizon * k as f64 / n as f64).collect()
        } else {
            let n = ratio.floor() as usize;
            let mut t = (1..=n).map(|k| step * k as f64).collect::<Vec<_>>();
            t.push(horizon);
            t
        };
        Self::new(times)
    }

    /// Calendar dates measured from `valuation` on an Act/365F basis.
    pub fn from_dates(valuation: NaiveDate, dates: &[NaiveDate]) -> Result<Self> {
        Self::new(
            dates
                .iter()
                .map(|d| (*d - valuation).num_days() as f64 / 365.0)
                .collect(),
        )
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn horizon(&self) -> f64 {
        self.times.last().copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monthly_grid_ends_exactly_on_the_horizon() {
        let g = DateGrid::from_step(1.0 / 12.0, 5.0).unwrap();
        assert_eq!(g.times().len(), 60);
        assert_eq!(g.horizon(), 5.0);
    }

    #[test]
    fn ragged_horizon_is_appended() {
        let g = DateGrid::from_step(0.5, 1.2).unwrap();
        assert_eq!(g.times(), &[0.5, 1.0, 1.2]);
    }

    #[test]
    fn calendar_dates_use_act_365_fixed() {
        let val = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let dates = [
            NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        ];
        let g = DateGrid::from_dates(val, &dates).unwrap();
        assert_eq!(g.times(), &[181.0 / 365.0, 1.0]);
        assert!(DateGrid::from_dates(val, &[dates[1], dates[0]]).is_err());
    }
}
