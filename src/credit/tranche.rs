//! Tranche definitions and the mapping from distribution grids to tranche quantities.
//!
//! A tranche `[a, d]` (fractions of the basket notional `P`) absorbs the portfolio loss
//! between `a P` and `d P`, so its expected loss is `E[min(L, dP)] - E[min(L, aP)]`.
//! Amortization is allocated from the top of the capital structure, so the same tranche
//! amortizes by `E[min(A, (1 - a) P)] - E[min(A, (1 - d) P)]`.
//!
//! Values between grid levels are interpolated linearly; dates are looked up exactly.

use serde::{Deserialize, Serialize};

use crate::core::{CreditError, Result};

use super::basket::{Basket, BasketLossModel};
use super::distribution::{DistributionKind, LossDistributionGrid};

/// Loss window `[low, high]` as fractions of the basket notional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWindow {
    pub low: f64,
    pub high: f64,
}

impl LossWindow {
    pub fn new(low: f64, high: f64) -> Result<Self> {
        if !low.is_finite() || !high.is_finite() || low < 0.0 || high > 1.0 {
            return Err(CreditError::invalid(format!(
                "tranche [{low}, {high}] must lie within [0, 1]"
            )));
        }
        if low > high {
            return Err(CreditError::invalid(format!(
                "attachment {low} exceeds detachment {high}"
            )));
        }
        Ok(Self { low, high })
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrancheSpec {
    LossWindow { attachment: f64, detachment: f64 },
    /// Covers the `first`-th to `(first + num_covered - 1)`-th defaults.
    NthToDefault { first: usize, num_covered: usize },
}

impl TrancheSpec {
    pub fn validate(&self, n_names: usize) -> Result<()> {
        match *self {
            Self::LossWindow {
                attachment,
                detachment,
            } => LossWindow::new(attachment, detachment).map(|_| ()),
            Self::NthToDefault { first, num_covered } => {
                if first < 1 {
                    return Err(CreditError::invalid("nth-to-default needs first >= 1"));
                }
                if num_covered < 1 {
                    return Err(CreditError::invalid("nth-to-default needs num_covered >= 1"));
                }
                if first - 1 + num_covered > n_names {
                    return Err(CreditError::invalid(format!(
                        "defaults {first}..{} exceed the {n_names} names of the basket",
                        first - 1 + num_covered
                    )));
                }
                Ok(())
            }
        }
    }

    /// Loss window of the tranche in a pool of `n_names` equal exposures recovering
    /// `recovery`: `((1 - R)(first - 1) / N, (1 - R)(first - 1 + num) / N)`.
    pub fn loss_window(&self, n_names: usize, recovery: f64) -> Result<LossWindow> {
        self.validate(n_names)?;
        match *self {
            Self::LossWindow {
                attachment,
                detachment,
            } => LossWindow::new(attachment, detachment),
            Self::NthToDefault { first, num_covered } => {
                if !(0.0..=1.0).contains(&recovery) {
                    return Err(CreditError::invalid(format!(
                        "recovery {recovery} is outside [0, 1]"
                    )));
                }
                let lgd = 1.0 - recovery;
                let n = n_names as f64;
                LossWindow::new(
                    lgd * (first - 1) as f64 / n,
                    lgd * (first - 1 + num_covered) as f64 / n,
                )
            }
        }
    }

    /// Loss window on `basket` at `date`. Nth-to-default tranches need every obligor to
    /// carry the same principal and recovery.
    pub fn for_basket(&self, basket: &Basket, date: f64) -> Result<LossWindow> {
        let idx = basket.date_index(date)?;
        let t = basket.dates()[idx];
        match self {
            Self::LossWindow { .. } => self.loss_window(basket.len(), 0.0),
            Self::NthToDefault { .. } => {
                let names = basket.names();
                let first = &names[0];
                let equal = names.iter().all(|n| {
                    (n.principal - first.principal).abs() <= 1.0e-12 * first.principal.abs()
                        && n.recovery == first.recovery
                });
                if !equal || basket.has_shorts() {
                    return Err(CreditError::unsupported(
                        "nth-to-default windows need equal long exposures and recoveries",
                    ));
                }
                self.loss_window(names.len(), first.recovery.rate(t))
            }
        }
    }
}

/// Expected loss of `spec` on `model` at `date`.
pub fn tranche_expected_loss<M: BasketLossModel + ?Sized>(
    model: &M,
    spec: &TrancheSpec,
    date: f64,
) -> Result<f64> {
    let window = spec.for_basket(model.basket(), date)?;
    model.accumulated_loss(date, window.low, window.high)
}

/// Expected amortization of `spec` on `model` at `date`.
pub fn tranche_amortization<M: BasketLossModel + ?Sized>(
    model: &M,
    spec: &TrancheSpec,
    date: f64,
) -> Result<f64> {
    let window = spec.for_basket(model.basket(), date)?;
    model.amortized_amount(date, window.low, window.high)
}

fn expect_kind(grid: &LossDistributionGrid, kind: DistributionKind) -> Result<()> {
    if grid.kind != kind {
        return Err(CreditError::invalid(format!(
            "distribution grid holds {:?}, expected {kind:?}",
            grid.kind
        )));
    }
    Ok(())
}

/// Linear interpolation of a row on the level axis. `anchor` adds a known value outside
/// the tabulated levels (zero expected loss at level 0, probability one at level 1).
fn interpolate(levels: &[f64], row: &[f64], x: f64, anchor: Option<(f64, f64)>) -> f64 {
    let mut xs = Vec::with_capacity(levels.len() + 1);
    let mut ys = Vec::with_capacity(levels.len() + 1);
    if let Some((ax, ay)) = anchor
        && ax < levels[0]
    {
        xs.push(ax);
        ys.push(ay);
    }
    xs.extend_from_slice(levels);
    ys.extend_from_slice(row);
    if let Some((ax, ay)) = anchor
        && ax > levels[levels.len() - 1]
    {
        xs.push(ax);
        ys.push(ay);
    }

    if x <= xs[0] {
        return ys[0];
    }
    let last = xs.len() - 1;
    if x >= xs[last] {
        return ys[last];
    }
    let i = xs.partition_point(|&v| v <= x);
    let (x0, x1) = (xs[i - 1], xs[i]);
    let w = (x - x0) / (x1 - x0);
    ys[i - 1] + w * (ys[i] - ys[i - 1])
}

/// Expected loss of `window` at `date` from an expected-loss grid.
pub fn expected_tranche_loss(grid: &LossDistributionGrid, date: f64, window: LossWindow) -> Result<f64> {
    expect_kind(grid, DistributionKind::ExpectedLoss)?;
    let row = grid.row(grid.date_index(date)?);
    let base = |x: f64| interpolate(&grid.levels, row, x, Some((0.0, 0.0)));
    Ok((base(window.high) - base(window.low)).max(0.0))
}

/// Expected amortization of `window` at `date` from an expected-amortization grid.
pub fn expected_tranche_amortization(
    grid: &LossDistributionGrid,
    date: f64,
    window: LossWindow,
) -> Result<f64> {
    expect_kind(grid, DistributionKind::ExpectedAmortization)?;
    let row = grid.row(grid.date_index(date)?);
    let base = |x: f64| interpolate(&grid.levels, row, x, Some((0.0, 0.0)));
    Ok((base(1.0 - window.low) - base(1.0 - window.high)).max(0.0))
}

/// `P(L <= level * notional)` at `date` from a cumulative-probability grid.
pub fn cumulative_probability(grid: &LossDistributionGrid, date: f64, level: f64) -> Result<f64> {
    expect_kind(grid, DistributionKind::CumulativeProbability)?;
    if !(0.0..=1.0).contains(&level) {
        return Err(CreditError::invalid(format!("level {level} is outside [0, 1]")));
    }
    let row = grid.row(grid.date_index(date)?);
    Ok(interpolate(&grid.levels, row, level, Some((1.0, 1.0))).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn grid(kind: DistributionKind, levels: Vec<f64>, values: Vec<f64>) -> LossDistributionGrid {
        LossDistributionGrid {
            kind,
            dates: vec![1.0],
            levels,
            notional: 100.0,
            values,
        }
    }

    #[test]
    fn malformed_tranches_are_rejected() {
        assert!(LossWindow::new(0.2, 0.1).is_err());
        assert!(LossWindow::new(-0.1, 0.1).is_err());
        assert!(LossWindow::new(0.1, 1.1).is_err());
        assert_eq!(LossWindow::new(0.1, 0.1).unwrap().width(), 0.0);

        let ntd = |first, num_covered| TrancheSpec::NthToDefault { first, num_covered };
        assert!(ntd(0, 1).validate(10).is_err());
        assert!(ntd(1, 0).validate(10).is_err());
        assert!(ntd(8, 4).validate(10).is_err());
        assert!(ntd(7, 4).validate(10).is_ok());
    }

    #[test]
    fn ntd_window_scales_by_loss_given_default() {
        let w = TrancheSpec::NthToDefault {
            first: 2,
            num_covered: 4,
        }
        .loss_window(100, 0.4)
        .unwrap();
        assert_relative_eq!(w.low, 0.006, epsilon = 1e-15);
        assert_relative_eq!(w.high, 0.03, epsilon = 1e-15);
    }

    #[test]
    fn expected_loss_interpolates_between_levels() {
        let g = grid(DistributionKind::ExpectedLoss, vec![0.1, 0.2], vec![4.0, 6.0]);
        let w = LossWindow::new(0.05, 0.15).unwrap();
        // Base values: 2.0 at 0.05 (anchored at zero) and 5.0 at 0.15.
        assert_relative_eq!(expected_tranche_loss(&g, 1.0, w).unwrap(), 3.0, epsilon = 1e-12);
        assert!(expected_tranche_loss(&g, 2.0, w).is_err());
    }

    #[test]
    fn cumulative_probability_reaches_one_at_the_top() {
        let g = grid(
            DistributionKind::CumulativeProbability,
            vec![0.0, 0.5],
            vec![0.6, 0.9],
        );
        assert_relative_eq!(cumulative_probability(&g, 1.0, 0.25).unwrap(), 0.75);
        assert_relative_eq!(cumulative_probability(&g, 1.0, 1.0).unwrap(), 1.0);
        assert_relative_eq!(cumulative_probability(&g, 1.0, 0.75).unwrap(), 0.95);
    }

    #[test]
    fn grid_kind_must_match_the_query() {
        let g = grid(DistributionKind::ExpectedLoss, vec![0.5], vec![1.0]);
        assert!(cumulative_probability(&g, 1.0, 0.5).is_err());
        let w = LossWindow::new(0.0, 0.5).unwrap();
        assert!(expected_tranche_amortization(&g, 1.0, w).is_err());
    }
}
