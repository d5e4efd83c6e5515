//! Credit baskets and the family of loss models built on them.
//!
//! A [`Basket`] owns the validated, normalized inputs: aggregated obligors, canonical
//! factor loadings, copula, date and level grids and the discretization config. Loss
//! models implement [`BasketLossModel`] by providing three per-date primitives (loss CDF,
//! capped expected loss, capped expected amortization); tranche expected loss,
//! amortization and full distribution grids are derived from those in one place.
//!
//! | Model | Engine | Restrictions |
//! |---|---|---|
//! | [`UniformBasket`] | factor-integrated binomial on the default count | identical names, one factor, no shorts/prepayment/dispersion/defaulted names |
//! | [`HomogeneousBasket`] | binomial / trinomial placement on the loss grid | identical names |
//! | [`HeterogeneousBasket`] | full conditional recursion | none |
//! | [`LargePoolBasket`] | infinitely granular pool | one non-negative factor, no shorts |
//! | [`NthToDefaultBasket`] | recursion on the default count | identical exposure per name, no shorts/prepayment/dispersion |
//! | [`CdoSquaredBasket`] | outer recursion or Monte Carlo over inner tranches | no shorts/prepayment |
//! | [`MonteCarloBasket`] | plain or stratified simulation | none |

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::{CreditError, Result};

use super::config::LossModelConfig;
use super::copula::Copula;
use super::distribution::{DistributionKind, LossDistributionGrid, find_date};
use super::factor::{CorrelationSpec, FactorLoadings};
use super::name::CreditName;
use super::survival_curve::SurvivalTermStructure;
use super::tranche::LossWindow;

pub mod cdo_squared;
pub mod dates;
pub mod large_pool;
pub mod monte_carlo;
pub mod nth_to_default;
pub(crate) mod schedule;
pub mod semi_analytic;
pub mod uniform;

pub use cdo_squared::{CdoSquaredBasket, CdoSquaredMethod, InnerTranche};
pub use dates::DateGrid;
pub use large_pool::LargePoolBasket;
pub use monte_carlo::MonteCarloBasket;
pub use nth_to_default::NthToDefaultBasket;
pub use semi_analytic::{HeterogeneousBasket, HomogeneousBasket};
pub use uniform::UniformBasket;

/// Validated basket inputs.
#[derive(Debug, Clone)]
pub struct Basket {
    names: Vec<CreditName>,
    /// Obligor index of each entry the basket was built from.
    owners: Vec<usize>,
    correlation: CorrelationSpec,
    base_loadings: FactorLoadings,
    loadings: FactorLoadings,
    factor_scale: f64,
    copula: Copula,
    dates: Vec<f64>,
    levels: Vec<f64>,
    config: LossModelConfig,
    notional: f64,
}

#[derive(Debug, Clone, Default)]
pub struct BasketBuilder {
    names: Vec<CreditName>,
    correlation: CorrelationSpec,
    copula: Copula,
    dates: Option<DateGrid>,
    levels: Option<Vec<f64>>,
    config: LossModelConfig,
}

impl BasketBuilder {
    pub fn name(mut self, name: CreditName) -> Self {
        self.names.push(name);
        self
    }

    pub fn names(mut self, names: impl IntoIterator<Item = CreditName>) -> Self {
        self.names.extend(names);
        self
    }

    pub fn correlation(mut self, correlation: CorrelationSpec) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn copula(mut self, copula: Copula) -> Self {
        self.copula = copula;
        self
    }

    pub fn dates(mut self, dates: DateGrid) -> Self {
        self.dates = Some(dates);
        self
    }

    /// Loss levels (fractions of the notional) used for distribution grids.
    pub fn levels(mut self, levels: Vec<f64>) -> Self {
        self.levels = Some(levels);
        self
    }

    pub fn config(mut self, config: LossModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Basket> {
        self.config.validate()?;
        let dates = self
            .dates
            .ok_or_else(|| CreditError::invalid("basket needs a date grid"))?;
        let levels = self.levels.unwrap_or_else(|| vec![0.0, 1.0]);
        validate_levels(&levels)?;
        if self.names.is_empty() {
            return Err(CreditError::invalid("basket needs at least one name"));
        }
        for name in &self.names {
            name.validate()?;
        }

        let (names, owners) = aggregate(self.names, dates.times())?;
        let loadings = resolve_loadings(&self.correlation, &owners)?;

        let mut basket = Basket {
            names,
            owners,
            correlation: self.correlation,
            base_loadings: loadings.clone(),
            loadings,
            factor_scale: 1.0,
            copula: self.copula,
            dates: dates.times().to_vec(),
            levels,
            config: self.config,
            notional: 0.0,
        };
        basket.refresh_notional()?;
        debug!(
            entries = basket.owners.len(),
            obligors = basket.names.len(),
            factors = basket.loadings.n_factors(),
            dates = basket.dates.len(),
            notional = basket.notional,
            "built credit basket"
        );
        Ok(basket)
    }
}

/// Pools entries that share an identifier into one obligor. Returns the obligors and the
/// obligor index of every entry.
fn aggregate(entries: Vec<CreditName>, dates: &[f64]) -> Result<(Vec<CreditName>, Vec<usize>)> {
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut names: Vec<CreditName> = Vec::with_capacity(entries.len());
    let mut owners: Vec<usize> = Vec::with_capacity(entries.len());

    for entry in entries {
        match by_id.get(&entry.id) {
            Some(&slot) => {
                if !names[slot].same_obligor(&entry, dates) {
                    return Err(CreditError::invalid(format!(
                        "entries for {} disagree on curves, recovery or default time",
                        entry.id
                    )));
                }
                names[slot].principal += entry.principal;
                owners.push(slot);
            }
            None => {
                by_id.insert(entry.id.clone(), names.len());
                owners.push(names.len());
                names.push(entry);
            }
        }
    }
    Ok((names, owners))
}

/// Canonical loadings of the obligors from a correlation input laid out per entry.
///
/// Entries pooled into one obligor must carry identical loading rows.
fn resolve_loadings(correlation: &CorrelationSpec, owners: &[usize]) -> Result<FactorLoadings> {
    let per_entry = FactorLoadings::from_spec(correlation, owners.len())?;
    let mut first: Vec<usize> = Vec::new();
    for (e, &o) in owners.iter().enumerate() {
        if o == first.len() {
            first.push(e);
        } else if per_entry.row(first[o]) != per_entry.row(e) {
            return Err(CreditError::invalid(format!(
                "entries {} and {e} share an identifier but not their factor loadings",
                first[o]
            )));
        }
    }
    Ok(per_entry.select(&first))
}

fn validate_levels(levels: &[f64]) -> Result<()> {
    if levels.is_empty() {
        return Err(CreditError::invalid("level grid must not be empty"));
    }
    if levels.iter().any(|x| !x.is_finite() || !(0.0..=1.0).contains(x)) {
        return Err(CreditError::invalid("levels must lie in [0, 1]"));
    }
    if levels.windows(2).any(|w| w[1] <= w[0]) {
        return Err(CreditError::invalid("levels must be strictly ascending"));
    }
    Ok(())
}

impl Basket {
    pub fn builder() -> BasketBuilder {
        BasketBuilder::default()
    }

    pub fn names(&self) -> &[CreditName] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn loadings(&self) -> &FactorLoadings {
        &self.loadings
    }

    pub fn correlation(&self) -> &CorrelationSpec {
        &self.correlation
    }

    pub fn copula(&self) -> Copula {
        self.copula
    }

    pub fn dates(&self) -> &[f64] {
        &self.dates
    }

    pub fn levels(&self) -> &[f64] {
        &self.levels
    }

    pub fn config(&self) -> &LossModelConfig {
        &self.config
    }

    pub fn factor_scale(&self) -> f64 {
        self.factor_scale
    }

    /// Sum of long principal; loss levels are fractions of this amount.
    pub fn notional(&self) -> f64 {
        self.notional
    }

    pub fn date_index(&self, date: f64) -> Result<usize> {
        find_date(&self.dates, date)
    }

    pub fn has_shorts(&self) -> bool {
        self.names.iter().any(CreditName::is_short)
    }

    pub fn has_prepayment(&self) -> bool {
        self.names.iter().any(|n| n.refinance.is_some())
    }

    pub fn has_stochastic_recovery(&self) -> bool {
        self.names.iter().any(|n| n.recovery.is_stochastic())
    }

    pub fn has_defaulted(&self) -> bool {
        self.names.iter().any(|n| n.default_time.is_some())
    }

    /// Whether all obligors share curve, recovery, principal and loadings.
    pub fn is_homogeneous(&self) -> bool {
        let Some(first) = self.names.first() else {
            return true;
        };
        self.loadings.is_uniform()
            && self.names.iter().all(|n| {
                n.same_obligor_terms(first, &self.dates)
                    && (n.principal - first.principal).abs() <= 1.0e-12 * first.principal.abs()
            })
    }

    pub fn set_principal(&mut self, id: &str, principal: f64) -> Result<()> {
        if !principal.is_finite() {
            return Err(CreditError::invalid("principal must be finite"));
        }
        let name = self.find_mut(id)?;
        let previous = name.principal;
        name.principal = principal;
        if let Err(e) = self.refresh_notional() {
            self.find_mut(id)?.principal = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn set_survival(&mut self, id: &str, curve: Arc<dyn SurvivalTermStructure>) -> Result<()> {
        self.find_mut(id)?.survival = curve;
        Ok(())
    }

    /// Replaces the correlation input; the current factor scale is re-applied.
    ///
    /// Like the builder input, `Factors` and `Full` are laid out per entry as originally
    /// supplied, before same-identifier entries were pooled. After
    /// [`split_defaulted`](Self::split_defaulted) the remaining basket has one entry per
    /// obligor.
    pub fn set_correlation(&mut self, correlation: CorrelationSpec) -> Result<()> {
        let base = resolve_loadings(&correlation, &self.owners)?;
        let loadings = base.scaled(self.factor_scale)?;
        self.correlation = correlation;
        self.base_loadings = base;
        self.loadings = loadings;
        Ok(())
    }

    /// Rescales every loading by `scale` relative to the loadings implied by the
    /// correlation input, so `set_factor(1.0)` restores them.
    pub fn set_factor(&mut self, scale: f64) -> Result<()> {
        self.loadings = self.base_loadings.scaled(scale)?;
        self.factor_scale = scale;
        Ok(())
    }

    /// Splits off names already defaulted at the first basket date.
    ///
    /// Returns the basket of remaining names and the adjustment that maps tranches of the
    /// original basket onto it.
    pub fn split_defaulted(&self) -> Result<(Basket, DefaultedAdjustment)> {
        let t0 = self.dates[0];
        let (defaulted, live): (Vec<usize>, Vec<usize>) =
            (0..self.names.len()).partition(|&i| self.names[i].is_defaulted_by(t0));
        if live.is_empty() {
            return Err(CreditError::invalid(
                "every name is already defaulted; nothing left to model",
            ));
        }

        let realized_loss = self
            .dates
            .iter()
            .map(|&t| defaulted.iter().map(|&i| self.names[i].loss_given_default(t)).sum())
            .collect();
        let recovered = self
            .dates
            .iter()
            .map(|&t| {
                defaulted
                    .iter()
                    .map(|&i| self.names[i].recovery.rate(t) * self.names[i].principal)
                    .sum()
            })
            .collect();

        let mut remaining = self.clone();
        remaining.names = live.iter().map(|&i| self.names[i].clone()).collect();
        remaining.owners = (0..live.len()).collect();
        remaining.base_loadings = self.base_loadings.select(&live);
        remaining.loadings = self.loadings.select(&live);
        remaining.correlation = match &self.correlation {
            CorrelationSpec::Flat(rho) => CorrelationSpec::Flat(*rho),
            _ => CorrelationSpec::Factors(transpose_rows(&remaining.base_loadings)),
        };
        remaining.refresh_notional()?;

        let adjustment = DefaultedAdjustment {
            original_notional: self.notional,
            remaining_notional: remaining.notional,
            realized_loss,
            recovered,
            removed: defaulted.len(),
        };
        debug!(
            removed = adjustment.removed,
            remaining = remaining.names.len(),
            "split defaulted names from basket"
        );
        Ok((remaining, adjustment))
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut CreditName> {
        self.names
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| CreditError::invalid(format!("no name with identifier {id}")))
    }

    fn refresh_notional(&mut self) -> Result<()> {
        let notional = self.names.iter().map(|n| n.principal.max(0.0)).sum::<f64>();
        if !(notional > 0.0) {
            return Err(CreditError::invalid("basket needs positive long principal"));
        }
        self.notional = notional;
        Ok(())
    }
}

fn transpose_rows(loadings: &FactorLoadings) -> Vec<Vec<f64>> {
    (0..loadings.n_factors())
        .map(|k| (0..loadings.n_names()).map(|i| loadings.row(i)[k]).collect())
        .collect()
}

/// Maps tranches of a basket onto the basket with its defaulted names removed.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultedAdjustment {
    pub original_notional: f64,
    pub remaining_notional: f64,
    /// Loss already realized by the removed names, per basket date.
    pub realized_loss: Vec<f64>,
    /// Amount already recovered from the removed names, per basket date.
    pub recovered: Vec<f64>,
    pub removed: usize,
}

/// Window of the remaining basket and the deterministic part of a shifted tranche.
fn shift_window(lower: f64, upper: f64, realized: f64, remaining: f64) -> (f64, f64, f64) {
    let deterministic = (realized - lower).clamp(0.0, upper - lower);
    let lo = ((lower - realized) / remaining).clamp(0.0, 1.0);
    let hi = ((upper - realized) / remaining).clamp(0.0, 1.0);
    (deterministic, lo, hi)
}

impl DefaultedAdjustment {
    /// Expected loss of the original tranche `[low, high]`, from a model of the remaining
    /// names.
    pub fn accumulated_loss<M: BasketLossModel + ?Sized>(
        &self,
        model: &M,
        date: f64,
        low: f64,
        high: f64,
    ) -> Result<f64> {
        LossWindow::new(low, high)?;
        let idx = model.basket().date_index(date)?;
        let p = self.original_notional;
        let (fixed, lo, hi) =
            shift_window(low * p, high * p, self.realized_loss[idx], self.remaining_notional);
        Ok(fixed + model.accumulated_loss(date, lo, hi)?)
    }

    /// `P(L <= level * notional)` of the original basket.
    pub fn cumulative_probability<M: BasketLossModel + ?Sized>(
        &self,
        model: &M,
        date: f64,
        level: f64,
    ) -> Result<f64> {
        let idx = model.basket().date_index(date)?;
        let x = level * self.original_notional - self.realized_loss[idx];
        if x < 0.0 {
            return Ok(0.0);
        }
        let y = (x / self.remaining_notional).min(1.0);
        Ok(model.calc_loss_distribution(true, date, &[y])?[0])
    }

    /// Expected amortization of the original tranche `[low, high]`.
    pub fn amortized_amount<M: BasketLossModel + ?Sized>(
        &self,
        model: &M,
        date: f64,
        low: f64,
        high: f64,
    ) -> Result<f64> {
        LossWindow::new(low, high)?;
        let idx = model.basket().date_index(date)?;
        let p = self.original_notional;
        // Amortization eats the capital structure from the top: [(1 - high) P, (1 - low) P].
        let (fixed, lo, hi) = shift_window(
            (1.0 - high) * p,
            (1.0 - low) * p,
            self.recovered[idx],
            self.remaining_notional,
        );
        Ok(fixed + model.amortized_amount(date, 1.0 - hi, 1.0 - lo)?)
    }
}

/// Common contract of the basket loss models.
///
/// Implementors provide the per-date primitives; amounts are in currency units and
/// `date_index` refers to [`BasketLossModel::dates`].
pub trait BasketLossModel {
    fn basket(&self) -> &Basket;

    /// Mutable access to the inputs. Call [`BasketLossModel::reset`] after mutating.
    fn basket_mut(&mut self) -> &mut Basket;

    /// Drops cached distributions.
    fn reset(&mut self);

    /// `P(L_t <= amount)`.
    fn loss_cdf(&self, date_index: usize, amount: f64) -> Result<f64>;

    /// `E[min(L_t, amount)]`.
    fn expected_capped_loss(&self, date_index: usize, amount: f64) -> Result<f64>;

    /// `E[min(A_t, amount)]` for the amortized amount `A_t`.
    fn expected_capped_amortization(&self, date_index: usize, amount: f64) -> Result<f64>;

    /// Amount that loss levels are fractions of.
    fn notional(&self) -> f64 {
        self.basket().notional()
    }

    fn dates(&self) -> &[f64] {
        self.basket().dates()
    }

    /// Uniformly rescales the factor loadings and invalidates cached results.
    fn set_factor(&mut self, scale: f64) -> Result<()> {
        self.basket_mut().set_factor(scale)?;
        self.reset();
        Ok(())
    }

    /// Expected loss of the tranche `[low, high]` at `date`.
    fn accumulated_loss(&self, date: f64, low: f64, high: f64) -> Result<f64> {
        let window = LossWindow::new(low, high)?;
        let idx = find_date(self.dates(), date)?;
        if window.width() == 0.0 {
            return Ok(0.0);
        }
        let p = self.notional();
        let upper = self.expected_capped_loss(idx, high * p)?;
        let lower = self.expected_capped_loss(idx, low * p)?;
        Ok((upper - lower).max(0.0))
    }

    /// Expected amortization of the tranche `[low, high]` at `date`; amortization is
    /// allocated from the top of the capital structure.
    fn amortized_amount(&self, date: f64, low: f64, high: f64) -> Result<f64> {
        let window = LossWindow::new(low, high)?;
        let idx = find_date(self.dates(), date)?;
        if window.width() == 0.0 {
            return Ok(0.0);
        }
        let p = self.notional();
        let upper = self.expected_capped_amortization(idx, (1.0 - low) * p)?;
        let lower = self.expected_capped_amortization(idx, (1.0 - high) * p)?;
        Ok((upper - lower).max(0.0))
    }

    /// Cumulative probability (`cumulative = true`) or base-tranche expected loss at each
    /// of `levels` on `date`.
    fn calc_loss_distribution(&self, cumulative: bool, date: f64, levels: &[f64]) -> Result<Vec<f64>> {
        let idx = find_date(self.dates(), date)?;
        let p = self.notional();
        levels
            .iter()
            .map(|&x| {
                if !x.is_finite() || !(0.0..=1.0).contains(&x) {
                    return Err(CreditError::invalid(format!("level {x} is outside [0, 1]")));
                }
                if cumulative {
                    self.loss_cdf(idx, x * p)
                } else {
                    self.expected_capped_loss(idx, x * p)
                }
            })
            .collect()
    }

    /// Dense distribution table over the basket's dates and levels.
    fn loss_distribution_grid(&self, kind: DistributionKind) -> Result<LossDistributionGrid> {
        let levels = self.basket().levels().to_vec();
        let dates = self.dates().to_vec();
        let p = self.notional();
        let mut values = Vec::with_capacity(dates.len() * levels.len());
        for j in 0..dates.len() {
            for &x in &levels {
                values.push(match kind {
                    DistributionKind::CumulativeProbability => self.loss_cdf(j, x * p)?,
                    DistributionKind::ExpectedLoss => self.expected_capped_loss(j, x * p)?,
                    DistributionKind::ExpectedAmortization => {
                        self.expected_capped_amortization(j, x * p)?
                    }
                });
            }
        }
        Ok(LossDistributionGrid {
            kind,
            dates,
            levels,
            notional: p,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::recovery::Recovery;
    use crate::credit::survival_curve::SurvivalCurve;

    fn name(id: &str, hazard: f64, principal: f64) -> CreditName {
        CreditName::new(
            id,
            Arc::new(SurvivalCurve::flat(hazard).unwrap()),
            Recovery::flat(0.4).unwrap(),
            principal,
        )
    }

    fn builder() -> BasketBuilder {
        Basket::builder()
            .correlation(CorrelationSpec::Flat(0.2))
            .dates(DateGrid::new(vec![1.0, 5.0]).unwrap())
    }

    #[test]
    fn repeated_identifiers_pool_their_principal() {
        let basket = builder()
            .names([name("A", 0.01, 1.0), name("B", 0.02, 2.0), name("A", 0.01, 0.5)])
            .build()
            .unwrap();
        assert_eq!(basket.len(), 2);
        assert_eq!(basket.names()[0].id, "A");
        assert!((basket.names()[0].principal - 1.5).abs() < 1e-15);
        assert!((basket.notional() - 3.5).abs() < 1e-15);
        assert_eq!(basket.loadings().n_names(), 2);
    }

    #[test]
    fn correlation_inputs_are_laid_out_per_entry() {
        let mut basket = builder()
            .names([name("A", 0.01, 1.0), name("B", 0.02, 1.0), name("A", 0.01, 1.0)])
            .correlation(CorrelationSpec::Factors(vec![vec![0.5, 0.3, 0.5]]))
            .build()
            .unwrap();
        assert_eq!(basket.len(), 2);

        basket
            .set_correlation(CorrelationSpec::Factors(vec![vec![0.4, 0.2, 0.4]]))
            .unwrap();
        assert!((basket.loadings().row(0)[0] - 0.4).abs() < 1e-15);
        assert!((basket.loadings().row(1)[0] - 0.2).abs() < 1e-15);
        assert!(matches!(
            basket.set_correlation(CorrelationSpec::Factors(vec![vec![0.4, 0.2]])),
            Err(CreditError::DimensionMismatch(_))
        ));
        assert!(matches!(
            basket.set_correlation(CorrelationSpec::Factors(vec![vec![0.4, 0.2, 0.3]])),
            Err(CreditError::InvalidInput(_))
        ));
        assert!((basket.loadings().row(1)[0] - 0.2).abs() < 1e-15);
    }

    #[test]
    fn conflicting_entries_for_one_identifier_are_rejected() {
        let err = builder()
            .names([name("A", 0.01, 1.0), name("A", 0.03, 1.0)])
            .build()
            .unwrap_err();
        assert!(matches!(err, CreditError::InvalidInput(_)));
    }

    #[test]
    fn builder_rejects_incomplete_inputs() {
        assert!(Basket::builder().name(name("A", 0.01, 1.0)).build().is_err());
        assert!(builder().build().is_err());
        assert!(
            builder()
                .name(name("A", 0.01, 1.0))
                .levels(vec![0.0, 0.3, 0.2])
                .build()
                .is_err()
        );
        assert!(builder().name(name("A", 0.01, -1.0)).build().is_err());
    }

    #[test]
    fn principal_updates_roll_back_when_no_long_exposure_remains() {
        let mut basket = builder().names([name("A", 0.01, 1.0), name("B", 0.01, 2.0)]).build().unwrap();
        basket.set_principal("B", 4.0).unwrap();
        assert!((basket.notional() - 5.0).abs() < 1e-15);

        basket.set_principal("A", -1.0).unwrap();
        assert!((basket.notional() - 4.0).abs() < 1e-15);
        assert!(basket.set_principal("B", -2.0).is_err());
        assert!((basket.names()[1].principal - 4.0).abs() < 1e-15);
        assert!(basket.set_principal("C", 1.0).is_err());
    }

    #[test]
    fn split_needs_a_live_name() {
        let basket = builder()
            .names([
                name("A", 0.01, 1.0).with_default_time(0.5),
                name("B", 0.01, 1.0).with_default_time(0.25),
            ])
            .build()
            .unwrap();
        assert!(basket.has_defaulted());
        assert!(basket.split_defaulted().is_err());
    }
}
