//! Reference entities (names) of a basket.

use std::sync::Arc;

use crate::core::{CreditError, Result};

use super::recovery::Recovery;
use super::survival_curve::SurvivalTermStructure;

/// One position in a credit basket.
///
/// Curves are shared through `Arc`, so many names (and many baskets) can reference one
/// fitted curve without copying it. A negative principal is a short position.
#[derive(Debug, Clone)]
pub struct CreditName {
    pub id: String,
    pub survival: Arc<dyn SurvivalTermStructure>,
    pub recovery: Recovery,
    /// Probability the position is still outstanding (not refinanced) at `t`.
    pub refinance: Option<Arc<dyn SurvivalTermStructure>>,
    pub principal: f64,
    /// Known default time; the name is treated as defaulted at every date on or after it.
    pub default_time: Option<f64>,
}

impl CreditName {
    pub fn new(
        id: impl Into<String>,
        survival: Arc<dyn SurvivalTermStructure>,
        recovery: Recovery,
        principal: f64,
    ) -> Self {
        Self {
            id: id.into(),
            survival,
            recovery,
            refinance: None,
            principal,
            default_time: None,
        }
    }

    pub fn with_refinance(mut self, curve: Arc<dyn SurvivalTermStructure>) -> Self {
        self.refinance = Some(curve);
        self
    }

    pub fn with_default_time(mut self, t: f64) -> Self {
        self.default_time = Some(t);
        self
    }

    pub fn is_short(&self) -> bool {
        self.principal < 0.0
    }

    pub fn is_defaulted_by(&self, t: f64) -> bool {
        self.default_time.is_some_and(|tau| tau <= t)
    }

    /// Loss given default at `t` (signed like the principal).
    pub fn loss_given_default(&self, t: f64) -> f64 {
        (1.0 - self.recovery.rate(t)) * self.principal
    }

    /// Default probability by `t`, ignoring any pre-set default time.
    pub fn default_prob(&self, t: f64) -> f64 {
        self.survival.default_prob(t)
    }

    /// Probability of having prepaid by `t`, given no default.
    pub fn prepay_prob(&self, t: f64) -> f64 {
        self.refinance
            .as_ref()
            .map_or(0.0, |c| (1.0 - c.survival_prob(t)).clamp(0.0, 1.0))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(CreditError::invalid("name identifier must not be empty"));
        }
        if !self.principal.is_finite() {
            return Err(CreditError::invalid(format!(
                "principal of {} must be finite",
                self.id
            )));
        }
        if let Some(tau) = self.default_time
            && (!tau.is_finite() || tau < 0.0)
        {
            return Err(CreditError::invalid(format!(
                "default time of {} must be finite and >= 0",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether two entries describe the same obligor, so their principals may be pooled.
    pub(crate) fn same_obligor(&self, other: &Self, dates: &[f64]) -> bool {
        self.id == other.id && self.same_obligor_terms(other, dates)
    }

    /// Same curves, recovery and default time on `dates`, regardless of identifier.
    pub(crate) fn same_obligor_terms(&self, other: &Self, dates: &[f64]) -> bool {
        self.recovery == other.recovery
            && self.default_time == other.default_time
            && same_curve(&self.survival, &other.survival, dates)
            && match (&self.refinance, &other.refinance) {
                (None, None) => true,
                (Some(a), Some(b)) => same_curve(a, b, dates),
                _ => false,
            }
    }
}

fn same_curve(
    a: &Arc<dyn SurvivalTermStructure>,
    b: &Arc<dyn SurvivalTermStructure>,
    dates: &[f64],
) -> bool {
    Arc::ptr_eq(a, b)
        || dates
            .iter()
            .all(|&t| (a.survival_prob(t) - b.survival_prob(t)).abs() <= 1.0e-14)
}
