//! Survival-probability term structures consumed by the loss engines.
//!
//! The engines only need `S(t)` and, for default-time simulation, its inverse. Both are
//! exposed through [`SurvivalTermStructure`], so externally fitted curves can be plugged
//! in behind an `Arc` and shared by every name that references them. [`SurvivalCurve`]
//! is the log-linear reference implementation (piecewise-constant hazard between nodes).

use std::fmt::Debug;

use crate::core::{CreditError, Result};

/// Survival probability as a function of time in years.
///
/// Implementations must return values in `[0, 1]`, non-increasing in `t`, with
/// `survival_prob(t) = 1` for `t <= 0`. Refinancing (prepayment) curves use the same
/// contract, read as "probability the position is still outstanding".
pub trait SurvivalTermStructure: Debug + Send + Sync {
    fn survival_prob(&self, t: f64) -> f64;

    /// Earliest time at which survival falls to `target`, or `+inf` if it never does.
    ///
    /// The default bracket-and-bisect works for any monotone curve; implementations
    /// with a closed form should override it.
    fn inverse_survival_prob(&self, target: f64) -> f64 {
        if target >= 1.0 {
            return 0.0;
        }
        let target = target.max(0.0);

        let mut hi = 1.0_f64;
        while self.survival_prob(hi) > target {
            hi *= 2.0;
            if hi > 1.0e4 {
                return f64::INFINITY;
            }
        }
        let mut lo = 0.0_f64;
        for _ in 0..200 {
            let mid = 0.5 * (lo + hi);
            if self.survival_prob(mid) > target {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo < 1.0e-12 {
                break;
            }
        }
        hi
    }

    fn default_prob(&self, t: f64) -> f64 {
        (1.0 - self.survival_prob(t)).clamp(0.0, 1.0)
    }
}

/// Survival-probability term structure keyed by maturity tenor in years.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalCurve {
    /// Curve nodes as `(tenor, survival_probability)`.
    pub tenors: Vec<(f64, f64)>,
}

impl SurvivalCurve {
    /// Creates a survival curve from unsorted nodes.
    pub fn new(mut tenors: Vec<(f64, f64)>) -> Self {
        tenors.retain(|(t, p)| *t > 0.0 && *p > 0.0);
        tenors.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Keep nodes monotone non-increasing in probability.
        let mut cleaned: Vec<(f64, f64)> = Vec::with_capacity(tenors.len());
        let mut prev_prob = 1.0_f64;
        for (t, p) in tenors {
            let prob = p.clamp(1.0e-300, 1.0).min(prev_prob);
            if let Some(last) = cleaned.last_mut()
                && (last.0 - t).abs() <= 1.0e-12
            {
                last.1 = prob;
                prev_prob = prob;
                continue;
            }
            cleaned.push((t, prob));
            prev_prob = prob;
        }

        Self { tenors: cleaned }
    }

    /// A curve with no default risk.
    pub fn riskless() -> Self {
        Self { tenors: Vec::new() }
    }

    /// Flat hazard rate `hazard`, i.e. `S(t) = exp(-hazard * t)`.
    pub fn flat(hazard: f64) -> Result<Self> {
        if !hazard.is_finite() || hazard < 0.0 {
            return Err(CreditError::invalid(format!(
                "flat hazard rate must be finite and >= 0, got {hazard}"
            )));
        }
        if hazard == 0.0 {
            return Ok(Self::riskless());
        }
        Ok(Self::new(vec![(1.0, (-hazard).exp())]))
    }

    /// Builds a survival curve from piecewise-constant hazard rates.
    pub fn from_piecewise_hazard(tenors: &[f64], hazards: &[f64]) -> Result<Self> {
        if tenors.len() != hazards.len() {
            return Err(CreditError::dimension(format!(
                "tenors ({}) and hazards ({}) must have same length",
                tenors.len(),
                hazards.len()
            )));
        }

        let mut points = Vec::with_capacity(tenors.len());
        let mut cum_hazard = 0.0;
        let mut prev_t = 0.0;
        for (&t, &h) in tenors.iter().zip(hazards.iter()) {
            if !h.is_finite() || h < 0.0 {
                return Err(CreditError::invalid(format!(
                    "hazard rates must be finite and >= 0, got {h}"
                )));
            }
            if t <= prev_t {
                continue;
            }
            cum_hazard += h * (t - prev_t);
            points.push((t, (-cum_hazard).exp()));
            prev_t = t;
        }

        Ok(Self::new(points))
    }

    /// Returns survival probability at tenor `t` using log-linear interpolation.
    pub fn survival_prob(&self, t: f64) -> f64 {
        survival_prob_from_points(&self.tenors, t)
    }

    /// Returns piecewise-constant hazard rate at tenor `t`.
    pub fn hazard_rate(&self, t: f64) -> f64 {
        if self.tenors.is_empty() {
            return 0.0;
        }

        let first = self.tenors[0];
        if t <= first.0 {
            return hazard_between(0.0, 1.0, first.0, first.1);
        }

        for window in self.tenors.windows(2) {
            let left = window[0];
            let right = window[1];
            if t <= right.0 {
                return hazard_between(left.0, left.1, right.0, right.1);
            }
        }

        tail_hazard(&self.tenors)
    }

    /// Returns default probability in `(t1, t2]`.
    pub fn default_prob_between(&self, t1: f64, t2: f64) -> f64 {
        if t2 <= t1 {
            return 0.0;
        }
        (self.survival_prob(t1) - self.survival_prob(t2)).clamp(0.0, 1.0)
    }
}

impl SurvivalTermStructure for SurvivalCurve {
    fn survival_prob(&self, t: f64) -> f64 {
        SurvivalCurve::survival_prob(self, t)
    }

    /// Exact inverse of the log-linear interpolation.
    fn inverse_survival_prob(&self, target: f64) -> f64 {
        if target >= 1.0 {
            return 0.0;
        }
        if target <= 0.0 || self.tenors.is_empty() {
            return f64::INFINITY;
        }

        let mut left = (0.0, 1.0);
        for &right in &self.tenors {
            if target >= right.1 {
                return log_linear_time(left.0, left.1, right.0, right.1, target);
            }
            left = right;
        }

        let h = tail_hazard(&self.tenors);
        if h <= 0.0 {
            return f64::INFINITY;
        }
        let (t_last, p_last) = left;
        t_last + (p_last / target).ln() / h
    }
}

fn survival_prob_from_points(points: &[(f64, f64)], t: f64) -> f64 {
    if t <= 0.0 {
        return 1.0;
    }
    if points.is_empty() {
        return 1.0;
    }

    let first = points[0];
    if t <= first.0 {
        return log_linear_prob(0.0, 1.0, first.0, first.1, t);
    }

    for window in points.windows(2) {
        let left = window[0];
        let right = window[1];
        if t <= right.0 {
            return log_linear_prob(left.0, left.1, right.0, right.1, t);
        }
    }

    let (t_last, p_last) = points[points.len() - 1];
    p_last * (-tail_hazard(points) * (t - t_last)).exp()
}

fn tail_hazard(points: &[(f64, f64)]) -> f64 {
    match points {
        [] => 0.0,
        [(t1, p1)] => hazard_between(0.0, 1.0, *t1, *p1),
        [.., left, right] => hazard_between(left.0, left.1, right.0, right.1),
    }
}

fn hazard_between(t1: f64, p1: f64, t2: f64, p2: f64) -> f64 {
    if t2 <= t1 {
        return 0.0;
    }
    let h = -(p2.ln() - p1.ln()) / (t2 - t1);
    if h.is_finite() { h.max(0.0) } else { 0.0 }
}

fn log_linear_prob(t1: f64, p1: f64, t2: f64, p2: f64, t: f64) -> f64 {
    if (t2 - t1).abs() <= f64::EPSILON {
        return p2;
    }
    let w = (t - t1) / (t2 - t1);
    (p1.ln() + w * (p2.ln() - p1.ln())).exp()
}

fn log_linear_time(t1: f64, p1: f64, t2: f64, p2: f64, target: f64) -> f64 {
    let span = p1.ln() - p2.ln();
    if span <= 0.0 {
        return t1;
    }
    t1 + (t2 - t1) * (p1.ln() - target.ln()) / span
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn survival_default_hazard_are_consistent() {
        let curve = SurvivalCurve::new(vec![(1.0, 0.98), (3.0, 0.92), (5.0, 0.86)]);

        assert_relative_eq!(curve.survival_prob(0.0), 1.0, epsilon = 1e-12);
        assert!(curve.hazard_rate(2.0) > 0.0);
        assert_relative_eq!(
            curve.default_prob_between(1.0, 3.0),
            curve.survival_prob(1.0) - curve.survival_prob(3.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn flat_hazard_matches_exponential() {
        let curve = SurvivalCurve::flat(0.005).unwrap();
        for t in [0.25, 1.0, 4.5, 12.0] {
            assert_relative_eq!(curve.survival_prob(t), (-0.005 * t).exp(), epsilon = 1e-14);
        }
        assert!(SurvivalCurve::flat(-0.1).is_err());
        assert_eq!(SurvivalCurve::flat(0.0).unwrap().survival_prob(50.0), 1.0);
    }

    #[test]
    fn inverse_is_exact_inside_and_beyond_the_nodes() {
        let curve =
            SurvivalCurve::from_piecewise_hazard(&[1.0, 3.0, 5.0], &[0.01, 0.03, 0.02]).unwrap();
        for t in [0.3, 1.0, 2.2, 4.9, 8.0] {
            let s = curve.survival_prob(t);
            assert_relative_eq!(curve.inverse_survival_prob(s), t, epsilon = 1e-10);
        }
        assert_eq!(curve.inverse_survival_prob(1.0), 0.0);
        assert_eq!(SurvivalCurve::riskless().inverse_survival_prob(0.5), f64::INFINITY);
    }

    #[test]
    fn default_bisection_inverse_agrees_with_closed_form() {
        #[derive(Debug)]
        struct Wrapped(SurvivalCurve);
        impl SurvivalTermStructure for Wrapped {
            fn survival_prob(&self, t: f64) -> f64 {
                self.0.survival_prob(t)
            }
        }

        let curve = SurvivalCurve::flat(0.04).unwrap();
        let wrapped = Wrapped(curve.clone());
        for target in [0.99, 0.9, 0.6] {
            assert_relative_eq!(
                wrapped.inverse_survival_prob(target),
                SurvivalTermStructure::inverse_survival_prob(&curve, target),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn mismatched_hazard_inputs_are_rejected() {
        assert!(matches!(
            SurvivalCurve::from_piecewise_hazard(&[1.0, 2.0], &[0.01]),
            Err(CreditError::DimensionMismatch(_))
        ));
    }
}
