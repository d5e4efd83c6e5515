//! Recovery assumptions per name: a flat rate or a term structure, optionally stochastic.
//!
//! Stochastic recovery follows a Gaussian-link model: conditional on the idiosyncratic
//! recovery driver `Y ~ N(0, 1)`, `R = Phi(mu + sigma * Y)` with
//! `mu = Phi^-1(R_mean) * sqrt(1 + sigma^2)`, which keeps `E[R] = R_mean` for any `sigma`.

use serde::{Deserialize, Serialize};

use crate::core::{CreditError, Result};
use crate::math::{normal_cdf, normal_inv_cdf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recovery {
    /// `(time, rate)` nodes; linear in between, flat outside.
    points: Vec<(f64, f64)>,
    /// Dispersion `sigma` of the Gaussian recovery driver; zero means deterministic.
    dispersion: f64,
}

impl Recovery {
    pub fn flat(rate: f64) -> Result<Self> {
        Self::term(vec![(0.0, rate)])
    }

    /// Term structure of expected recovery rates.
    pub fn term(mut points: Vec<(f64, f64)>) -> Result<Self> {
        if points.is_empty() {
            return Err(CreditError::invalid("recovery term structure needs at least one node"));
        }
        for &(t, r) in &points {
            if !t.is_finite() || !r.is_finite() || !(0.0..=1.0).contains(&r) {
                return Err(CreditError::invalid(format!(
                    "recovery node ({t}, {r}) must have finite time and rate in [0, 1]"
                )));
            }
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        points.dedup_by(|b, a| (a.0 - b.0).abs() <= 1.0e-12);
        Ok(Self {
            points,
            dispersion: 0.0,
        })
    }

    pub fn with_dispersion(mut self, dispersion: f64) -> Result<Self> {
        if !dispersion.is_finite() || dispersion < 0.0 {
            return Err(CreditError::invalid(format!(
                "recovery dispersion must be finite and >= 0, got {dispersion}"
            )));
        }
        self.dispersion = dispersion;
        Ok(self)
    }

    /// Expected recovery rate at `t`.
    pub fn rate(&self, t: f64) -> f64 {
        let Some(&first) = self.points.first() else {
            return 0.0;
        };
        if t <= first.0 {
            return first.1;
        }
        for w in self.points.windows(2) {
            let (t1, r1) = w[0];
            let (t2, r2) = w[1];
            if t <= t2 {
                return r1 + (r2 - r1) * (t - t1) / (t2 - t1);
            }
        }
        self.points.last().map_or(first.1, |p| p.1)
    }

    pub fn dispersion(&self) -> f64 {
        self.dispersion
    }

    pub fn is_stochastic(&self) -> bool {
        self.dispersion > 0.0
    }

    pub fn is_flat(&self) -> bool {
        self.points.windows(2).all(|w| (w[0].1 - w[1].1).abs() <= 1.0e-15)
    }

    /// Recovery rate conditional on the idiosyncratic recovery driver `y`.
    pub fn conditional_rate(&self, t: f64, y: f64) -> f64 {
        let mean = self.rate(t);
        if !self.is_stochastic() || mean <= 0.0 || mean >= 1.0 {
            return mean;
        }
        let sigma = self.dispersion;
        let mu = normal_inv_cdf(mean) * (1.0 + sigma * sigma).sqrt();
        normal_cdf(mu + sigma * y)
    }
}
