//! Large homogeneous pool approximation.
//!
//! In an infinitely granular pool the idiosyncratic noise diversifies away and the loss
//! is a deterministic function of the common factor:
//! `l(m) = sum_i (1 - R_i) p_i d_i(m)`. With non-negative loadings `l` decreases in `m`,
//! so writing `M = Q(u)` for the factor quantile `Q`,
//!
//! `E[min(l, x)] = x u* + int_{u*}^1 l(Q(u)) du`, where `l(Q(u*)) = x`.
//!
//! The unit interval is scanned in fixed steps, refined geometrically towards both ends
//! where `Q(u)` diverges. Crossings of the cap are located by bisection and each piece is
//! integrated with Gauss-Legendre. The same routine handles amortization, which need not
//! be monotone once prepayment is present.

use std::sync::OnceLock;

use tracing::debug;

use crate::core::{CreditError, Result};
use crate::math::{bisect_monotone, gauss_legendre_nodes_weights, normal_cdf, normal_inv_cdf};

use super::schedule::BasketSchedule;
use super::semi_analytic::check_copula_factors;
use super::{Basket, BasketLossModel};

const SCAN_INTERVALS: usize = 64;
const SEGMENT_ORDER: usize = 16;
const U_EPS: f64 = 1.0e-15;
/// Half-decade steps from `10^-2` down to `U_EPS` at each end of the unit interval.
const TAIL_STEPS: i32 = 26;

/// Vasicek limiting loss CDF: `P(L / P <= loss_fraction)` for a flat pool.
pub fn vasicek_loss_cdf(
    loss_fraction: f64,
    default_probability: f64,
    recovery_rate: f64,
    correlation: f64,
) -> f64 {
    if loss_fraction < 0.0 {
        return 0.0;
    }
    let lgd = (1.0 - recovery_rate).clamp(0.0, 1.0);
    if lgd <= 0.0 || loss_fraction >= lgd {
        return 1.0;
    }
    let q = default_probability.clamp(0.0, 1.0);
    if q <= 0.0 {
        return 1.0;
    }
    if q >= 1.0 {
        return 0.0;
    }
    let rho = correlation.clamp(0.0, 1.0);
    if rho <= 1.0e-12 {
        return if loss_fraction < lgd * q { 0.0 } else { 1.0 };
    }
    if loss_fraction <= 0.0 {
        return 0.0;
    }
    let x = normal_inv_cdf(loss_fraction / lgd);
    let k = normal_inv_cdf(q);
    normal_cdf(((1.0 - rho).sqrt() * x - k) / rho.sqrt()).clamp(0.0, 1.0)
}

#[derive(Debug)]
pub struct LargePoolBasket {
    basket: Basket,
    schedule: OnceLock<BasketSchedule>,
}

fn check_large_pool(basket: &Basket) -> Result<()> {
    check_copula_factors(basket)?;
    let loadings = basket.loadings();
    if loadings.n_factors() != 1 {
        return Err(CreditError::unsupported(format!(
            "large pool approximation needs one systemic factor, got {}",
            loadings.n_factors()
        )));
    }
    if (0..loadings.n_names()).any(|i| loadings.row(i)[0] < 0.0) {
        return Err(CreditError::unsupported(
            "large pool approximation needs non-negative loadings",
        ));
    }
    if basket.has_shorts() {
        return Err(CreditError::unsupported(
            "large pool approximation does not model short names",
        ));
    }
    Ok(())
}

/// Capped expectation and cumulative probability of `g(U)` for `U ~ U(0, 1)`.
struct CapIntegrator {
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl CapIntegrator {
    fn new() -> Result<Self> {
        let (nodes, weights) = gauss_legendre_nodes_weights(SEGMENT_ORDER)?;
        Ok(Self { nodes, weights })
    }

    /// Scan breakpoints: a uniform grid plus geometric grading into both tails.
    fn breakpoints() -> Vec<f64> {
        let tail = (0..=TAIL_STEPS).map(|k| 10f64.powf(-2.0 - 0.5 * k as f64));
        let mut points: Vec<f64> = (0..=SCAN_INTERVALS)
            .map(|s| s as f64 / SCAN_INTERVALS as f64)
            .chain(tail.clone())
            .chain(tail.map(|u| 1.0 - u))
            .collect();
        points.sort_by(f64::total_cmp);
        points.dedup();
        points
    }

    fn integrate<G: Fn(f64) -> f64>(&self, a: f64, b: f64, g: &G) -> f64 {
        let (c1, c2) = (0.5 * (b - a), 0.5 * (b + a));
        c1 * self
            .nodes
            .iter()
            .zip(&self.weights)
            .map(|(&x, &w)| w * g(c1 * x + c2))
            .sum::<f64>()
    }

    /// `(E[min(g(U), cap)], P(g(U) <= cap))`.
    fn capped<G: Fn(f64) -> f64>(&self, g: G, cap: f64) -> Result<(f64, f64)> {
        let at = |u: f64| g(u.clamp(U_EPS, 1.0 - U_EPS));
        let mut expectation = 0.0;
        let mut probability = 0.0;
        let points = Self::breakpoints();
        let mut a = points[0];
        let mut above = at(a) > cap;
        for &b in &points[1..] {
            let above_b = at(b) > cap;
            let mut pieces = [(a, b), (b, b)];
            if above_b != above {
                let root = bisect_monotone(&at, cap, a, b, 1.0e-14, 200)?;
                pieces = [(a, root), (root, b)];
            }
            for (lo, hi) in pieces {
                if hi <= lo {
                    continue;
                }
                if at(0.5 * (lo + hi)) > cap {
                    expectation += cap * (hi - lo);
                } else {
                    expectation += self.integrate(lo, hi, &at);
                    probability += hi - lo;
                }
            }
            a = b;
            above = above_b;
        }
        Ok((expectation, probability.clamp(0.0, 1.0)))
    }
}

impl LargePoolBasket {
    pub fn new(basket: Basket) -> Result<Self> {
        check_large_pool(&basket)?;
        Ok(Self {
            basket,
            schedule: OnceLock::new(),
        })
    }

    fn schedule(&self) -> Result<&BasketSchedule> {
        if let Some(s) = self.schedule.get() {
            return Ok(s);
        }
        check_large_pool(&self.basket)?;
        let s = BasketSchedule::new(&self.basket)?;
        debug!(names = s.obligors.len(), "prepared large pool schedule");
        Ok(self.schedule.get_or_init(|| s))
    }

    /// Pool loss at date `j` conditional on the factor value `m`.
    fn conditional_loss(schedule: &BasketSchedule, j: usize, m: f64) -> f64 {
        schedule
            .obligors
            .iter()
            .enumerate()
            .map(|(i, o)| (1.0 - o.mean_recovery(j)) * o.principal * schedule.default_prob(i, j, &[m]))
            .sum()
    }

    /// Pool amortization at date `j` conditional on `m`.
    fn conditional_amortization(schedule: &BasketSchedule, j: usize, m: f64) -> f64 {
        schedule
            .obligors
            .iter()
            .enumerate()
            .map(|(i, o)| {
                let d = schedule.default_prob(i, j, &[m]);
                o.principal * (o.mean_recovery(j) * d + (1.0 - d) * o.prepay[j])
            })
            .sum()
    }

    fn loss_moments(&self, j: usize, amount: f64) -> Result<(f64, f64)> {
        let schedule = self.schedule()?;
        CapIntegrator::new()?.capped(
            |u| Self::conditional_loss(schedule, j, schedule.engine.factor_quantile(u)),
            amount,
        )
    }
}

impl BasketLossModel for LargePoolBasket {
    fn basket(&self) -> &Basket {
        &self.basket
    }

    fn basket_mut(&mut self) -> &mut Basket {
        &mut self.basket
    }

    fn reset(&mut self) {
        self.schedule.take();
    }

    fn loss_cdf(&self, date_index: usize, amount: f64) -> Result<f64> {
        if amount < 0.0 {
            return Ok(0.0);
        }
        Ok(self.loss_moments(date_index, amount)?.1)
    }

    fn expected_capped_loss(&self, date_index: usize, amount: f64) -> Result<f64> {
        if amount <= 0.0 {
            return Ok(0.0);
        }
        Ok(self.loss_moments(date_index, amount)?.0)
    }

    fn expected_capped_amortization(&self, date_index: usize, amount: f64) -> Result<f64> {
        if amount <= 0.0 {
            return Ok(0.0);
        }
        let schedule = self.schedule()?;
        let (e, _) = CapIntegrator::new()?.capped(
            |u| Self::conditional_amortization(schedule, date_index, schedule.engine.factor_quantile(u)),
            amount,
        )?;
        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;

    use super::*;
    use crate::credit::basket::DateGrid;
    use crate::credit::factor::CorrelationSpec;
    use crate::credit::name::CreditName;
    use crate::credit::recovery::Recovery;
    use crate::credit::survival_curve::SurvivalCurve;

    fn flat_pool(n: usize, hazard: f64, rho: f64) -> Basket {
        let curve = Arc::new(SurvivalCurve::flat(hazard).unwrap());
        Basket::builder()
            .names((0..n).map(|i| {
                CreditName::new(format!("N{i}"), curve.clone(), Recovery::flat(0.4).unwrap(), 1.0)
            }))
            .correlation(CorrelationSpec::Flat(rho))
            .dates(DateGrid::new(vec![5.0]).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn vasicek_cdf_is_monotone_in_loss() {
        let a = vasicek_loss_cdf(0.02, 0.05, 0.4, 0.2);
        let b = vasicek_loss_cdf(0.05, 0.05, 0.4, 0.2);
        let c = vasicek_loss_cdf(0.10, 0.05, 0.4, 0.2);
        assert!(a <= b && b <= c);
        assert_eq!(vasicek_loss_cdf(0.6, 0.05, 0.4, 0.2), 1.0);
    }

    #[test]
    fn flat_pool_matches_the_vasicek_distribution() {
        let model = LargePoolBasket::new(flat_pool(10, 0.02, 0.3)).unwrap();
        let pd = 1.0 - (-0.1_f64).exp();
        for &x in &[0.01, 0.03, 0.06, 0.12, 0.3] {
            let cdf = model.calc_loss_distribution(true, 5.0, &[x]).unwrap()[0];
            assert_relative_eq!(cdf, vasicek_loss_cdf(x, pd, 0.4, 0.3), epsilon = 1e-9);
        }
    }

    #[test]
    fn total_expected_loss_is_exact() {
        let model = LargePoolBasket::new(flat_pool(10, 0.02, 0.3)).unwrap();
        let pd = 1.0 - (-0.1_f64).exp();
        assert_relative_eq!(model.accumulated_loss(5.0, 0.0, 1.0).unwrap(), 10.0 * 0.6 * pd, max_relative = 1e-8);
        let slices = [0.0, 0.03, 0.07, 0.15, 1.0]
            .windows(2)
            .map(|w| model.accumulated_loss(5.0, w[0], w[1]).unwrap())
            .sum::<f64>();
        assert_relative_eq!(slices, 10.0 * 0.6 * pd, max_relative = 1e-8);
    }

    #[test]
    fn amortization_collects_recoveries() {
        let model = LargePoolBasket::new(flat_pool(10, 0.02, 0.3)).unwrap();
        let pd = 1.0 - (-0.1_f64).exp();
        assert_relative_eq!(model.amortized_amount(5.0, 0.0, 1.0).unwrap(), 10.0 * 0.4 * pd, max_relative = 1e-8);
    }

    #[test]
    fn negative_loadings_and_shorts_are_unsupported() {
        let mut basket = flat_pool(3, 0.02, 0.3);
        basket.set_principal("N1", -1.0).unwrap();
        assert!(LargePoolBasket::new(basket).is_err());

        let basket = Basket::builder()
            .names((0..2).map(|i| {
                CreditName::new(
                    format!("N{i}"),
                    Arc::new(SurvivalCurve::flat(0.01).unwrap()),
                    Recovery::flat(0.4).unwrap(),
                    1.0,
                )
            }))
            .correlation(CorrelationSpec::Factors(vec![vec![0.5, -0.5]]))
            .dates(DateGrid::new(vec![1.0]).unwrap())
            .build()
            .unwrap();
        assert!(matches!(LargePoolBasket::new(basket), Err(CreditError::Unsupported(_))));
    }
}
