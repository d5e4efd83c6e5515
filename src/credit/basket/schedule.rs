//! Per-obligor, per-date inputs shared by the engines: default thresholds, prepayment
//! probabilities and (possibly stochastic) recovery nodes.

use std::collections::HashMap;

use tracing::trace;

use crate::core::Result;
use crate::credit::copula::CopulaEngine;
use crate::math::gauss_hermite_nodes_weights;

use super::Basket;

#[derive(Debug, Clone)]
pub(crate) struct ObligorSchedule {
    pub principal: f64,
    pub loadings: Vec<f64>,
    /// First date index at which the name is known to have defaulted.
    pub defaulted_from: Option<usize>,
    /// Default threshold per date (`-inf` where the name cannot default yet).
    pub thresholds: Vec<f64>,
    /// Unconditional prepayment probability per date.
    pub prepay: Vec<f64>,
    /// `(weight, recovery rate)` nodes per date; a single node when deterministic.
    pub recovery: Vec<Vec<(f64, f64)>>,
}

impl ObligorSchedule {
    /// Expected recovery rate at date `j`.
    pub fn mean_recovery(&self, j: usize) -> f64 {
        self.recovery[j].iter().map(|(w, r)| w * r).sum()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BasketSchedule {
    pub engine: CopulaEngine,
    pub obligors: Vec<ObligorSchedule>,
    pub n_dates: usize,
    pub notional: f64,
}

impl BasketSchedule {
    pub fn new(basket: &Basket) -> Result<Self> {
        let engine = CopulaEngine::new(basket.copula())?;
        let dates = basket.dates();
        let (rec_x, rec_w) = gauss_hermite_nodes_weights(basket.config().recovery_order)?;

        // Thresholds depend only on (default probability, loadings) for the double-t copula,
        // so identical names share one root search.
        let mut solved: HashMap<(u64, Vec<u64>), f64> = HashMap::new();
        let mut obligors = Vec::with_capacity(basket.len());
        for (i, name) in basket.names().iter().enumerate() {
            let loadings = basket.loadings().row(i).to_vec();
            let defaulted_from = name
                .default_time
                .and_then(|tau| dates.iter().position(|&t| t >= tau));

            let mut thresholds = Vec::with_capacity(dates.len());
            for &t in dates {
                let c = if name.default_time.is_some() {
                    if name.is_defaulted_by(t) {
                        f64::INFINITY
                    } else {
                        f64::NEG_INFINITY
                    }
                } else {
                    let pd = name.default_prob(t);
                    let key = (pd.to_bits(), loadings.iter().map(|b| b.to_bits()).collect());
                    match solved.get(&key) {
                        Some(&c) => c,
                        None => {
                            let c = engine.threshold(pd, &loadings)?;
                            solved.insert(key, c);
                            c
                        }
                    }
                };
                thresholds.push(c);
            }

            let prepay = dates.iter().map(|&t| name.prepay_prob(t)).collect();
            let recovery = dates
                .iter()
                .map(|&t| {
                    if name.recovery.is_stochastic() {
                        rec_x
                            .iter()
                            .zip(&rec_w)
                            .map(|(&y, &w)| (w, name.recovery.conditional_rate(t, y)))
                            .collect()
                    } else {
                        vec![(1.0, name.recovery.rate(t))]
                    }
                })
                .collect();

            obligors.push(ObligorSchedule {
                principal: name.principal,
                loadings,
                defaulted_from,
                thresholds,
                prepay,
                recovery,
            });
        }
        trace!(
            obligors = obligors.len(),
            distinct_thresholds = solved.len(),
            "prepared basket schedule"
        );

        Ok(Self {
            engine,
            obligors,
            n_dates: dates.len(),
            notional: basket.notional(),
        })
    }

    /// Conditional default probability of obligor `i` by date `j` given `factor`.
    #[inline]
    pub fn default_prob(&self, i: usize, j: usize, factor: &[f64]) -> f64 {
        let o = &self.obligors[i];
        self.engine
            .conditional_default_prob(o.thresholds[j], &o.loadings, factor)
    }

    /// Every positive loss-given-default amount, for aligning the loss grid.
    pub fn loss_amounts(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for o in &self.obligors {
            for nodes in &o.recovery {
                out.extend(nodes.iter().map(|(_, r)| ((1.0 - r) * o.principal).abs()));
            }
        }
        out.retain(|a| *a > 0.0);
        out
    }

    /// Every positive amortization amount (recoveries and prepaid principal).
    pub fn amortization_amounts(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for o in &self.obligors {
            for nodes in &o.recovery {
                out.extend(nodes.iter().map(|(_, r)| (r * o.principal).abs()));
            }
            if o.prepay.iter().any(|q| *q > 0.0) {
                out.push(o.principal.abs());
            }
        }
        out.retain(|a| *a > 0.0);
        out
    }
}
