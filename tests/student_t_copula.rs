use std::sync::Arc;

use approx::assert_relative_eq;

use creditferric::prelude::*;

const DATES: [f64; 3] = [1.0, 3.0, 5.0];

fn double_t_pool() -> Basket {
    Basket::builder()
        .names((0..25).map(|i| {
            CreditName::new(
                format!("T{i:02}"),
                Arc::new(SurvivalCurve::flat(0.005 + 0.001 * i as f64).unwrap()),
                Recovery::flat(0.3 + 0.02 * (i % 5) as f64).unwrap(),
                1.0,
            )
        }))
        .correlation(CorrelationSpec::Flat(0.3))
        .copula(Copula::StudentT {
            common_dof: 5.0,
            idiosyncratic_dof: 8.0,
        })
        .dates(DateGrid::new(DATES.to_vec()).unwrap())
        .build()
        .unwrap()
}

/// `sum_i LGD_i PD_i(t)`, which no dependence structure can change.
fn marginal_expected_loss(basket: &Basket, t: f64) -> f64 {
    basket
        .names()
        .iter()
        .map(|n| n.loss_given_default(t) * n.default_prob(t))
        .sum()
}

#[test]
fn recursion_reproduces_the_marginal_expected_loss() {
    let basket = double_t_pool();
    let model = HeterogeneousBasket::new(basket.clone()).unwrap();
    for &t in &DATES {
        let el = model.accumulated_loss(t, 0.0, 1.0).unwrap();
        assert_relative_eq!(el, marginal_expected_loss(&basket, t), max_relative = 1e-10);
        let top = model.calc_loss_distribution(true, t, &[1.0]).unwrap()[0];
        assert_relative_eq!(top, 1.0, epsilon = 1e-12);
    }
}

#[test]
fn large_pool_and_simulation_agree_with_the_recursion() {
    let basket = double_t_pool();
    let large = LargePoolBasket::new(basket.clone()).unwrap();
    let mc = MonteCarloBasket::new(basket.clone(), McConfig::with_paths(20_000, 17)).unwrap();
    let stats = mc.statistics().unwrap();

    for (j, &t) in DATES.iter().enumerate() {
        let expected = marginal_expected_loss(&basket, t);
        assert_relative_eq!(large.accumulated_loss(t, 0.0, 1.0).unwrap(), expected, max_relative = 1e-3);
        assert!(
            (stats.expected_loss[j] - expected).abs() < 4.0 * stats.loss_stderr[j],
            "t={t} mc={} +/- {} expected={expected}",
            stats.expected_loss[j],
            stats.loss_stderr[j]
        );
    }
}
