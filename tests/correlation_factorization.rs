use std::sync::Arc;

use creditferric::math::correlation::{correlation_sum_square_error, factorize_correlation};
use creditferric::math::least_squares::LmOptions;
use creditferric::prelude::*;

/// Three sectors with distinct intra-sector correlation and a weak global link.
fn sector_matrix(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        1.0
                    } else if i % 3 == j % 3 {
                        0.3 + 0.1 * (i % 3) as f64
                    } else {
                        0.1
                    }
                })
                .collect()
        })
        .collect()
}

fn basket_with(spec: CorrelationSpec, n: usize) -> Result<Basket> {
    let curve = Arc::new(SurvivalCurve::flat(0.02)?);
    Basket::builder()
        .names((0..n).map(|i| {
            CreditName::new(format!("S{i}"), curve.clone(), Recovery::flat(0.4).unwrap(), 1.0)
        }))
        .correlation(spec)
        .dates(DateGrid::new(vec![5.0])?)
        .build()
}

#[test]
fn full_rank_factorization_recovers_the_matrix() {
    let target = sector_matrix(9);
    let fact = factorize_correlation(&target, 9, LmOptions::default()).unwrap();
    assert!(fact.error < 1.0e-9, "sse = {}", fact.error);
    assert!(correlation_sum_square_error(&fact.loadings, &target) < 1.0e-9);

    let basket = basket_with(
        CorrelationSpec::Full {
            matrix: target.clone(),
            factors: 9,
        },
        9,
    )
    .unwrap();
    let loadings = basket.loadings();
    for i in 0..9 {
        for j in 0..9 {
            assert!((loadings.correlation(i, j) - target[i][j]).abs() < 1.0e-9);
        }
    }
}

#[test]
fn truncated_factorization_improves_on_naive_truncation() {
    let target = sector_matrix(12);
    for k in 1..4 {
        let fact = factorize_correlation(&target, k, LmOptions::default()).unwrap();
        assert!(
            fact.error < fact.truncated_error,
            "k={k}: refined {} vs truncated {}",
            fact.error,
            fact.truncated_error
        );
    }
}

#[test]
fn factor_spec_shapes_are_checked_at_the_boundary() {
    let err = basket_with(CorrelationSpec::Factors(vec![vec![0.3; 4]]), 5).unwrap_err();
    assert!(matches!(err, CreditError::DimensionMismatch(_)));
    let err = basket_with(
        CorrelationSpec::Full {
            matrix: sector_matrix(4),
            factors: 2,
        },
        5,
    )
    .unwrap_err();
    assert!(matches!(err, CreditError::DimensionMismatch(_)));
}

#[test]
fn factor_scale_sweeps_and_restores_the_correlation() {
    let basket = basket_with(CorrelationSpec::Flat(0.25), 30).unwrap();
    let mut model = HeterogeneousBasket::new(basket).unwrap();
    let base = model.accumulated_loss(5.0, 0.0, 0.03).unwrap();

    model.set_factor(0.0).unwrap();
    let independent = model.accumulated_loss(5.0, 0.0, 0.03).unwrap();
    model.set_factor(1.0).unwrap();
    let restored = model.accumulated_loss(5.0, 0.0, 0.03).unwrap();

    // Dependence moves mass out of the equity tranche.
    assert!(independent > base);
    assert!((restored - base).abs() < 1.0e-14);
    assert!(model.set_factor(3.0).is_err());
}
