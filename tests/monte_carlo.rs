use std::sync::Arc;

use approx::assert_relative_eq;

use creditferric::mc::{PathSimulator, SimulatedPath, simulate_paths, simulate_paths_parallel};
use creditferric::prelude::*;

fn pool(n: usize, rho: f64) -> Basket {
    let curve = Arc::new(SurvivalCurve::flat(0.03).unwrap());
    Basket::builder()
        .names((0..n).map(|i| {
            CreditName::new(format!("N{i}"), curve.clone(), Recovery::flat(0.4).unwrap(), 1.0)
        }))
        .correlation(CorrelationSpec::Flat(rho))
        .dates(DateGrid::new(vec![1.0, 3.0, 5.0]).unwrap())
        .build()
        .unwrap()
}

fn mixed_pool() -> Basket {
    Basket::builder()
        .names((0..15).map(|i| {
            let name = CreditName::new(
                format!("M{i}"),
                Arc::new(SurvivalCurve::flat(0.01 + 0.01 * i as f64).unwrap()),
                Recovery::flat(0.3).unwrap().with_dispersion(0.1).unwrap(),
                1.0 + (i % 4) as f64,
            );
            match i {
                3 => name.with_refinance(Arc::new(SurvivalCurve::flat(0.08).unwrap())),
                7 => name.with_default_time(0.5),
                _ => name,
            }
        }))
        .correlation(CorrelationSpec::Flat(0.35))
        .dates(DateGrid::new(vec![1.0, 2.0, 5.0]).unwrap())
        .build()
        .unwrap()
}

#[test]
fn one_stratum_with_n_plus_one_paths_is_exact_at_zero_correlation() {
    let n = 20;
    let cfg = McConfig {
        sampler: Sampler::Stratified(StratifiedConfig::single(n + 1)),
        ..McConfig::default()
    };
    let mc = MonteCarloBasket::new(pool(n, 0.0), cfg).unwrap();
    let stats = mc.statistics().unwrap();
    assert_eq!(stats.paths, n + 1);
    let horizon_pd = 1.0 - (-0.03_f64 * 5.0).exp();
    assert_relative_eq!(stats.expected_defaults[2], n as f64 * horizon_pd, epsilon = 1.0e-10);
    assert_relative_eq!(stats.weight_sum, 1.0, epsilon = 1.0e-12);
}

#[test]
fn serial_and_parallel_paths_are_bit_identical() {
    let sim = PathSimulator::new(&mixed_pool(), &McConfig::with_paths(1_000, 2024)).unwrap();
    let serial = simulate_paths(&sim, 0..1_000);
    let parallel = simulate_paths_parallel(&sim, 0..1_000);
    assert_eq!(serial, parallel);

    let reversed: Vec<SimulatedPath> = (0..1_000u64).rev().map(|i| sim.simulate_path(i)).collect();
    for (a, b) in serial.iter().zip(reversed.iter().rev()) {
        assert_eq!(a, b);
    }
}

#[test]
fn stratified_paths_are_bit_identical_across_execution_orders() {
    let cfg = McConfig {
        sampler: Sampler::Stratified(StratifiedConfig::from_boundaries(&[0, 2, 5], 200).unwrap()),
        seed: 77,
        ..McConfig::default()
    };
    let sim = PathSimulator::new(&mixed_pool(), &cfg).unwrap();
    assert_eq!(sim.total_paths(), 600);
    let serial = simulate_paths(&sim, 0..600);
    let parallel = simulate_paths_parallel(&sim, 0..600);
    assert_eq!(serial, parallel);
    assert!(serial.iter().all(|p| p.weight.to_bits() == sim.simulate_path(p.index).weight.to_bits()));
}

#[cfg(feature = "parallel")]
#[test]
fn statistics_do_not_depend_on_the_thread_count() {
    let run = |threads: usize| {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap();
        pool.install(|| {
            let cfg = McConfig {
                paths: 5_000,
                seed: 9,
                chunk_size: 256,
                ..McConfig::default()
            };
            let mc = MonteCarloBasket::new(mixed_pool(), cfg).unwrap();
            let stats = mc.statistics().unwrap().clone();
            let grid = mc.loss_distribution_grid(DistributionKind::ExpectedLoss).unwrap();
            (stats, grid)
        })
    };
    let (s1, g1) = run(1);
    let (s4, g4) = run(4);
    assert_eq!(s1, s4);
    assert_eq!(g1, g4);
}

#[test]
fn plain_and_stratified_estimates_bracket_the_recursion() {
    let exact = HeterogeneousBasket::new(mixed_pool()).unwrap();
    let el = exact.accumulated_loss(5.0, 0.0, 1.0).unwrap();
    let am = exact.amortized_amount(5.0, 0.0, 1.0).unwrap();

    let plain = MonteCarloBasket::new(mixed_pool(), McConfig::with_paths(30_000, 5)).unwrap();
    let stats = plain.statistics().unwrap();
    assert!((stats.expected_loss[2] - el).abs() < 4.0 * stats.loss_stderr[2]);
    assert!((stats.expected_amortization[2] - am).abs() < 4.0 * stats.amortization_stderr[2]);

    let cfg = McConfig {
        sampler: Sampler::Stratified(StratifiedConfig::from_boundaries(&[0, 2, 4, 7], 5_000).unwrap()),
        seed: 6,
        ..McConfig::default()
    };
    let stratified = MonteCarloBasket::new(mixed_pool(), cfg).unwrap();
    let stats = stratified.statistics().unwrap();
    assert!((stats.expected_loss[2] - el).abs() < 4.0 * stats.loss_stderr[2]);
}
