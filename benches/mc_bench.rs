use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use creditferric::prelude::*;

// Monte Carlo basket benchmarks
// Goals:
// - path cost linear in names
// - stratified sampling within 2x of plain sampling per path

fn benchmark_basket(n: usize) -> Basket {
    let curve = Arc::new(SurvivalCurve::flat(0.01).expect("valid hazard"));
    Basket::builder()
        .names((0..n).map(|i| {
            CreditName::new(format!("N{i}"), curve.clone(), Recovery::flat(0.4).expect("valid recovery"), 1.0)
        }))
        .correlation(CorrelationSpec::Flat(0.3))
        .dates(DateGrid::from_step(1.0, 5.0).expect("valid date grid"))
        .build()
        .expect("benchmark basket should be valid")
}

fn bench_plain_paths(c: &mut Criterion) {
    let basket = benchmark_basket(100);
    let mut group = c.benchmark_group("mc_plain_paths");
    group.sample_size(10);
    for paths in [10_000_usize, 50_000] {
        group.bench_with_input(BenchmarkId::from_parameter(paths), &paths, |b, &paths| {
            b.iter(|| {
                let model = MonteCarloBasket::new(basket.clone(), McConfig::with_paths(paths, 42))
                    .expect("valid config");
                black_box(model.statistics().expect("simulation").expected_loss[4])
            })
        });
    }
    group.finish();
}

fn bench_stratified_paths(c: &mut Criterion) {
    let basket = benchmark_basket(100);
    let mut group = c.benchmark_group("mc_stratified_paths");
    group.sample_size(10);
    let strata = StratifiedConfig::from_boundaries(&[0, 5, 10, 20], 2_500).expect("valid strata");
    group.bench_function("4x2500", |b| {
        b.iter(|| {
            let cfg = McConfig {
                sampler: Sampler::Stratified(strata.clone()),
                ..McConfig::default()
            };
            let model = MonteCarloBasket::new(basket.clone(), cfg).expect("valid config");
            black_box(model.statistics().expect("simulation").expected_loss[4])
        })
    });
    group.finish();
}

criterion_group!(benches, bench_plain_paths, bench_stratified_paths);
criterion_main!(benches);
