//! Routing layer benchmarks
//!
//! Hot paths measured:
//! 1. Decision::forward() - one policy evaluation and sample per input row
//! 2. Decision::routing_loss() + backward() - policy gradient bookkeeping
//! 3. Selection::forward() - grouping rows by action and running each module
//!
//! ## Performance Targets
//! - Decision forward: < 50µs for a batch of 64 with 128-wide states
//! - Selection forward: < 200µs for a batch of 64 over 10 linear modules

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use routenet_core::{Layer, Linear};
use routenet_rl::{
    AlgorithmKind, CollaborationReward, DecisionMaker, PolicyStorage, RoutingLayer, RoutingMeta,
    Selection,
};

fn random_batch(rng: &mut StdRng, batch: usize, width: usize) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(&[batch, width]), |_| rng.gen_range(-1.0..1.0))
}

fn bench_decision_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("decision_forward");
    let mut rng = StdRng::seed_from_u64(0);

    for kind in [AlgorithmKind::Reinforce, AlgorithmKind::QLearning, AlgorithmKind::Wpl] {
        for batch in [16, 64] {
            let mut decision = DecisionMaker::new(kind)
                .build(
                    10,
                    128,
                    10,
                    PolicyStorage::Approx,
                    Some(Box::new(CollaborationReward::new(0.3, 10))),
                    &mut rng,
                )
                .expect("decision");
            let y = random_batch(&mut rng, batch, 128);
            let agents: Vec<usize> = (0..batch).map(|i| i % 10).collect();

            group.throughput(Throughput::Elements(batch as u64));
            group.bench_with_input(BenchmarkId::new(kind.as_str(), batch), &batch, |b, _| {
                b.iter(|| {
                    let mut meta = RoutingMeta::new(&agents);
                    black_box(decision.forward(&y, &mut meta, &agents).expect("forward"))
                });
            });
        }
    }
    group.finish();
}

fn bench_decision_update(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let mut decision = DecisionMaker::new(AlgorithmKind::Reinforce)
        .build(10, 128, 10, PolicyStorage::Approx, None, &mut rng)
        .expect("decision");
    let y = random_batch(&mut rng, 64, 128);
    let agents: Vec<usize> = (0..64).map(|i| i % 10).collect();

    c.bench_function("decision_loss_and_backward_64", |b| {
        b.iter(|| {
            let mut meta = RoutingMeta::new(&agents);
            decision.forward(&y, &mut meta, &agents).expect("forward");
            meta.assign_returns(&vec![1.0; 64], 1.0);
            black_box(decision.routing_loss(&meta).expect("loss"));
            decision.backward(&y).expect("backward");
        });
    });
}

fn bench_selection_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection_forward");
    let mut rng = StdRng::seed_from_u64(2);

    for modules in [2, 10] {
        let bank: Vec<Box<dyn Layer>> = (0..modules)
            .map(|_| Box::new(Linear::new(128, 48, &mut rng)) as Box<dyn Layer>)
            .collect();
        let mut selection = Selection::new(bank);
        let y = random_batch(&mut rng, 64, 128);
        let actions: Vec<usize> = (0..64).map(|i| i % modules).collect();

        group.bench_with_input(BenchmarkId::from_parameter(modules), &modules, |b, _| {
            b.iter(|| {
                let mut meta = RoutingMeta::new(&actions);
                black_box(selection.forward(&y, &mut meta, &actions).expect("forward"))
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_decision_forward,
    bench_decision_update,
    bench_selection_forward
);
criterion_main!(benches);
