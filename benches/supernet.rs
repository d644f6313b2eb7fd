use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kolosal_nas::models::{EdgeKind, Nb201Config, Nb201Supernet, Supernet};
use kolosal_nas::nas::{Mutator, MutatorConfig};
use kolosal_nas::nn::{cross_entropy, synthetic_blobs, DataLoader};
use kolosal_nas::trainer::{OneShotTrainer, OneShotTrainerConfig};
use ndarray::Array2;

fn supernet(edge_kind: EdgeKind, hidden_dim: usize) -> Nb201Supernet {
    Nb201Supernet::new(Nb201Config {
        input_dim: 16,
        hidden_dim,
        num_classes: 10,
        num_cells: 3,
        edge_kind,
        seed: 0,
        ..Default::default()
    })
    .unwrap()
}

fn bench_single_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_path");

    for hidden in [16, 64].iter() {
        let mut model = supernet(EdgeKind::OneShot, *hidden);
        let mut mutator = Mutator::new(MutatorConfig::one_shot().with_seed(1));
        mutator.prepare_from_supernet(&model).unwrap();
        let x = Array2::from_elem((32, 16), 0.5);
        let labels: Vec<usize> = (0..32).map(|i| i % 10).collect();

        group.bench_with_input(BenchmarkId::new("forward_backward", hidden), &x, |b, x| {
            b.iter(|| {
                let subnet = mutator.random_subnet().unwrap();
                mutator.set_subnet(&mut model, &subnet).unwrap();
                let logits = model.forward(black_box(x), None).unwrap();
                let (_, grad) = cross_entropy(&logits, &labels).unwrap();
                model.backward(&grad, None).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_mixture(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixture");

    for hidden in [16, 64].iter() {
        let mut model = supernet(EdgeKind::Diff, *hidden);
        let mut mutator = Mutator::new(MutatorConfig::differentiable().with_seed(1));
        mutator.prepare_from_supernet(&model).unwrap();
        let x = Array2::from_elem((32, 16), 0.5);
        let labels: Vec<usize> = (0..32).map(|i| i % 10).collect();

        group.bench_with_input(BenchmarkId::new("forward_backward", hidden), &x, |b, x| {
            b.iter(|| {
                mutator.zero_arch_grad();
                let arch = mutator.arch_params().unwrap();
                let logits = model.forward(black_box(x), Some(arch)).unwrap();
                let (_, grad) = cross_entropy(&logits, &labels).unwrap();
                model
                    .backward(&grad, Some(mutator.arch_params_mut().unwrap()))
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_train_epoch(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_epoch");
    group.sample_size(10);

    let data = synthetic_blobs(256, 16, 10, 3).unwrap();
    let mut loader = DataLoader::new(data, 32, true, Some(3));
    let mut trainer = OneShotTrainer::new(
        supernet(EdgeKind::OneShot, 16),
        OneShotTrainerConfig {
            print_freq: 0,
            ..Default::default()
        },
    )
    .unwrap();

    group.bench_function("uniform", |b| {
        b.iter(|| trainer.train_epoch(&mut loader).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_single_path, bench_mixture, bench_train_epoch);
criterion_main!(benches);
