use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use wildreid::config::{IndexKind, IndexOptions, Metric};
use wildreid::fusion::fuse;
use wildreid::index::{AnyIndex, VectorIndex};
use wildreid::kmeans::train_centroids;

// 512 维深度特征 + 202 维纹理特征
const DEEP_DIM: usize = 512;
const PATTERN_DIM: usize = 202;

fn generate_fused(n: usize) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(42); // 固定种子
    (0..n)
        .map(|_| {
            let deep = (0..DEEP_DIM).map(|_| rng.random::<f32>()).collect::<Vec<_>>();
            let pattern = (0..PATTERN_DIM).map(|_| rng.random::<f32>()).collect::<Vec<_>>();
            fuse(&deep, &pattern).into_vec()
        })
        .collect()
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    let d = DEEP_DIM + PATTERN_DIM;

    for n in [1000, 10000] {
        let data = generate_fused(n);
        let flat = data.concat();
        let query = data[n / 2].clone();

        let mut index = AnyIndex::new(d, &IndexOptions::default());
        index.add(&flat).unwrap();
        group.bench_with_input(BenchmarkId::new("flat", n), &n, |b, _| {
            b.iter(|| index.search(black_box(&query), 5).unwrap())
        });

        let options =
            IndexOptions { index_kind: IndexKind::Ivf, metric: Metric::L2, nlist: 32, nprobe: 4 };
        let mut index = AnyIndex::new(d, &options);
        index.add(&flat).unwrap();
        group.bench_with_input(BenchmarkId::new("ivf", n), &n, |b, _| {
            b.iter(|| index.search(black_box(&query), 5).unwrap())
        });
    }

    group.finish();
}

fn bench_kmeans(c: &mut Criterion) {
    let data = generate_fused(2000).concat();
    c.bench_function("kmeans_2000x32", |b| {
        b.iter(|| train_centroids(black_box(&data), DEEP_DIM + PATTERN_DIM, 32, 10))
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_search, bench_kmeans
}
criterion_main!(benches);
