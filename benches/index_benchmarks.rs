use chunkspace::memory::{Chunk, ChunkKey, ChunkSpace, IndexConfig, TemporalIndex};
use chunkspace::SpaceConfig;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

fn filled_index(size: u64) -> TemporalIndex {
    let index = TemporalIndex::new(IndexConfig::default()).unwrap();
    for object in 0..size {
        index
            .get_or_put(&ChunkKey::new(0, object % 16, object), Arc::new(Chunk::new_state()))
            .unwrap();
    }
    index
}

fn benchmark_index_get(c: &mut Criterion) {
    let index = filled_index(10_000);
    let key = ChunkKey::new(0, 5000 % 16, 5000);

    c.bench_function("index get", |b| {
        b.iter(|| index.get(&key).unwrap());
    });
}

fn benchmark_index_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_insertion");

    for size in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| filled_index(size));
        });
    }
    group.finish();
}

fn benchmark_resolver_lookup(c: &mut Criterion) {
    let space = ChunkSpace::in_memory(SpaceConfig {
        memoize_resolutions: false,
        ..SpaceConfig::default()
    })
    .unwrap();
    for time in (0..1000).step_by(10) {
        space.resolver().create(0, time, 1).unwrap();
    }
    let branch = space.resolver().fork(0).unwrap();

    c.bench_function("resolver lookup through fork", |b| {
        b.iter(|| {
            let trace = space.resolver().lookup(branch, 555, 1).unwrap().into_trace().unwrap();
            space.release(trace).unwrap()
        });
    });
}

criterion_group!(
    benches,
    benchmark_index_get,
    benchmark_index_insertion,
    benchmark_resolver_lookup
);
criterion_main!(benches);
