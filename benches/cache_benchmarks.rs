use criterion::{black_box, criterion_group, criterion_main, Criterion};
use polycache::test_utils::all_backends;
use polycache::{call_site, DistributedCoordinator};

fn benchmark_hits(c: &mut Criterion) {
    for backend in all_backends() {
        let cache = backend
            .builder::<u64, String>(format!("bench::hits::{}", backend.name()))
            .build()
            .unwrap();
        cache.put(7, "seven".to_string()).unwrap();

        c.bench_function(&format!("get_hit_{}", backend.name()), |b| {
            b.iter(|| cache.get(black_box(&7)).unwrap())
        });
    }
}

fn benchmark_loader_misses(c: &mut Criterion) {
    for backend in all_backends() {
        let cache = backend
            .builder::<u64, u64>(format!("bench::load::{}", backend.name()))
            .build_with_loader(|key: &u64| Ok(Some(key * 2)))
            .unwrap();

        c.bench_function(&format!("load_then_invalidate_{}", backend.name()), |b| {
            b.iter(|| {
                cache.get(black_box(&42)).unwrap();
                cache.invalidate(&42).unwrap();
            })
        });
    }
}

fn benchmark_counters(c: &mut Criterion) {
    let counter = DistributedCoordinator::local().get_atomic_counter(&call_site!(), "bench");
    c.bench_function("local_counter_increment", |b| {
        b.iter(|| counter.increment_and_get().unwrap())
    });
}

criterion_group!(benches, benchmark_hits, benchmark_loader_misses, benchmark_counters);
criterion_main!(benches);
