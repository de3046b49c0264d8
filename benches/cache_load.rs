//! Benchmarks for the resource cache

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use davrepo::{
    Acl, BackingStore, CacheConfig, EvictionPolicy, KeyLockConfig, MemoryStore, Principal,
    Resource, ResourceCache,
};
use std::sync::Arc;

fn create_store(docs: usize) -> Arc<MemoryStore> {
    let owner = Principal::user("owner");
    let store = MemoryStore::new(owner.clone());
    let root_acl = Acl::default_root(owner.clone());
    for i in 0..docs {
        let doc = Resource::document(
            format!("/doc{}", i),
            owner.clone(),
            Acl::inherit_from(&root_acl, owner.clone()),
        );
        store.store(&doc).unwrap();
    }
    Arc::new(store)
}

fn create_cache(
    store: &Arc<MemoryStore>,
    max_items: usize,
    policy: EvictionPolicy,
) -> ResourceCache<MemoryStore> {
    let config = CacheConfig {
        max_items,
        policy,
        ..CacheConfig::default()
    };
    ResourceCache::new(Arc::clone(store), &config, &KeyLockConfig::default())
}

fn benchmark_load_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_load_hit");

    for size in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let store = create_store(size);
            let cache = create_cache(&store, size * 2, EvictionPolicy::Fifo);
            for i in 0..size {
                cache.load(&format!("/doc{}", i)).unwrap();
            }

            b.iter(|| {
                black_box(cache.load("/doc0").unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_load_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_load_miss");

    for size in [100, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let store = create_store(size);
            let cache = create_cache(&store, size * 2, EvictionPolicy::Fifo);

            b.iter(|| {
                cache.clear();
                for i in 0..size {
                    black_box(cache.load(&format!("/doc{}", i)).unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Working set twice the capacity, so most loads evict
fn benchmark_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_eviction");

    for policy in [EvictionPolicy::Fifo, EvictionPolicy::Lru] {
        let name = format!("{:?}", policy);
        group.bench_with_input(BenchmarkId::from_parameter(name), &policy, |b, &policy| {
            let store = create_store(2_000);
            let cache = create_cache(&store, 1_000, policy);

            b.iter(|| {
                for i in 0..2_000 {
                    black_box(cache.load(&format!("/doc{}", i)).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_load_hit, benchmark_load_miss, benchmark_eviction);
criterion_main!(benches);
