//! Performance benchmarks for the buddy pool allocator

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mesh_ipam::{CreatePoolRequest, PoolManager, PoolManagerConfig, PoolRecord};
use std::net::IpAddr;

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn pool_of(manager: &PoolManager, network: &str, prefix_length: u8) -> PoolRecord {
    manager
        .create_pool(CreatePoolRequest::new(addr(network), prefix_length).with_bounds(None, None))
        .unwrap()
}

/// Benchmark allocating a pool to exhaustion
fn bench_allocate_to_exhaustion(c: &mut Criterion) {
    let mut group = c.benchmark_group("subnet_allocation_sequential");

    for prefix in [24u8, 26, 28].iter() {
        let capacity = 1u64 << (*prefix - 20);

        group.throughput(Throughput::Elements(capacity));
        group.bench_with_input(BenchmarkId::new("prefix", prefix), prefix, |b, &prefix| {
            b.iter(|| {
                let manager = PoolManager::new();
                let pool = pool_of(&manager, "10.0.0.0", 20);
                let mut count = 0u64;
                while manager
                    .allocate_subnet(pool.id, Some(prefix))
                    .unwrap()
                    .is_some()
                {
                    count += 1;
                }
                black_box(count)
            });
        });
    }

    group.finish();
}

/// Benchmark a single allocation from a fresh pool
fn bench_single_allocation(c: &mut Criterion) {
    c.bench_function("subnet_allocation_single", |b| {
        b.iter(|| {
            let manager = PoolManager::new();
            let pool = pool_of(&manager, "10.0.0.0", 16);
            black_box(manager.allocate_subnet(pool.id, Some(24)).unwrap())
        });
    });
}

/// Benchmark an allocate/free cycle against a deep standing tree
fn bench_allocate_free_cycle(c: &mut Criterion) {
    let manager = PoolManager::new();
    let pool = pool_of(&manager, "10.0.0.0", 16);
    // Standing allocations keep the tree split while the cycle runs.
    for _ in 0..16 {
        manager.allocate_subnet(pool.id, Some(26)).unwrap();
    }

    c.bench_function("subnet_allocate_free_cycle", |b| {
        b.iter(|| {
            let leaf = manager
                .allocate_subnet(pool.id, Some(26))
                .unwrap()
                .unwrap();
            manager.free_subnet(leaf.id).unwrap();
            black_box(leaf.id)
        });
    });
}

/// Benchmark allocation from a fragmented pool
fn bench_fragmented_allocation(c: &mut Criterion) {
    c.bench_function("subnet_allocation_fragmented", |b| {
        b.iter_batched(
            || {
                // Setup: fill with /28s, then free every other one.
                let manager = PoolManager::new();
                let pool = pool_of(&manager, "10.0.0.0", 20);
                let mut leaves = Vec::new();
                while let Some(leaf) = manager.allocate_subnet(pool.id, Some(28)).unwrap() {
                    leaves.push(leaf);
                }
                for (i, leaf) in leaves.iter().enumerate() {
                    if i % 2 == 0 {
                        manager.free_subnet(leaf.id).unwrap();
                    }
                }
                (manager, pool.id)
            },
            |(manager, pool_id)| {
                // Benchmark: refill the holes.
                let mut count = 0u32;
                while manager.allocate_subnet(pool_id, Some(28)).unwrap().is_some() {
                    count += 1;
                }
                black_box(count)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

/// Benchmark reservation of a specific deep block
fn bench_reserve_specific_block(c: &mut Criterion) {
    c.bench_function("subnet_reserve_specific", |b| {
        b.iter_batched(
            || {
                let manager = PoolManager::new();
                let pool = pool_of(&manager, "10.0.0.0", 16);
                (manager, pool.id)
            },
            |(manager, pool_id)| {
                black_box(
                    manager
                        .reserve_subnet(pool_id, addr("10.0.213.64"), 26)
                        .unwrap(),
                )
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

/// Benchmark the read-only availability check on a split tree
fn bench_check_availability(c: &mut Criterion) {
    let manager = PoolManager::new();
    let pool = pool_of(&manager, "10.0.0.0", 16);
    for _ in 0..32 {
        manager.allocate_subnet(pool.id, Some(24)).unwrap();
    }

    c.bench_function("subnet_check_available", |b| {
        b.iter(|| {
            let hit = manager
                .check_subnet_available(pool.id, addr("10.0.128.0"), 24)
                .unwrap();
            let miss = manager
                .check_subnet_available(pool.id, addr("10.0.4.0"), 24)
                .unwrap();
            black_box((hit, miss))
        });
    });
}

/// Benchmark the hold-down sweep over many quarantined leaves
fn bench_hold_down_sweep(c: &mut Criterion) {
    c.bench_function("subnet_hold_down_sweep", |b| {
        b.iter_batched(
            || {
                let manager = PoolManager::with_config(PoolManagerConfig {
                    hold_down_period: chrono::Duration::zero(),
                });
                let pool = pool_of(&manager, "10.0.0.0", 18);
                for _ in 0..64 {
                    let leaf = manager
                        .allocate_subnet(pool.id, Some(28))
                        .unwrap()
                        .unwrap();
                    manager.release_subnet(leaf.id).unwrap();
                }
                (manager, pool.id)
            },
            |(manager, pool_id)| black_box(manager.reclaim_held_down(pool_id).unwrap()),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_allocate_to_exhaustion,
    bench_single_allocation,
    bench_allocate_free_cycle,
    bench_fragmented_allocation,
    bench_reserve_specific_block,
    bench_check_availability,
    bench_hold_down_sweep,
);

criterion_main!(benches);
