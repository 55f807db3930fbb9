//! Benchmark for CowTree vs standard BTreeMap.
//!
//! Compares the tree against Rust's standard BTreeMap for common operations,
//! plus a derived-tree workload that measures the copy-on-write overhead.

use cowbtree::CowTree;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::collections::BTreeMap;

fn integer_tree() -> CowTree<i32, i32> {
    CowTree::new(|entry: &i32| *entry)
}

// =============================================================================
// insert Benchmark
// =============================================================================

fn benchmark_insert(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("insert");

    for size in [100, 1000, 10000] {
        // CowTree insert
        group.bench_with_input(BenchmarkId::new("CowTree", size), &size, |bencher, &size| {
            bencher.iter(|| {
                let mut tree = integer_tree();
                for key in 0..size {
                    tree.insert(black_box(key)).unwrap();
                }
                black_box(tree)
            });
        });

        // Standard BTreeMap insert
        group.bench_with_input(
            BenchmarkId::new("BTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = BTreeMap::new();
                    for key in 0..size {
                        map.insert(black_box(key), black_box(key));
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// get Benchmark
// =============================================================================

fn benchmark_get(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("get");

    for size in [100, 1000, 10000] {
        // Prepare data
        let mut tree = integer_tree();
        let mut map = BTreeMap::new();
        for key in 0..size {
            tree.insert(key).unwrap();
            map.insert(key, key);
        }

        // CowTree get
        group.bench_with_input(BenchmarkId::new("CowTree", size), &size, |bencher, &size| {
            bencher.iter(|| {
                let mut sum = 0;
                for key in 0..size {
                    if let Some(value) = tree.get(&black_box(key)).unwrap() {
                        sum += *value;
                    }
                }
                black_box(sum)
            });
        });

        // Standard BTreeMap get
        group.bench_with_input(
            BenchmarkId::new("BTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut sum = 0;
                    for key in 0..size {
                        if let Some(value) = map.get(&black_box(key)) {
                            sum += *value;
                        }
                    }
                    black_box(sum)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// iterate Benchmark
// =============================================================================

fn benchmark_iterate(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("iterate");

    for size in [100, 1000, 10000] {
        let mut tree = integer_tree();
        let mut map = BTreeMap::new();
        for key in 0..size {
            tree.insert(key).unwrap();
            map.insert(key, key);
        }

        group.bench_with_input(BenchmarkId::new("CowTree", size), &size, |bencher, _| {
            bencher.iter(|| {
                let sum: i32 = tree.iter().map(|entry| *entry).sum();
                black_box(sum)
            });
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &size, |bencher, _| {
            bencher.iter(|| {
                let sum: i32 = map.values().copied().sum();
                black_box(sum)
            });
        });
    }

    group.finish();
}

// =============================================================================
// derived insert Benchmark
// =============================================================================

/// Measures the copy-on-write overhead: the first writes into a freshly
/// derived tree clone their spine, later writes reuse the private chain.
fn benchmark_derived_insert(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("derived_insert");

    for size in [1000, 10000] {
        let mut base = integer_tree();
        for key in 0..size {
            base.insert(key * 2).unwrap();
        }

        group.bench_with_input(
            BenchmarkId::new("CowTree::derive", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut derived = base.derive();
                    for key in 0..size / 10 {
                        derived.insert(black_box(key * 20 + 1)).unwrap();
                    }
                    black_box(derived)
                });
            },
        );

        // The clone-everything alternative a BTreeMap user would reach for.
        let base_map: BTreeMap<i32, i32> = (0..size).map(|key| (key * 2, key * 2)).collect();
        group.bench_with_input(
            BenchmarkId::new("BTreeMap::clone", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut cloned = base_map.clone();
                    for key in 0..size / 10 {
                        cloned.insert(black_box(key * 20 + 1), key);
                    }
                    black_box(cloned)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_insert,
    benchmark_get,
    benchmark_iterate,
    benchmark_derived_insert
);
criterion_main!(benches);
