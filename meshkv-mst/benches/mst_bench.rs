//! Benchmarks for tree maintenance and diff throughput.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use meshkv_mst::{diff, MerkleSearchTree, ValueDigest};

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("key-{i:08}")).collect()
}

fn build(keys: &[String]) -> MerkleSearchTree<String> {
    let mut tree = MerkleSearchTree::new();
    for key in keys {
        tree.upsert(key.clone(), ValueDigest::of(key.as_bytes()));
    }
    tree
}

fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert");
    for n in [100, 1_000, 10_000] {
        let keys = keys(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_function(format!("{n}_keys"), |b| {
            b.iter_batched(
                || keys.clone(),
                |keys| build(&keys),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_root_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("root_hash");
    for n in [1_000, 10_000] {
        let tree = build(&keys(n));
        group.bench_function(format!("cold_{n}_keys"), |b| {
            b.iter_batched(
                || tree.clone(),
                |mut tree| tree.root_hash(),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    for n in [1_000, 10_000] {
        let base = keys(n);
        let local = build(&base).serialize_page_ranges();
        let mut peer_tree = build(&base);
        peer_tree.upsert(format!("key-{:08}", n / 2), ValueDigest::of(b"changed"));
        let peer = peer_tree.serialize_page_ranges();

        group.bench_function(format!("one_change_{n}_keys"), |b| {
            b.iter(|| diff(&local, &peer));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_upsert, bench_root_hash, bench_diff);
criterion_main!(benches);
