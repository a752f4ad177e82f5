//! Heapscope Benchmarks
//!
//! Walk and root-search throughput over synthetic heaps.
//! Run with: `cargo bench --package heapscope`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use heapscope::{
    HeapSession, RootSearchOptions, SearchMode, SessionConfig, SnapshotBuilder, TargetSnapshot,
};

/// `count` list nodes spread over segments of `per_segment`, rooted at the head
fn list_heap(count: usize, per_segment: usize) -> anyhow::Result<(TargetSnapshot, Vec<u64>)> {
    let mut builder = SnapshotBuilder::new();
    let node = builder.add_type("Bench.Node", 32, &[8]);
    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        if i % per_segment == 0 {
            builder.begin_segment();
        }
        nodes.push(builder.alloc(node));
    }
    for pair in nodes.windows(2) {
        builder.set_field(pair[0], 8, pair[1]);
    }
    let head = *nodes
        .first()
        .ok_or_else(|| anyhow::anyhow!("empty heap"))?;
    builder.add_strong_handle(head);
    Ok((builder.build(), nodes))
}

/// Wide tree: every object references `fanout` children
fn tree_heap(depth: u32, fanout: usize) -> anyhow::Result<(TargetSnapshot, u64)> {
    let mut builder = SnapshotBuilder::new();
    let offsets: Vec<u64> = (0..fanout as u64).map(|i| 8 + 8 * i).collect();
    let inner = builder.add_type("Bench.Inner", 16 + 8 * fanout as u32, &offsets);
    let leaf = builder.add_type("Bench.Leaf", 24, &[]);

    let root = builder.alloc(inner);
    let mut level = vec![root];
    let mut last = root;
    for d in 1..=depth {
        let ty = if d == depth { leaf } else { inner };
        let mut next = Vec::with_capacity(level.len() * fanout);
        for &parent in &level {
            for (i, &offset) in offsets.iter().enumerate() {
                let child = builder.alloc(ty);
                builder.set_field(parent, offset, child);
                if i == fanout - 1 {
                    last = child;
                }
                next.push(child);
            }
        }
        level = next;
    }
    builder.add_strong_handle(root);
    Ok((builder.build(), last))
}

fn bench_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("walk");

    for &count in &[10_000usize, 100_000] {
        let (snapshot, _) = list_heap(count, 25_000).unwrap();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("objects", count), &snapshot, |b, snap| {
            b.iter(|| {
                let session = HeapSession::open(snap, snap, SessionConfig::default()).unwrap();
                black_box(session.objects().filter(|o| o.is_ok()).count())
            })
        });
    }

    let (snapshot, _) = list_heap(100_000, 25_000).unwrap();
    for &page_size in &[4096usize, 64 * 1024] {
        let config = SessionConfig {
            page_size,
            ..Default::default()
        };
        group.bench_with_input(
            BenchmarkId::new("page_size", page_size),
            &config,
            |b, config| {
                b.iter(|| {
                    let session =
                        HeapSession::open(&snapshot, &snapshot, config.clone()).unwrap();
                    black_box(session.objects().count())
                })
            },
        );
    }

    group.finish();
}

fn bench_references(c: &mut Criterion) {
    let mut group = c.benchmark_group("references");

    let (snapshot, _) = tree_heap(4, 8).unwrap();
    let session = HeapSession::open(&snapshot, &snapshot, SessionConfig::default()).unwrap();
    let objects: Vec<_> = session.objects().filter_map(|o| o.ok()).collect();

    group.throughput(Throughput::Elements(objects.len() as u64));
    group.bench_function("outgoing_all", |b| {
        b.iter(|| {
            let mut edges = 0usize;
            for object in &objects {
                edges += session.references(object).unwrap().count();
            }
            black_box(edges)
        })
    });

    group.finish();
}

fn bench_root_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("root_search");
    group.sample_size(20);

    let (snapshot, nodes) = list_heap(100_000, 25_000).unwrap();
    let tail = *nodes.last().unwrap();
    group.bench_function("deep_list_unique", |b| {
        b.iter(|| {
            let session =
                HeapSession::open(&snapshot, &snapshot, SessionConfig::default()).unwrap();
            let report = session
                .root_finder()
                .find_roots(tail, RootSearchOptions::default())
                .unwrap();
            black_box(report.paths.len())
        })
    });

    let (snapshot, target) = tree_heap(4, 8).unwrap();
    for mode in [SearchMode::Unique, SearchMode::All] {
        let options = RootSearchOptions {
            mode,
            ..Default::default()
        };
        group.bench_with_input(
            BenchmarkId::new("tree", format!("{:?}", mode)),
            &options,
            |b, options| {
                b.iter(|| {
                    let session =
                        HeapSession::open(&snapshot, &snapshot, SessionConfig::default())
                            .unwrap();
                    black_box(session.root_finder().find_roots(target, *options).unwrap())
                })
            },
        );
    }

    group.bench_function("retained_size_tree", |b| {
        b.iter(|| {
            let session =
                HeapSession::open(&snapshot, &snapshot, SessionConfig::default()).unwrap();
            let root = snapshot.handles[0].target;
            black_box(session.root_finder().retained_size(root).unwrap().bytes)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_walk, bench_references, bench_root_search);
criterion_main!(benches);
