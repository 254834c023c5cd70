//! Apply engine benchmarks.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use sedesync_bench::{remote_creates, remote_history};
use sedesync_core::{ApplyContext, ChangeQuery, SiteNode};
use sedesync_protocol::{Site, SiteCode, SiteId};

fn fresh_node() -> SiteNode {
    SiteNode::in_memory(Site::new(SiteCode::Sur, "Sede Sur"))
}

/// Benchmark applying batches of new records.
fn bench_apply_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_batch");

    for batch_size in [10usize, 100, 500].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let origin = SiteId::new();
                let ctx = ApplyContext::pull(SiteId::new());
                b.iter_batched(
                    || (fresh_node(), remote_creates(origin, batch_size)),
                    |(node, records)| {
                        let outcomes = node.apply_batch(&ctx, black_box(&records)).unwrap();
                        black_box(outcomes);
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

/// Benchmark replaying records that were already applied.
fn bench_duplicate_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("duplicate_replay");
    let origin = SiteId::new();
    let ctx = ApplyContext::pull(SiteId::new());
    let node = fresh_node();
    let records = remote_creates(origin, 100);
    node.apply_batch(&ctx, &records).unwrap();

    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("100", |b| {
        b.iter(|| {
            let outcomes = node.apply_batch(&ctx, black_box(&records)).unwrap();
            black_box(outcomes);
        });
    });

    group.finish();
}

/// Benchmark one record's long history applied in order.
fn bench_entity_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("entity_history");

    for updates in [10usize, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(updates), updates, |b, &updates| {
            let origin = SiteId::new();
            let ctx = ApplyContext::pull(SiteId::new());
            b.iter_batched(
                || (fresh_node(), remote_history(origin, updates)),
                |(node, records)| {
                    black_box(node.apply_batch(&ctx, &records).unwrap());
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark serving pull pages from a populated log.
fn bench_changes_since(c: &mut Criterion) {
    let mut group = c.benchmark_group("changes_since");
    let ctx = ApplyContext::pull(SiteId::new());
    let node = fresh_node();
    node.apply_batch(&ctx, &remote_creates(SiteId::new(), 5_000))
        .unwrap();

    for limit in [100usize, 500].iter() {
        group.throughput(Throughput::Elements(*limit as u64));
        group.bench_with_input(BenchmarkId::from_parameter(limit), limit, |b, &limit| {
            let query = ChangeQuery {
                since: 2_000,
                tables: None,
                exclude_origin: Some(SiteId::new()),
                limit,
            };
            b.iter(|| {
                let page = node.changes().changes_since(black_box(&query)).unwrap();
                black_box(page);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_apply_batch,
    bench_duplicate_replay,
    bench_entity_history,
    bench_changes_since,
);

criterion_main!(benches);
