use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chainsync_core::{Row, SqlValue, TableSpec};
use chainsync_infra::postgres::build_upsert;
use chainsync_sync::{Partitioning, partition, prepare_rows};
use chrono::{TimeZone, Utc};

fn table() -> TableSpec {
    TableSpec::new(
        "pool_delegators",
        ["pool_id", "stake_address", "amount", "updated_at"],
        ["pool_id", "stake_address"],
    )
    .unwrap()
}

/// `n` rows where every tenth repeats an earlier key.
fn rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| {
            let key = if i % 10 == 9 { i - 1 } else { i };
            let at = Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap();
            Row::new(vec![
                SqlValue::text(format!("pool{}", key % 300)),
                SqlValue::text(format!("stake{key}")),
                SqlValue::numeric(i * 1_000),
                SqlValue::timestamp(at),
            ])
            .with_timestamp(at)
        })
        .collect()
}

fn bench_prepare_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare_rows");
    let table = table();

    for size in [500usize, 5_000, 50_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let input = rows(size);
            b.iter(|| black_box(prepare_rows(&table, input.clone()).unwrap()));
        });
    }
    group.finish();
}

fn bench_build_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_upsert");
    let table = table();
    let prepared = prepare_rows(&table, rows(500)).unwrap();

    group.throughput(Throughput::Elements(prepared.rows.len() as u64));
    group.bench_function("batch_of_500", |b| {
        b.iter(|| {
            let mut qb = build_upsert(&table, &prepared.rows);
            black_box(qb.build());
        });
    });
    group.finish();
}

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    let keys: Vec<String> = (0..10_000).map(|i| format!("pool{i}")).collect();

    for chunk in [1usize, 50, 500].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), chunk, |b, &chunk| {
            b.iter(|| black_box(partition(keys.clone(), Partitioning::Chunks(chunk))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_prepare_rows, bench_build_upsert, bench_partition);
criterion_main!(benches);
