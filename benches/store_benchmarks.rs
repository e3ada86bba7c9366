use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use indexmap::IndexMap;
use serde_json::json;
use shortstack::search::SearchEngine;
use shortstack::store::codec;
use shortstack::{BackendKind, ObjectStore, Pager, Record, Shortstack, StoreConfig, Tenant};
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn sample_records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            Record::new("product")
                .with_name(format!("Laptop Gaming Product {}", i))
                .with_tags(["electronics", "computers"])
                .with_property("price", json!(100 + i * 10))
                .with_property("description", json!(format!("High performance laptop {}", i)))
        })
        .collect()
}

fn open(backend: BackendKind, dir: &TempDir) -> Shortstack {
    let config = StoreConfig::default()
        .with_backend(backend)
        .with_data_dir(dir.path());
    Shortstack::open(config).unwrap()
}

fn bench_codec(c: &mut Criterion) {
    let mut record = sample_records(1).remove(0);
    record.stamp_for_create("bench", 1_700_000_000_000);
    let row = codec::to_row(&record, &record.id, &[]).unwrap();

    let mut group = c.benchmark_group("codec");
    group.bench_function("to_row", |b| {
        b.iter(|| codec::to_row(&record, &record.id, &[]).unwrap())
    });
    group.bench_function("from_row", |b| b.iter(|| codec::from_row(&row).unwrap()));
    group.finish();
}

fn bench_batch_writes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("create_all");

    for backend in [BackendKind::Memory, BackendKind::Table] {
        for size in [25, 100, 500] {
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(
                BenchmarkId::new(backend.as_str(), size),
                &size,
                |b, &size| {
                    b.iter_batched(
                        || {
                            let temp = TempDir::new().unwrap();
                            let app = open(backend, &temp);
                            rt.block_on(app.create_tenant(&Tenant::new("bench"))).unwrap();
                            (temp, app, sample_records(size))
                        },
                        |(temp, app, mut records)| {
                            rt.block_on(app.store().create_all("bench", &mut records))
                                .unwrap();
                            drop(temp);
                        },
                        criterion::BatchSize::SmallInput,
                    )
                },
            );
        }
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let temp = TempDir::new().unwrap();
    let app = open(BackendKind::Memory, &temp);
    rt.block_on(async {
        app.create_tenant(&Tenant::new("bench")).await.unwrap();
        let records = sample_records(5000);
        app.search().index_all("bench", &records).await.unwrap();
    });

    let mut group = c.benchmark_group("search");
    group.throughput(Throughput::Elements(5000));

    group.bench_function("free_text", |b| {
        b.iter(|| {
            rt.block_on(
                app.search()
                    .find_query("bench", Some("product"), "laptop", &mut Pager::new(10)),
            )
        })
    });

    group.bench_function("range_terms", |b| {
        let terms: IndexMap<String, serde_json::Value> =
            [("price>=".to_string(), json!(2000)), ("price<".to_string(), json!(8000))]
                .into_iter()
                .collect();
        b.iter(|| {
            rt.block_on(app.search().find_terms(
                "bench",
                None,
                &terms,
                true,
                &mut Pager::new(10),
            ))
        })
    });

    group.bench_function("tagged", |b| {
        let tags = vec!["electronics".to_string(), "computers".to_string()];
        b.iter(|| {
            rt.block_on(
                app.search()
                    .find_tagged("bench", None, &tags, &mut Pager::new(10)),
            )
        })
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_batch_writes, bench_search);
criterion_main!(benches);
