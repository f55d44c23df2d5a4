use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relay_sync::relay::index::Index;
use relay_sync::relay::record::Metadata;

fn make_index(entries: usize) -> Index {
    let timestamp = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
    let mut index = Index::new(Some(timestamp));
    index.pusher = Some("laptop".to_string());
    for i in 0..entries {
        let resource = format!("dir{}/file{}.txt", i % 50, i);
        let checksum = format!("{:064x}", i);
        index.entries.insert(
            resource.clone(),
            Metadata::new("laptop", &resource, Some(timestamp), Some(checksum)),
        );
    }
    index.pullers = vec!["desktop".to_string(), "server".to_string()];
    index
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_parse");

    for entries in [100, 1000, 10000].iter() {
        let index = make_index(*entries);
        for compress in [false, true] {
            let raw = index.serialize(compress).unwrap();
            let label = if compress { "zstd" } else { "plain" };
            group.bench_with_input(BenchmarkId::new(label, entries), &raw, |b, raw| {
                b.iter(|| Index::parse("bench", black_box(raw)).unwrap());
            });
        }
    }
    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_serialize");

    for entries in [100, 1000, 10000].iter() {
        let index = make_index(*entries);
        group.bench_with_input(BenchmarkId::from_parameter(entries), &index, |b, index| {
            b.iter(|| black_box(index).serialize(false).unwrap());
        });
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let base = make_index(10000);
    let diff = make_index(100);
    c.bench_function("index_merge_100_into_10000", |b| {
        b.iter(|| {
            let mut merged = base.clone();
            merged.merge(black_box(&diff));
            merged
        });
    });
}

criterion_group!(benches, bench_parse, bench_serialize, bench_merge);
criterion_main!(benches);
