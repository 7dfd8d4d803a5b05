use objectd::dref::DRef;
use objectd::index::{Index, ObjectEntry, PolicyFlags};
use objectd::uri::Uri;
use std::path::PathBuf;
use std::sync::Arc;

use criterion::{black_box, criterion_group, Criterion};

criterion_group!(index, insert_into_empty, find_present, find_absent);

fn dummy_dref() -> Arc<DRef> {
    DRef::new(PathBuf::from("/nonexistent"), std::fs::File::open)
}

fn entry(uri: &str) -> ObjectEntry {
    ObjectEntry::new(
        Uri::parse(uri).unwrap(),
        0,
        PathBuf::from(uri),
        4096,
        0,
        PolicyFlags::empty(),
        dummy_dref(),
    )
}

fn insert_into_empty(c: &mut Criterion) {
    c.bench_function("index insert", |b| {
        b.iter_batched(
            || Index::with_capacity(16),
            |index| {
                index.insert(entry("/bench/obj")).unwrap();
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn find_present(c: &mut Criterion) {
    let index = Index::with_capacity(1024);
    for i in 0..1000 {
        index.insert(entry(&format!("/bench/{i}"))).unwrap();
    }

    c.bench_function("index find, present", |b| {
        b.iter(|| black_box(index.find("/bench/500")));
    });
}

fn find_absent(c: &mut Criterion) {
    let index = Index::with_capacity(1024);
    for i in 0..1000 {
        index.insert(entry(&format!("/bench/{i}"))).unwrap();
    }

    c.bench_function("index find, absent", |b| {
        b.iter(|| black_box(index.find("/bench/missing")));
    });
}
