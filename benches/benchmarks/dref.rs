use objectd::dref::DRef;
use std::fs::{File, OpenOptions};
use std::path::Path;

use criterion::{black_box, criterion_group, Criterion};

criterion_group!(dref, borrow_already_open, borrow_forces_reopen);

fn opener(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

fn borrow_already_open(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("obj");
    std::fs::write(&path, b"hello").unwrap();
    let cell = DRef::new(path, opener);
    let _keep_open = cell.borrow().unwrap();

    c.bench_function("dref borrow, already open", |b| {
        b.iter(|| black_box(cell.borrow().unwrap()));
    });
}

fn borrow_forces_reopen(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("obj");
    std::fs::write(&path, b"hello").unwrap();
    let cell = DRef::new(path, opener);

    c.bench_function("dref borrow, closed each time", |b| {
        b.iter(|| {
            let handle = cell.borrow().unwrap();
            cell.request_close();
            drop(handle);
        });
    });
}
