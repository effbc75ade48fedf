//! Engine-path benchmarks: every operation goes through the full stack
//! (facade, atomic operation, lock services, Buffer append + fsync).
//!
//! ## Key access patterns
//!
//! - `hot_record`: one record touched repeatedly (cache-friendly best case)
//! - `spread`: each write lands on its own record (index-heavy worst case)
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench engine_ops
//! cargo bench --bench engine_ops -- "add"   # specific group
//! ```

use concourse::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

fn open_db() -> (TempDir, Concourse) {
    let dir = TempDir::new().unwrap();
    let db = Concourse::open(dir.path()).unwrap();
    (dir, db)
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");
    group.throughput(Throughput::Elements(1));

    let (_dir, db) = open_db();
    let counter = AtomicU64::new(0);
    group.bench_function("hot_record", |b| {
        b.iter(|| {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            db.add("counter", Value::Int64(n as i64), Record::new(1)).unwrap()
        })
    });

    let (_dir2, db) = open_db();
    let counter = AtomicU64::new(0);
    group.bench_function("spread", |b| {
        b.iter(|| {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            db.add("value", Value::Int64(n as i64), Record::new(n)).unwrap()
        })
    });
    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    group.throughput(Throughput::Elements(1));

    let (_dir, db) = open_db();
    for i in 0..1_000u64 {
        db.add("age", Value::Int32((i % 90) as i32), Record::new(i)).unwrap();
    }

    group.bench_function("verify_hit", |b| {
        b.iter(|| db.verify("age", &Value::Int32(0), black_box(Record::new(0))).unwrap())
    });
    group.bench_function("select", |b| {
        b.iter(|| db.select("age", black_box(Record::new(500))).unwrap())
    });
    group.bench_function("find_range", |b| {
        b.iter(|| {
            db.find("age", Operator::Between, &[Value::Int32(20), Value::Int32(40)]).unwrap()
        })
    });
    group.finish();
}

fn bench_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction");
    group.throughput(Throughput::Elements(1));

    let (_dir, db) = open_db();
    let counter = AtomicU64::new(0);
    group.bench_function("stage_and_commit", |b| {
        b.iter(|| {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            let token = db.start_transaction().unwrap();
            db.add_in(&token, "txn", Value::Int64(n as i64), Record::new(n)).unwrap();
            assert!(db.commit(&token).unwrap());
        })
    });
    group.finish();
}

criterion_group!(benches, bench_add, bench_reads, bench_transactions);
criterion_main!(benches);
