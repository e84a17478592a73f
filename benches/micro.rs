//! Micro-benchmarks for the write-path core.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run everything
//! cargo bench --bench micro -- skiplist  # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use tempfile::TempDir;
use tenaxdb::codec::{key_with_ts, ValueStruct};
use tenaxdb::engine::{Engine, Options};
use tenaxdb::skiplist::Skiplist;

/// 64-byte value payload.
const VALUE_64B: &[u8; 64] = &[0xab; 64];

fn make_key(i: u64) -> Vec<u8> {
    key_with_ts(format!("key-{i:012}").as_bytes(), 0)
}

fn bench_skiplist(c: &mut Criterion) {
    let mut group = c.benchmark_group("skiplist");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put", |b| {
        let value = ValueStruct {
            value: VALUE_64B.to_vec(),
            ..ValueStruct::default()
        };
        let mut skl = Skiplist::new(256 << 20);
        let mut i = 0u64;
        b.iter(|| {
            // Fresh arena every million inserts; the budget would run
            // out long before criterion stops iterating.
            if i % 1_000_000 == 0 {
                skl = Skiplist::new(256 << 20);
            }
            skl.put(&make_key(i), &value);
            i += 1;
        });
    });

    group.bench_function("get_hit", |b| {
        let skl = Skiplist::new(64 << 20);
        let value = ValueStruct {
            value: VALUE_64B.to_vec(),
            ..ValueStruct::default()
        };
        for i in 0..100_000 {
            skl.put(&make_key(i), &value);
        }
        let mut i = 0u64;
        b.iter(|| {
            let got = skl.get(&make_key(i % 100_000));
            black_box(got);
            i += 1;
        });
    });

    group.bench_function("get_miss", |b| {
        let skl = Skiplist::new(64 << 20);
        let value = ValueStruct {
            value: VALUE_64B.to_vec(),
            ..ValueStruct::default()
        };
        for i in 0..100_000 {
            skl.put(&make_key(i), &value);
        }
        b.iter(|| {
            let got = skl.get(&make_key(u64::MAX));
            black_box(got);
        });
    });

    group.finish();
}

fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    group.throughput(Throughput::Elements(1));

    group.bench_function("commit_single_put", |b| {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::new(dir.path().to_str().unwrap());
        opts.memtable_size = 256 << 20;
        let engine = Engine::open(opts).unwrap();

        let mut i = 0u64;
        b.iter(|| {
            let mut txn = engine.new_transaction();
            txn.set(format!("bench-{i:012}").into_bytes(), VALUE_64B.to_vec())
                .unwrap();
            txn.commit().unwrap();
            i += 1;
        });

        engine.close().unwrap();
    });

    group.finish();
}

criterion_group!(benches, bench_skiplist, bench_engine);
criterion_main!(benches);
