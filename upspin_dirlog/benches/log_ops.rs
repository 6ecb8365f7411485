//! Append and read throughput of the transaction log. Appends pay an
//! fsync per record, so the interesting number is records per second on
//! the benchmark machine's disk, not CPU time.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use upspin_core::entry::{DirEntry, Packing};
use upspin_dirlog::{LogEntry, Op, UserLog, MAX_LOG_SIZE_DEFAULT};
use upspin_store_memory::MemoryStore;

const USER: &str = "bench@example.com";

fn record(seq: i64) -> LogEntry {
    let mut entry = DirEntry::new(&format!("{USER}/file"), Packing::Plain, USER);
    entry.sequence = seq;
    LogEntry::new(Op::Put, entry)
}

fn open_log(dir: &std::path::Path) -> UserLog {
    UserLog::open(
        USER,
        dir,
        Arc::new(MemoryStore::new("store")),
        MAX_LOG_SIZE_DEFAULT,
    )
    .unwrap()
}

fn bench_append(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    let mut seq = 0i64;
    c.bench_function("log_append", |b| {
        b.iter(|| {
            seq += 1;
            log.append(&record(seq)).unwrap()
        })
    });
}

fn bench_read_at(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    let offsets: Vec<i64> = (1..=1000).map(|seq| log.append(&record(seq)).unwrap()).collect();
    let reader = log.new_reader();
    let mut i = 0usize;
    c.bench_function("log_read_at", |b| {
        b.iter(|| {
            i = (i + 1) % offsets.len();
            reader.read_at(offsets[i]).unwrap()
        })
    });
}

criterion_group!(benches, bench_append, bench_read_at);
criterion_main!(benches);
