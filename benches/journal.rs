//! Micro-benchmarks for journal segment operations.
//!
//! Uses Criterion for statistically rigorous measurement.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench journal              # run everything
//! cargo bench --bench journal -- put       # filter by name
//! ```
//!
//! Reports land in `target/criterion/report/index.html`.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use quilldb::record::{JournalKey, LedgerKey, StandardValue};
use quilldb::segment::{PositionSample, SegmentWriter};
use tempfile::TempDir;

/// 128-byte object payload.
const OBJECT_128B: [u8; 128] = [0xAB; 128];

fn make_key(sqn: u64) -> JournalKey {
    JournalKey::standard(
        sqn,
        LedgerKey::object(format!("bench-key-{:012}", sqn % 4096).into_bytes()),
    )
}

fn make_value() -> Vec<u8> {
    StandardValue {
        object: OBJECT_128B.to_vec(),
        deltas: b"idx-delta".to_vec(),
    }
    .to_bytes()
    .expect("encode")
}

/// Writer with `n` records already appended.
fn loaded_writer(dir: &TempDir, n: u64) -> SegmentWriter {
    let path = dir.path().join("bench.pnd");
    let mut writer = SegmentWriter::create(&path, 1 << 30).expect("create");
    let value = make_value();
    for sqn in 1..=n {
        writer.put(&make_key(sqn), &value).expect("put");
    }
    writer
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_put");
    group.throughput(Throughput::Elements(100));
    group.bench_function("put_150b_x100", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().expect("tempdir");
                let writer =
                    SegmentWriter::create(dir.path().join("bench.pnd"), 1 << 30).expect("create");
                (dir, writer, make_value())
            },
            |(_dir, mut writer, value)| {
                for sqn in 1..=100u64 {
                    writer.put(&make_key(sqn), &value).expect("put");
                }
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_sealed_get(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let writer = loaded_writer(&dir, 4096);
    let reader = writer.complete().expect("seal");

    let mut group = c.benchmark_group("segment_get");
    group.throughput(Throughput::Elements(1));
    let mut sqn = 0u64;
    group.bench_function("sealed_get_hit", |b| {
        b.iter(|| {
            sqn = sqn % 4096 + 1;
            let found = reader.get(&make_key(sqn)).expect("get");
            assert!(found.is_some());
        });
    });
    group.bench_function("sealed_get_miss", |b| {
        b.iter(|| {
            sqn += 1;
            let absent = JournalKey::standard(
                sqn,
                LedgerKey::object(b"never-written".to_vec()),
            );
            assert!(reader.get(&absent).expect("get").is_none());
        });
    });
    group.finish();
}

fn bench_positions(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let writer = loaded_writer(&dir, 4096);
    let reader = writer.complete().expect("seal");

    let mut group = c.benchmark_group("segment_positions");
    group.bench_function("sample_200", |b| {
        b.iter(|| {
            let positions = reader.get_positions(PositionSample::Sample(200), Some(7));
            assert_eq!(positions.len(), 200);
        });
    });
    group.bench_function("all_4096", |b| {
        b.iter(|| {
            let positions = reader.get_positions(PositionSample::All, None);
            assert_eq!(positions.len(), 4096);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_put, bench_sealed_get, bench_positions);
criterion_main!(benches);
