//! Benchmarks for sweep planning, reply parsing and data commits
//!
//! Run with: cargo bench

use chrono::Local;
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use smu_daq::acquisition::sweep_voltages;
use smu_daq::config::{CommandSet, InstrumentFamily};
use smu_daq::instrument::scpi::parse_reading;
use smu_daq::session::{DataSink, OverwritePolicy};
use smu_daq::types::{Sample, SessionMode, SweepParameters};
use std::time::Duration;

fn bench_sweep_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_planning");

    for steps in [10usize, 1_000, 100_000].iter() {
        let params = SweepParameters::new(-10.0, 10.0, 20.0 / *steps as f64, 0.01);
        group.throughput(Throughput::Elements(*steps as u64 * 2));
        group.bench_with_input(BenchmarkId::new("triangular", steps), &params, |b, params| {
            b.iter(|| sweep_voltages(black_box(params)))
        });
    }

    group.finish();
}

fn bench_reply_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_parsing");

    group.bench_function("plain", |b| b.iter(|| parse_reading(black_box("-1.234567E-09"))));
    group.bench_function("with_units", |b| {
        b.iter(|| parse_reading(black_box("+1.234567E-09NADC,+0.000000E+00SECS,+00000RDNG#")))
    });
    group.bench_function("render_source", |b| {
        let commands = InstrumentFamily::Keithley6517A.default_commands();
        b.iter(|| CommandSet::render(black_box(&commands.source_voltage), "voltage", 12.5))
    });

    group.finish();
}

fn samples(count: usize) -> Vec<Sample> {
    (0..count)
        .map(|i| Sample {
            sequence_index: i as u64,
            timestamp: Duration::from_millis(i as u64 * 10),
            applied_voltage: Some((i % 200) as f64 * 0.1),
            measured_current: 1e-9 * (i as f64).sin(),
        })
        .collect()
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    let dir = tempfile::TempDir::new().expect("create temp dir");

    for count in [100usize, 10_000].iter() {
        let data = samples(*count);
        let target = dir.path().join(format!("bench_{}.csv", count));
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("csv", count), &data, |b, data| {
            b.iter_batched(
                || {
                    let mut sink = DataSink::new(
                        SessionMode::Sweep,
                        Local::now(),
                        Some(target.clone()),
                        None,
                        OverwritePolicy::Overwrite,
                    );
                    for sample in data {
                        sink.push(*sample);
                    }
                    sink
                },
                |mut sink| sink.flush().expect("commit"),
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sweep_planning,
    bench_reply_parsing,
    bench_commit,
);
criterion_main!(benches);
