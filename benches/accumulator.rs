//! Criterion benchmarks for the per-spectrum hot paths.
//!
//! Every camera burst is reduced by parity and folded into running means
//! before the next stage move, so these bound how many frames a scan point
//! can afford.
//!
//! Key metrics:
//! - Incremental mean update per detector width
//! - Three-channel frame accumulation
//! - Chopped burst reduction
//!
//! Run with: cargo bench --bench accumulator

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fsrs_daq::data::{Accumulator, FrameAccumulator};
use fsrs_daq::hardware::chopper::split_by_parity;
use fsrs_daq::hardware::SpectrumFrame;

const WIDTHS: [usize; 4] = [256, 512, 1024, 2048];

fn spectrum(width: usize, seed: f64) -> Vec<f64> {
    (0..width).map(|px| 1000.0 + seed + (px as f64).sin()).collect()
}

/// Running mean update for common detector widths.
fn accumulator_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulator_push");

    for width in WIDTHS {
        let sample = spectrum(width, 0.5);
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("push", width), &width, |b, _| {
            let mut acc = Accumulator::new();
            b.iter(|| {
                acc.push(black_box(&sample)).unwrap();
            });
        });
    }

    group.finish();
}

/// Ratio and both chopping channels folded in together, as each spectrum
/// arrives at the controller.
fn frame_accumulator_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_accumulator_push");

    for width in WIDTHS {
        let frame = SpectrumFrame::new(
            spectrum(width, 0.0).iter().map(|v| v / 1000.0).collect(),
            spectrum(width, 1.0),
            spectrum(width, 0.0),
        );
        group.throughput(Throughput::Elements(3 * width as u64));
        group.bench_with_input(BenchmarkId::new("push_frame", width), &width, |b, _| {
            let mut acc = FrameAccumulator::new();
            b.iter(|| {
                acc.push_frame(black_box(&frame)).unwrap();
            });
        });
    }

    group.finish();
}

/// Reduction of one chopped burst into a spectrum frame.
fn parity_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("parity_split");

    for frames in [100usize, 1000, 4000] {
        let burst: Vec<Vec<f64>> = (0..frames)
            .map(|row| spectrum(1024, (row % 2) as f64))
            .collect();
        group.throughput(Throughput::Elements(frames as u64));
        group.bench_with_input(BenchmarkId::new("width_1024", frames), &frames, |b, _| {
            b.iter(|| split_by_parity(black_box(&burst), false));
        });
    }

    group.finish();
}

criterion_group!(benches, accumulator_push, frame_accumulator_push, parity_split);
criterion_main!(benches);
