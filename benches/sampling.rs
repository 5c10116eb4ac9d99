//! Micro-benchmarks for the sampler and guidance hot paths.
//!
//! Run with: `cargo bench -- sampling`

use candle_core::{Device, Tensor};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use valle::generation::sampling::{apply_dry, apply_repetition_penalty, top_p_filter};
use valle::generation::{fuse, sample, sample_mirostat, MirostatState, SamplingContext, SamplingPolicy};

const VOCAB: usize = 1026;

fn pattern_row(vocab: usize) -> Vec<f32> {
    (0..vocab).map(|i| (i as f32 * 0.1).sin() * 5.0).collect()
}

fn pattern_logits(rows: usize, vocab: usize, device: &Device) -> Tensor {
    let data: Vec<f32> = (0..rows).flat_map(|_| pattern_row(vocab)).collect();
    Tensor::from_vec(data, (rows, vocab), device).unwrap()
}

fn bench_sample_policies(c: &mut Criterion) {
    let device = Device::Cpu;
    let logits = vec![pattern_logits(1, VOCAB, &device)];
    let history = vec![(0..200).map(|i| (i * 7 % 1024) as u32).collect::<Vec<_>>()];
    let mut group = c.benchmark_group("sample_policy");

    let policies = [
        ("greedy", SamplingPolicy::greedy()),
        (
            "top_k_50",
            SamplingPolicy {
                temperature: 0.95,
                top_k: 50,
                ..Default::default()
            },
        ),
        (
            "top_p_0.9",
            SamplingPolicy {
                temperature: 0.95,
                top_p: 0.9,
                ..Default::default()
            },
        ),
        (
            "penalties",
            SamplingPolicy {
                temperature: 0.95,
                repetition_penalty: 1.35,
                repetition_penalty_decay: 0.5,
                dry_multiplier: 0.8,
                ..Default::default()
            },
        ),
        (
            "dynamic_temp",
            SamplingPolicy {
                temperature: 1.0,
                min_temperature: 0.5,
                ..Default::default()
            },
        ),
    ];

    for (name, policy) in policies {
        group.bench_with_input(BenchmarkId::from_parameter(name), &policy, |b, policy| {
            let mut ctx = SamplingContext::new(Some(42));
            b.iter(|| sample(black_box(&logits), black_box(&history), policy, &mut ctx).unwrap());
        });
    }
    group.finish();
}

fn bench_nar_level(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("sample_nar_level");

    // one NAR level: every frame of the utterance in one call
    for frames in [75, 450] {
        let logits = vec![pattern_logits(frames, VOCAB, &device)];
        let policy = SamplingPolicy::default().with_temperature(0.5);
        group.bench_with_input(BenchmarkId::from_parameter(frames), &frames, |b, _| {
            let mut ctx = SamplingContext::new(Some(42));
            b.iter(|| sample(black_box(&logits), &[], &policy, &mut ctx).unwrap());
        });
    }
    group.finish();
}

fn bench_penalties(c: &mut Criterion) {
    let mut group = c.benchmark_group("penalties");
    let row = pattern_row(VOCAB);

    for n_prev in [50, 450] {
        let prev: Vec<u32> = (0..n_prev).map(|i| (i * 13 % 1024) as u32).collect();
        group.bench_with_input(BenchmarkId::new("repetition", n_prev), &prev, |b, prev| {
            b.iter(|| {
                let mut row = row.clone();
                apply_repetition_penalty(&mut row, black_box(prev), 1.35, 0.5);
                row
            });
        });
        group.bench_with_input(BenchmarkId::new("dry", n_prev), &prev, |b, prev| {
            b.iter(|| {
                let mut row = row.clone();
                apply_dry(&mut row, black_box(prev), 0.8, 1.75, 2);
                row
            });
        });
    }
    group.bench_function("top_p_0.9", |b| {
        b.iter(|| {
            let mut row = row.clone();
            top_p_filter(&mut row, black_box(0.9));
            row
        });
    });
    group.finish();
}

fn bench_mirostat(c: &mut Criterion) {
    let rows = vec![pattern_row(VOCAB); 4];
    c.bench_function("mirostat_batch_4", |b| {
        let mut ctx = SamplingContext::new(Some(42));
        let mut states = vec![MirostatState::new(3.0, 0.1); 4];
        b.iter(|| {
            states = sample_mirostat(black_box(&rows), states.clone(), 1.0, &mut ctx).unwrap();
        });
    });
}

fn bench_cfg_fuse(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("cfg_fuse");

    for frames in [1, 75, 450] {
        let cond = pattern_logits(frames, VOCAB, &device);
        let uncond = (cond.affine(0.5, 0.1)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(frames), &frames, |b, &frames| {
            b.iter(|| fuse(black_box(&cond), black_box(&uncond), 2.5, 0.75, Some(frames)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_sample_policies,
    bench_nar_level,
    bench_penalties,
    bench_mirostat,
    bench_cfg_fuse,
);
criterion_main!(benches);
