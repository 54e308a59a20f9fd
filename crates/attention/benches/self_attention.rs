use attention::{AttentionConfig, ClusterAttention, ClusterAttentionConfig, MultiHeadAttention};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{norm::NormSettings, Layer};

fn bench_self_attention(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 8usize;
    let frames = 300usize;
    let feature_size = 1024usize;
    let head_counts = &[1usize, 4, 8];

    let input = Tensor::randn(0f32, 1.0, (batch, frames, feature_size), &device).expect("input");
    let mut group = c.benchmark_group("self_attention");
    group.throughput(Throughput::Elements((batch * frames * feature_size) as u64));
    for &heads in head_counts {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attention = MultiHeadAttention::new(
            AttentionConfig::new(feature_size, 512, heads),
            &NormSettings::default(),
            vb.pp("attention"),
        )
        .expect("attention");

        group.bench_with_input(BenchmarkId::new("heads", heads), &input, |b, input| {
            b.iter(|| {
                let out = attention.forward_t(black_box(input), false).expect("forward");
                black_box(out);
            });
        });
    }
    group.finish();
}

fn bench_cluster_attention(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 8usize;
    let frames = 300usize;
    let feature_size = 1024usize;

    let input = Tensor::randn(0f32, 1.0, (batch, frames, feature_size), &device).expect("input");
    let mut group = c.benchmark_group("cluster_attention");
    for &clusters in &[8usize, 32] {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = ClusterAttention::new(
            ClusterAttentionConfig::new(feature_size, frames, clusters),
            &NormSettings::default(),
            vb.pp("clusters"),
        )
        .expect("cluster attention");

        group.bench_with_input(BenchmarkId::new("clusters", clusters), &input, |b, input| {
            b.iter(|| {
                let out = layer.forward_t(black_box(input), false).expect("forward");
                black_box(out);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_self_attention, bench_cluster_attention);
criterion_main!(benches);
