use criterion::{criterion_group, BenchmarkId, Criterion};
use ndarray::{Array2, Array4};
use st_fwrf::{
    config::PrecomputeBatches, summarize, BatchedFitter, CandidateGrid, FeatureMapSpec, ModelSpec,
    NormalizationOptions, OptimizeBatches, RfWeightBuffer, SgdUnitFactory, Subdivision, TrainingOptions,
};

fn feature_maps(samples: usize, channels: usize, pixels: usize) -> Array4<f32> {
    Array4::from_shape_fn((samples, channels, pixels, pixels), |(n, c, i, j)| {
        (((n * 31 + c * 17 + i * 7 + j) % 13) as f32 - 6.0) / 6.0
    })
}

fn grid(per_axis: usize) -> CandidateGrid {
    CandidateGrid::shared(
        &ModelSpec::new([0.0, 0.0, 1.0], [16.0, 16.0, 6.0]),
        [
            Subdivision::linear(per_axis),
            Subdivision::linear(per_axis),
            Subdivision::log(4),
        ],
    )
    .expect("grid")
}

fn bench_rf_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("rf_weights");
    for pixels in [14usize, 28, 56] {
        let specs = [FeatureMapSpec::new(0, 1, pixels, pixels)];
        let mut buffer = RfWeightBuffer::new(&specs, 1, 16, 20.0).expect("buffer");
        let (xs, ys, ss) = grid(2).candidate_block(0..1, 0..16).expect("block");
        group.bench_with_input(BenchmarkId::from_parameter(pixels), &pixels, |b, _| {
            b.iter(|| {
                buffer.fill(xs.view(), ys.view(), ss.view()).expect("fill");
                criterion::black_box(buffer.memory_bytes())
            });
        });
    }
    group.finish();
}

fn bench_precompute(c: &mut Criterion) {
    let coarse = feature_maps(128, 32, 7);
    let fine = feature_maps(128, 16, 14);
    let maps = [coarse.view(), fine.view()];
    let grid = grid(4);
    let batches = PrecomputeBatches {
        samples: 64,
        candidates: 16,
        units: 1,
    };
    c.bench_function("precompute_rfw_64_candidates", |b| {
        b.iter(|| {
            let rfw = summarize::precompute(&maps, &grid, &batches, 20.0, &NormalizationOptions::default(), false)
                .expect("precompute");
            criterion::black_box(rfw)
        });
    });
}

fn bench_search(c: &mut Criterion) {
    let coarse = feature_maps(200, 24, 7);
    let grid = grid(4);
    let rfw = summarize::precompute(
        &[coarse.view()],
        &grid,
        &PrecomputeBatches {
            samples: 200,
            candidates: 16,
            units: 1,
        },
        20.0,
        &NormalizationOptions::default(),
        false,
    )
    .expect("precompute");
    let voxels = Array2::from_shape_fn((200, 32), |(s, v)| rfw[[s, v % 24, 0, (v * 5) % 64]]);
    let batches = OptimizeBatches {
        samples: 50,
        voxels: 16,
        candidates: 16,
    };
    let training = TrainingOptions {
        validation_size: 40,
        learning_rate: 1e-3,
        record_validation_scores: false,
        ..TrainingOptions::default()
    };
    c.bench_function("search_32_voxels_64_candidates", |b| {
        b.iter(|| {
            let mut fitter = BatchedFitter::new(batches, training).expect("fitter");
            let state = fitter
                .fit(
                    rfw.view(),
                    voxels.view(),
                    Array2::zeros((32, 24)).view(),
                    ndarray::Array1::zeros(32).view(),
                    &mut SgdUnitFactory::from_options(&training),
                    &mut |_: &st_fwrf::CellReport<'_>| {},
                )
                .expect("fit");
            criterion::black_box(state)
        });
    });
}

criterion_group!(benches, bench_rf_fill, bench_precompute, bench_search);

fn main() {
    // RUST_LOG=st_fwrf=debug shows buffer and layout events while profiling
    if let Err(err) = st_fwrf::telemetry::init_tracing_with("warn") {
        eprintln!("tracing disabled: {err}");
    }
    benches();
    Criterion::default().configure_from_args().final_summary();
}
