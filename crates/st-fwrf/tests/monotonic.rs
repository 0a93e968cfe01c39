mod common;

use ndarray::{Array1, Array2};
use st_fwrf::{BatchedFitter, CellReport, OptimizeBatches, SgdUnitFactory, TrainingOptions};

#[test]
fn best_scores_never_increase_across_candidate_batches() {
    let base = common::feature_maps(31, 24, 4, 1);
    // eight candidates with progressively noisier copies of the features
    let noise = common::feature_maps(32, 24, 4, 8);
    let rfw = ndarray::Array4::from_shape_fn((24, 4, 1, 8), |(s, f, _, t)| {
        base[[s, f, 0, 0]] + 0.2 * t as f32 * noise[[s, f, t, 0]]
    });
    let voxels = common::responses(33, 24, 7);

    let batches = OptimizeBatches {
        samples: 6,
        voxels: 3,
        candidates: 2,
    };
    let training = TrainingOptions {
        validation_size: 6,
        learning_rate: 0.05,
        epochs: 3,
        ..TrainingOptions::default()
    };
    let mut fitter = BatchedFitter::new(batches, training).expect("fitter");

    let mut snapshots: Vec<(std::ops::Range<usize>, Vec<f32>)> = Vec::new();
    let mut sink = |report: &CellReport<'_>| {
        assert!(report.models_per_second >= 0.0);
        assert!(report.mean_validation_loss.is_finite());
        snapshots.push((report.voxels.clone(), report.best_scores.to_vec()));
    };
    let state = fitter
        .fit(
            rfw.view(),
            voxels.view(),
            Array2::zeros((7, 4)).view(),
            Array1::zeros(7).view(),
            &mut SgdUnitFactory::new(0.05, 0.0, 0.0),
            &mut sink,
        )
        .expect("fit");

    // three voxel batches (3, 3, 1) times four candidate batches
    assert_eq!(snapshots.len(), 12);
    for window in snapshots.windows(2) {
        let (prev_range, prev) = &window[0];
        let (range, next) = &window[1];
        if prev_range != range {
            continue;
        }
        for (a, b) in prev.iter().zip(next) {
            assert!(b <= a, "best score rose from {a} to {b}");
        }
    }
    for (range, scores) in &snapshots {
        assert_eq!(scores.len(), range.len());
    }
    assert!(state.best_scores.iter().all(|s| s.is_finite()));
}
