use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use st_fwrf::NoiseModel;

#[test]
fn estimate_recovers_injected_noise() {
    let mut rng = StdRng::seed_from_u64(2024);
    let predicted = Array2::from_shape_simple_fn((50_000, 2), || 3.0 * rng.sample::<f32, _>(StandardNormal));
    let injected = NoiseModel {
        mean: array![0.5f32, -1.0],
        std: array![1.0f32, 2.0],
    };
    let observed = injected.apply(predicted.view(), &mut rng).expect("apply");
    let estimated = NoiseModel::estimate(observed.view(), predicted.view()).expect("estimate");

    for v in 0..2 {
        assert_abs_diff_eq!(estimated.mean[v], injected.mean[v], epsilon = 0.05);
        assert_abs_diff_eq!(estimated.std[v], injected.std[v], epsilon = 0.15);
    }
}
