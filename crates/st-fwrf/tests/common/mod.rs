#![allow(dead_code)]

use ndarray::{Array2, Array4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use st_fwrf::{CandidateGrid, ModelSpec, Subdivision};

pub fn feature_maps(seed: u64, samples: usize, channels: usize, pixels: usize) -> Array4<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array4::from_shape_simple_fn((samples, channels, pixels, pixels), || rng.sample(StandardNormal))
}

pub fn responses(seed: u64, samples: usize, voxels: usize) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_simple_fn((samples, voxels), || rng.sample(StandardNormal))
}

/// 2 x 2 positions, `sizes` sizes, centered on the origin of an 8 degree field.
pub fn small_grid(sizes: usize) -> CandidateGrid {
    CandidateGrid::shared(
        &ModelSpec::new([0.0, 0.0, 1.0], [4.0, 4.0, 2.0]),
        [
            Subdivision::linear(2),
            Subdivision::linear(2),
            Subdivision::log(sizes),
        ],
    )
    .expect("grid")
}
