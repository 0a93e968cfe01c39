// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{FwrfError, FwrfResult};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-voxel Gaussian residual noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseModel {
    pub mean: Array1<f32>,
    pub std: Array1<f32>,
}

impl NoiseModel {
    /// Estimates the noise left after `predicted` explains part of `observed`.
    ///
    /// Both arrays are `(samples, voxels)`. The mean is the average residual and
    /// the deviation is `sqrt(var(observed) - var(predicted))`; a negative
    /// radicand (a prediction more variable than the data) is clamped to zero.
    pub fn estimate(observed: ArrayView2<'_, f32>, predicted: ArrayView2<'_, f32>) -> FwrfResult<Self> {
        if observed.dim() != predicted.dim() {
            return Err(FwrfError::shape("predictions", observed.shape(), predicted.shape()));
        }
        let voxels = observed.ncols();
        let mut mean = Array1::zeros(voxels);
        let mut std = Array1::zeros(voxels);
        let mut clamped = 0usize;
        for (v, (obs, pred)) in observed
            .axis_iter(Axis(1))
            .zip(predicted.axis_iter(Axis(1)))
            .enumerate()
        {
            let count = obs.len().max(1) as f64;
            let residual = Zip::from(&obs)
                .and(&pred)
                .fold(0.0f64, |acc, &o, &p| acc + f64::from(o) - f64::from(p));
            mean[v] = (residual / count) as f32;
            let radicand = variance(obs.iter(), count) - variance(pred.iter(), count);
            if radicand < 0.0 {
                clamped += 1;
            }
            std[v] = radicand.max(0.0).sqrt() as f32;
        }
        if clamped > 0 {
            warn!(
                target: "st_fwrf::noise",
                clamped,
                voxels,
                "prediction variance exceeds observed variance; noise deviation clamped to zero"
            );
        }
        Ok(Self { mean, std })
    }

    pub fn voxels(&self) -> usize {
        self.mean.len()
    }

    /// Returns `observed` plus independent `N(mean[v], std[v]^2)` noise per element.
    pub fn apply<R: Rng>(&self, observed: ArrayView2<'_, f32>, rng: &mut R) -> FwrfResult<Array2<f32>> {
        if observed.ncols() != self.voxels() {
            return Err(FwrfError::shape("noisy voxels", &[self.voxels()], &[observed.ncols()]));
        }
        let mut out = observed.to_owned();
        for mut row in out.axis_iter_mut(Axis(0)) {
            Zip::from(&mut row)
                .and(&self.mean)
                .and(&self.std)
                .for_each(|value, &mean, &std| {
                    let z: f32 = rng.sample(StandardNormal);
                    *value += z * std + mean;
                });
        }
        Ok(out)
    }
}

fn variance<'a>(values: impl Iterator<Item = &'a f32> + Clone, count: f64) -> f64 {
    let mean = values.clone().map(|&v| f64::from(v)).sum::<f64>() / count;
    values
        .map(|&v| {
            let d = f64::from(v) - mean;
            d * d
        })
        .sum::<f64>()
        / count
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn perfect_prediction_has_zero_noise() {
        let obs = Array2::from_shape_fn((20, 3), |(s, v)| (s * (v + 1)) as f32);
        let model = NoiseModel::estimate(obs.view(), obs.view()).unwrap();
        assert!(model.mean.iter().all(|&m| m == 0.0));
        assert!(model.std.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn negative_radicand_is_clamped() {
        let obs = Array2::from_elem((10, 1), 1.0f32);
        let pred = Array2::from_shape_fn((10, 1), |(s, _)| s as f32);
        let model = NoiseModel::estimate(obs.view(), pred.view()).unwrap();
        assert_eq!(model.std[0], 0.0);
        assert_relative_eq!(model.mean[0], 1.0 - 4.5);
    }

    #[test]
    fn apply_is_reproducible_with_seeded_rng() {
        let model = NoiseModel {
            mean: Array1::from_vec(vec![0.5, -1.0]),
            std: Array1::from_vec(vec![1.0, 2.0]),
        };
        let obs = Array2::<f32>::zeros((4, 2));
        let a = model.apply(obs.view(), &mut StdRng::seed_from_u64(3)).unwrap();
        let b = model.apply(obs.view(), &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
        assert!(model.apply(Array2::<f32>::zeros((4, 3)).view(), &mut StdRng::seed_from_u64(3)).is_err());
    }
}
