// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! RF-weighted feature summaries ("RFW data").
//!
//! Each feature map is contracted over its spatial axes against the RF weights
//! of every (unit, candidate) pair, and the resolutions are concatenated along
//! the feature axis. The resulting tensor is shaped
//! `(samples, features, units, candidates)`, where `units` is 1 for a shared
//! grid.

use crate::batch::{self, BatchRange};
use crate::config::{NormalizationOptions, PrecomputeBatches};
use crate::error::{FwrfError, FwrfResult};
use crate::grid::CandidateGrid;
use crate::rf::{FeatureMapSpec, RfWeightBuffer};
use ndarray::{s, Array4, ArrayView4, ArrayViewMut4, Axis};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

/// Elementwise nonlinearity applied to precomputed summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nonlinearity {
    #[default]
    Identity,
    /// `max(v, 0)`
    Rectify,
    Tanh,
    /// `ln(1 + max(v, 0))`
    Log1p,
    /// `sign(v) * sqrt(|v|)`
    SignedSqrt,
}

impl Nonlinearity {
    pub fn apply(self, value: f32) -> f32 {
        match self {
            Nonlinearity::Identity => value,
            Nonlinearity::Rectify => value.max(0.0),
            Nonlinearity::Tanh => value.tanh(),
            Nonlinearity::Log1p => value.max(0.0).ln_1p(),
            Nonlinearity::SignedSqrt => value.signum() * value.abs().sqrt(),
        }
    }
}

/// Sizes reported before a precompute pass. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEstimate {
    pub rf_weight_bytes: usize,
    pub rfw_data_bytes: usize,
    pub chunk_bytes: usize,
}

impl MemoryEstimate {
    pub fn new(
        specs: &[FeatureMapSpec],
        samples: usize,
        units: usize,
        candidates: usize,
        batches: &PrecomputeBatches,
    ) -> Self {
        let f32_bytes = std::mem::size_of::<f32>();
        let features: usize = specs.iter().map(|s| s.channels).sum();
        let rf_weight_bytes = specs
            .iter()
            .map(|s| batches.units * batches.candidates * s.pixels() * s.pixels() * f32_bytes)
            .sum();
        Self {
            rf_weight_bytes,
            rfw_data_bytes: samples * features * units * candidates * f32_bytes,
            chunk_bytes: batches.samples * features * batches.units * batches.candidates * f32_bytes,
        }
    }

    pub fn log(&self) {
        const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
        info!(
            target: "st_fwrf::summarize",
            rfw_gib = self.rfw_data_bytes as f64 / GIB,
            chunk_gib = self.chunk_bytes as f64 / GIB,
            rf_weight_mib = self.rf_weight_bytes as f64 / (1024.0 * 1024.0),
            "precomputed candidate features memory estimate"
        );
    }
}

fn check_maps(feature_maps: &[ArrayView4<'_, f32>], rf: &RfWeightBuffer) -> FwrfResult<usize> {
    if feature_maps.is_empty() {
        return Err(FwrfError::NoFeatureMaps);
    }
    if feature_maps.len() != rf.resolutions().len() {
        return Err(FwrfError::shape(
            "feature map resolutions",
            &[rf.resolutions().len()],
            &[feature_maps.len()],
        ));
    }
    let samples = feature_maps[0].dim().0;
    for (index, (maps, weights)) in feature_maps.iter().zip(rf.resolutions()).enumerate() {
        let (n, _, height, width) = maps.dim();
        if height != width {
            return Err(FwrfError::NonSquareFeatureMap {
                index,
                height,
                width,
            });
        }
        if n != samples {
            return Err(FwrfError::SampleCountMismatch {
                features: samples,
                targets: n,
            });
        }
        if weights.dim().2 != height {
            return Err(FwrfError::shape(
                "rf weight pixels",
                &[weights.dim().2],
                &[height],
            ));
        }
    }
    Ok(samples)
}

/// Contracts one chunk of feature maps against the current RF weights.
///
/// `out` must be shaped `(samples, features, units, candidates)` matching the
/// chunk and the buffer's batch shape.
pub fn summarize_into(
    feature_maps: &[ArrayView4<'_, f32>],
    rf: &RfWeightBuffer,
    mut out: ArrayViewMut4<'_, f32>,
) -> FwrfResult<()> {
    let samples = check_maps(feature_maps, rf)?;
    let (units, candidates) = rf.batch_shape();
    let features: usize = feature_maps.iter().map(|m| m.dim().1).sum();
    let expected = [samples, features, units, candidates];
    if out.shape() != expected {
        return Err(FwrfError::shape("rfw chunk", &expected, out.shape()));
    }
    let mut offset = 0;
    for (maps, weights) in feature_maps.iter().zip(rf.resolutions()) {
        let (n, channels, pixels, _) = maps.dim();
        let area = pixels * pixels;
        let lhs = maps.to_shape((n * channels, area))?;
        let rhs = weights.to_shape((units * candidates, area))?;
        let contracted = lhs.dot(&rhs.t()).into_shape((n, channels, units, candidates))?;
        out.slice_mut(s![.., offset..offset + channels, .., ..])
            .assign(&contracted);
        offset += channels;
    }
    Ok(())
}

/// Precomputes the RFW tensor for every candidate of `grid`.
///
/// The work is chunked along samples, candidates and (for per-unit grids)
/// units. The candidate batch must divide the candidate count.
pub fn precompute(
    feature_maps: &[ArrayView4<'_, f32>],
    grid: &CandidateGrid,
    batches: &PrecomputeBatches,
    field_of_view: f32,
    normalization: &NormalizationOptions,
    dry_run: bool,
) -> FwrfResult<Array4<f32>> {
    let specs: Vec<FeatureMapSpec> = feature_maps
        .iter()
        .enumerate()
        .map(|(layer, maps)| FeatureMapSpec::of(layer, maps))
        .collect();
    let features = crate::rf::total_features(&specs)?;
    let candidates = grid.len();
    let candidate_batches = batch::exact_batch_count(candidates, batches.candidates)?;
    let units = grid.units();
    let unit_batch = if grid.is_shared() { 1 } else { batches.units };
    let samples = sample_count(feature_maps)?;

    let layout = PrecomputeBatches {
        units: unit_batch,
        ..*batches
    };
    MemoryEstimate::new(&specs, samples, units, candidates, &layout).log();

    let mut rfw = Array4::<f32>::zeros((samples, features, units, candidates));
    if dry_run {
        return Ok(rfw);
    }

    let mut rf = RfWeightBuffer::new(&specs, unit_batch, batches.candidates, field_of_view)?;
    let mut scratch = Array4::<f32>::zeros((batches.samples.min(samples), features, unit_batch, batches.candidates));
    let start = Instant::now();
    for unit_range in batch::batches(0, units, unit_batch, "unit")? {
        debug!(
            target: "st_fwrf::summarize",
            units = ?unit_range.range(),
            candidate_batches,
            "summarising unit batch"
        );
        for t in 0..candidate_batches {
            let cands = BatchRange {
                start: t * batches.candidates,
                len: batches.candidates,
            };
            let (xs, ys, ss) = grid.candidate_block(unit_range.range(), cands.range())?;
            rf.fill(xs.view(), ys.view(), ss.view())?;
            for excerpt in batch::batches(0, samples, batches.samples, "sample")? {
                let chunk: Vec<ArrayView4<'_, f32>> = feature_maps
                    .iter()
                    .map(|m| m.slice(s![excerpt.range(), .., .., ..]))
                    .collect();
                let mut target = scratch.slice_mut(s![..excerpt.len, .., .., ..]);
                summarize_into(&chunk, &rf, target.view_mut())?;
                rfw.slice_mut(s![excerpt.range(), .., unit_range.range(), cands.range()])
                    .assign(&target.slice(s![.., .., ..unit_range.len, ..]));
            }
        }
    }
    rf.release();
    let elapsed = start.elapsed().as_secs_f64();
    info!(
        target: "st_fwrf::summarize",
        candidates = candidates * units,
        seconds = elapsed,
        models_per_second = (candidates * units) as f64 / elapsed.max(f64::EPSILON),
        "rfw candidate responses computed"
    );

    normalize(&mut rfw, normalization, batches.candidates)?;
    Ok(rfw)
}

/// Applies the configured nonlinearity and z-scoring, one candidate chunk at a time.
pub fn normalize(
    rfw: &mut Array4<f32>,
    options: &NormalizationOptions,
    candidate_chunk: usize,
) -> FwrfResult<()> {
    let candidates = rfw.dim().3;
    if options.nonlinearity != Nonlinearity::Identity {
        info!(target: "st_fwrf::summarize", nonlinearity = ?options.nonlinearity, "applying nonlinearity");
        for chunk in batch::batches(0, candidates, candidate_chunk, "candidate")? {
            rfw.slice_mut(s![.., .., .., chunk.range()])
                .mapv_inplace(|v| options.nonlinearity.apply(v));
        }
    }
    if options.zscore {
        let samples = rfw.dim().0;
        let training = options.training_size.unwrap_or(samples).min(samples);
        info!(target: "st_fwrf::summarize", training, "z-scoring candidate features");
        for chunk in batch::batches(0, candidates, candidate_chunk, "candidate")? {
            zscore(
                rfw.slice_mut(s![.., .., .., chunk.range()]),
                training,
                options.epsilon,
            );
        }
    }
    Ok(())
}

/// Z-scores every `(feature, unit, candidate)` series with statistics from the
/// first `training` samples: `(x - mean) / (epsilon + std)`. Non-finite results
/// become zero.
pub fn zscore(mut block: ArrayViewMut4<'_, f32>, training: usize, epsilon: f32) {
    let (_, features, units, candidates) = block.dim();
    for f in 0..features {
        for u in 0..units {
            for t in 0..candidates {
                let mut series = block.slice_mut(s![.., f, u, t]);
                let head = series.slice(s![..training]);
                let count = head.len().max(1) as f64;
                let mean = head.iter().map(|&v| f64::from(v)).sum::<f64>() / count;
                let var = head
                    .iter()
                    .map(|&v| {
                        let d = f64::from(v) - mean;
                        d * d
                    })
                    .sum::<f64>()
                    / count;
                let mean = mean as f32;
                let denom = epsilon + var.sqrt() as f32;
                series.mapv_inplace(|v| {
                    let z = (v - mean) / denom;
                    if z.is_finite() {
                        z
                    } else {
                        0.0
                    }
                });
            }
        }
    }
}

/// Sample count of a stack of feature maps, checking they agree.
pub fn sample_count(feature_maps: &[ArrayView4<'_, f32>]) -> FwrfResult<usize> {
    let first = feature_maps.first().ok_or(FwrfError::NoFeatureMaps)?;
    let samples = first.len_of(Axis(0));
    for maps in feature_maps.iter().skip(1) {
        if maps.len_of(Axis(0)) != samples {
            return Err(FwrfError::SampleCountMismatch {
                features: samples,
                targets: maps.len_of(Axis(0)),
            });
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{ModelSpec, Subdivision};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn ramp_maps(samples: usize, channels: usize, pixels: usize) -> Array4<f32> {
        Array4::from_shape_fn((samples, channels, pixels, pixels), |(n, c, i, j)| {
            (n + 1) as f32 * (c as f32 + 1.0) + 0.1 * (i * pixels + j) as f32
        })
    }

    #[test]
    fn contraction_matches_manual_sum() {
        let maps = ramp_maps(3, 2, 4);
        let specs = [FeatureMapSpec::of(0, &maps.view())];
        let mut rf = RfWeightBuffer::new(&specs, 1, 2, 8.0).unwrap();
        let xs = Array2::from_shape_vec((1, 2), vec![0.0, 2.0]).unwrap();
        let ys = Array2::from_shape_vec((1, 2), vec![0.0, -2.0]).unwrap();
        let ss = Array2::from_shape_vec((1, 2), vec![1.0, 3.0]).unwrap();
        rf.fill(xs.view(), ys.view(), ss.view()).unwrap();

        let mut out = Array4::zeros((3, 2, 1, 2));
        summarize_into(&[maps.view()], &rf, out.view_mut()).unwrap();
        let w = &rf.resolutions()[0];
        for n in 0..3 {
            for c in 0..2 {
                for t in 0..2 {
                    let manual: f32 = (0..4)
                        .flat_map(|i| (0..4).map(move |j| (i, j)))
                        .map(|(i, j)| maps[[n, c, i, j]] * w[[0, t, i, j]])
                        .sum();
                    assert_abs_diff_eq!(out[[n, c, 0, t]], manual, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn chunked_precompute_is_chunk_invariant() {
        let coarse = ramp_maps(7, 2, 4);
        let fine = ramp_maps(7, 1, 6);
        let maps = [coarse.view(), fine.view()];
        let grid = CandidateGrid::shared(
            &ModelSpec::new([0.0, 0.0, 1.0], [8.0, 8.0, 3.0]),
            [Subdivision::linear(2), Subdivision::linear(2), Subdivision::log(2)],
        )
        .unwrap();
        let small = PrecomputeBatches {
            samples: 3,
            candidates: 2,
            units: 1,
        };
        let large = PrecomputeBatches {
            samples: 7,
            candidates: 8,
            units: 1,
        };
        let norm = NormalizationOptions::default();
        let a = precompute(&maps, &grid, &small, 16.0, &norm, false).unwrap();
        let b = precompute(&maps, &grid, &large, 16.0, &norm, false).unwrap();
        assert_eq!(a.dim(), (7, 3, 1, 8));
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-4);
        }
    }

    #[test]
    fn per_unit_grid_fills_unit_axis() {
        let maps = ramp_maps(4, 1, 4);
        let specs = [
            ModelSpec::new([-2.0, 0.0, 1.0], [0.0, 0.0, 0.0]),
            ModelSpec::new([2.0, 0.0, 1.0], [0.0, 0.0, 0.0]),
            ModelSpec::new([0.0, 2.0, 1.0], [0.0, 0.0, 0.0]),
        ];
        let grid = CandidateGrid::per_unit(&specs, [Subdivision::linear(1); 3]).unwrap();
        let batches = PrecomputeBatches {
            samples: 4,
            candidates: 1,
            units: 2,
        };
        let rfw = precompute(&[maps.view()], &grid, &batches, 8.0, &NormalizationOptions::default(), false)
            .unwrap();
        assert_eq!(rfw.dim(), (4, 1, 3, 1));
        // a unit to the right sees larger column indices, hence larger ramp values
        assert!(rfw[[0, 0, 1, 0]] > rfw[[0, 0, 0, 0]]);
        // a unit above sees smaller row indices
        assert!(rfw[[0, 0, 2, 0]] < rfw[[0, 0, 1, 0]]);
    }

    #[test]
    fn residual_candidate_batch_is_rejected() {
        let maps = ramp_maps(2, 1, 2);
        let grid = CandidateGrid::shared(
            &ModelSpec::new([0.0, 0.0, 1.0], [1.0, 1.0, 1.0]),
            [Subdivision::linear(3), Subdivision::linear(1), Subdivision::linear(1)],
        )
        .unwrap();
        let batches = PrecomputeBatches {
            samples: 2,
            candidates: 2,
            units: 1,
        };
        let err = precompute(&[maps.view()], &grid, &batches, 4.0, &NormalizationOptions::default(), false)
            .unwrap_err();
        assert!(matches!(err, FwrfError::CandidateBatchMismatch { batch: 2, candidates: 3 }));
    }

    #[test]
    fn zscore_of_constant_window_is_zero() {
        let mut block = Array4::<f32>::from_elem((6, 2, 1, 3), 4.5);
        zscore(block.view_mut(), 4, 0.0);
        assert!(block.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn zscore_uses_training_prefix_only() {
        let mut block = Array4::<f32>::zeros((4, 1, 1, 1));
        for (n, v) in [1.0f32, 3.0, 100.0, -100.0].iter().enumerate() {
            block[[n, 0, 0, 0]] = *v;
        }
        zscore(block.view_mut(), 2, 1.0);
        // mean 2, std 1 over the first two samples
        assert_abs_diff_eq!(block[[0, 0, 0, 0]], -0.5);
        assert_abs_diff_eq!(block[[1, 0, 0, 0]], 0.5);
        assert_abs_diff_eq!(block[[2, 0, 0, 0]], 49.0);
    }

    #[test]
    fn nonlinearities() {
        assert_eq!(Nonlinearity::Rectify.apply(-2.0), 0.0);
        assert_eq!(Nonlinearity::SignedSqrt.apply(-4.0), -2.0);
        assert_abs_diff_eq!(Nonlinearity::Log1p.apply(std::f32::consts::E - 1.0), 1.0, epsilon = 1e-6);
        assert_eq!(Nonlinearity::Log1p.apply(-5.0), 0.0);
    }
}
