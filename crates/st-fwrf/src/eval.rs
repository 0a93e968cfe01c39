// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Prediction and validation with fitted voxel models.
//!
//! Two input paths are supported: raw feature maps together with absolute RF
//! models `(voxels, 3)`, or a precomputed RFW tensor together with the flat
//! candidate index of every voxel.

use crate::batch;
use crate::config::EvaluateBatches;
use crate::error::{FwrfError, FwrfResult};
use crate::rf::{FeatureMapSpec, RfWeightBuffer};
use crate::summarize::{sample_count, summarize_into};
use ndarray::{s, Array1, Array2, Array4, ArrayView1, ArrayView2, ArrayView4, Axis};
use tracing::info;

/// Fitted encoding weights, `(voxels, features)` and `(voxels,)`.
#[derive(Debug, Clone, Copy)]
pub struct VoxelParams<'a> {
    pub weights: ArrayView2<'a, f32>,
    pub bias: ArrayView1<'a, f32>,
}

impl<'a> VoxelParams<'a> {
    pub fn new(weights: ArrayView2<'a, f32>, bias: ArrayView1<'a, f32>) -> Self {
        Self { weights, bias }
    }

    fn check(&self, voxels: usize, features: usize) -> FwrfResult<()> {
        if self.weights.dim() != (voxels, features) {
            return Err(FwrfError::shape(
                "voxel weights",
                &[voxels, features],
                self.weights.shape(),
            ));
        }
        if self.bias.len() != voxels {
            return Err(FwrfError::shape("voxel bias", &[voxels], self.bias.shape()));
        }
        Ok(())
    }
}

/// Pearson correlation of two series; zero when either has no variance.
pub fn correlation(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let count = n as f64;
    let mean_a = a.iter().take(n).map(|&v| f64::from(v)).sum::<f64>() / count;
    let mean_b = b.iter().take(n).map(|&v| f64::from(v)).sum::<f64>() / count;
    let (mut cov, mut var_a, mut var_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = f64::from(x) - mean_a;
        let dy = f64::from(y) - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return 0.0;
    }
    (cov / (var_a * var_b).sqrt()) as f32
}

/// Per-voxel correlation between prediction and observation columns.
pub fn column_correlations(predictions: ArrayView2<'_, f32>, observed: ArrayView2<'_, f32>) -> FwrfResult<Array1<f32>> {
    if predictions.dim() != observed.dim() {
        return Err(FwrfError::shape("observations", predictions.shape(), observed.shape()));
    }
    Ok(predictions
        .axis_iter(Axis(1))
        .zip(observed.axis_iter(Axis(1)))
        .map(|(p, o)| correlation(p, o))
        .collect())
}

fn log_layout(voxels: usize, batches: &EvaluateBatches) {
    let (full, residual) = batch::layout(voxels, batches.voxels);
    info!(
        target: "st_fwrf::eval",
        voxel_batches = full,
        voxel_batch = batches.voxels,
        voxel_residual = residual,
        "evaluation layout"
    );
}

/// Predicts `(samples, voxels)` responses from raw feature maps.
pub fn predict(
    feature_maps: &[ArrayView4<'_, f32>],
    models: ArrayView2<'_, f32>,
    params: VoxelParams<'_>,
    batches: &EvaluateBatches,
    field_of_view: f32,
) -> FwrfResult<Array2<f32>> {
    let specs: Vec<FeatureMapSpec> = feature_maps
        .iter()
        .enumerate()
        .map(|(layer, maps)| FeatureMapSpec::of(layer, maps))
        .collect();
    let nf = crate::rf::total_features(&specs)?;
    let n = sample_count(feature_maps)?;
    let nv = models.nrows();
    if models.ncols() != 3 {
        return Err(FwrfError::shape("voxel models", &[nv, 3], models.shape()));
    }
    params.check(nv, nf)?;
    if batches.samples == 0 {
        return Err(FwrfError::ZeroBatchSize { axis: "evaluation sample" });
    }
    log_layout(nv, batches);

    let bv = batches.voxels;
    let mut rf = RfWeightBuffer::new(&specs, bv, 1, field_of_view)?;
    let mut summary = Array4::<f32>::zeros((batches.samples.min(n), nf, bv, 1));
    let mut predictions = Array2::<f32>::zeros((n, nv));
    for rv in batch::batches(0, nv, bv, "evaluation voxel")? {
        let block = models.slice(s![rv.range(), ..]);
        let xs = block.slice(s![.., 0..1]);
        let ys = block.slice(s![.., 1..2]);
        let ss = block.slice(s![.., 2..3]);
        rf.fill(xs, ys, ss)?;
        for sb in batch::batches(0, n, batches.samples, "evaluation sample")? {
            let chunk: Vec<ArrayView4<'_, f32>> = feature_maps
                .iter()
                .map(|m| m.slice(s![sb.range(), .., .., ..]))
                .collect();
            let mut target = summary.slice_mut(s![..sb.len, .., .., ..]);
            summarize_into(&chunk, &rf, target.view_mut())?;
            for v in 0..rv.len {
                let voxel = rv.start + v;
                let tv: ArrayView2<'_, f32> = target.slice(s![.., .., v, 0]);
                let response = tv.dot(&params.weights.row(voxel)) + params.bias[voxel];
                predictions.slice_mut(s![sb.range(), voxel]).assign(&response);
            }
        }
    }
    rf.release();
    Ok(predictions)
}

/// Predicts from raw feature maps and scores the predictions against `voxels`.
pub fn validate(
    feature_maps: &[ArrayView4<'_, f32>],
    voxels: ArrayView2<'_, f32>,
    models: ArrayView2<'_, f32>,
    params: VoxelParams<'_>,
    batches: &EvaluateBatches,
    field_of_view: f32,
) -> FwrfResult<(Array2<f32>, Array1<f32>)> {
    let n = sample_count(feature_maps)?;
    if voxels.nrows() != n {
        return Err(FwrfError::SampleCountMismatch {
            features: n,
            targets: voxels.nrows(),
        });
    }
    let predictions = predict(feature_maps, models, params, batches, field_of_view)?;
    let scores = column_correlations(predictions.view(), voxels)?;
    Ok((predictions, scores))
}

/// Predicts from precomputed RFW data `(samples, features, 1 | voxels, candidates)`
/// using each voxel's flat candidate index.
pub fn predict_precomputed(
    rfw: ArrayView4<'_, f32>,
    best_models: ArrayView1<'_, usize>,
    params: VoxelParams<'_>,
    batches: &EvaluateBatches,
) -> FwrfResult<Array2<f32>> {
    let (n, nf, nu, nt) = rfw.dim();
    let nv = best_models.len();
    if nu != 1 && nu != nv {
        return Err(FwrfError::UnitCountMismatch {
            grid: nu,
            requested: nv,
        });
    }
    params.check(nv, nf)?;
    if let Some(&index) = best_models.iter().find(|&&m| m >= nt) {
        return Err(FwrfError::CandidateOutOfRange {
            index,
            candidates: nt,
        });
    }
    log_layout(nv, batches);
    let mut predictions = Array2::<f32>::zeros((n, nv));
    for rv in batch::batches(0, nv, batches.voxels, "evaluation voxel")? {
        for voxel in rv.range() {
            let unit = if nu == 1 { 0 } else { voxel };
            let features = rfw.slice(s![.., .., unit, best_models[voxel]]);
            let response = features.dot(&params.weights.row(voxel)) + params.bias[voxel];
            predictions.column_mut(voxel).assign(&response);
        }
    }
    Ok(predictions)
}

/// Precomputed counterpart of [`validate`].
pub fn validate_precomputed(
    rfw: ArrayView4<'_, f32>,
    voxels: ArrayView2<'_, f32>,
    best_models: ArrayView1<'_, usize>,
    params: VoxelParams<'_>,
    batches: &EvaluateBatches,
) -> FwrfResult<(Array2<f32>, Array1<f32>)> {
    if rfw.dim().0 != voxels.nrows() {
        return Err(FwrfError::SampleCountMismatch {
            features: rfw.dim().0,
            targets: voxels.nrows(),
        });
    }
    let predictions = predict_precomputed(rfw, best_models, params, batches)?;
    let scores = column_correlations(predictions.view(), voxels)?;
    Ok((predictions, scores))
}
