// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Maps winning flat candidate indices back to absolute `(x, y, size)` models.

use crate::error::{FwrfError, FwrfResult};
use crate::grid::CandidateGrid;
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Absolute models `(voxels, 3)` for indices into a grid shared by every voxel.
pub fn shared_models(best_models: ArrayView1<'_, usize>, grid: &CandidateGrid) -> FwrfResult<Array2<f32>> {
    let mut out = Array2::zeros((best_models.len(), 3));
    for (v, &flat) in best_models.iter().enumerate() {
        let [x, y, s] = grid.candidate(0, flat)?;
        out.row_mut(v).assign(&ndarray::arr1(&[x, y, s]));
    }
    Ok(out)
}

/// Absolute models `(voxels, 3)` where voxel `v` indexes its own grid row.
pub fn per_unit_models(best_models: ArrayView1<'_, usize>, grid: &CandidateGrid) -> FwrfResult<Array2<f32>> {
    if grid.units() != best_models.len() {
        return Err(FwrfError::UnitCountMismatch {
            grid: grid.units(),
            requested: best_models.len(),
        });
    }
    let mut out = Array2::zeros((best_models.len(), 3));
    for (v, &flat) in best_models.iter().enumerate() {
        let [x, y, s] = grid.candidate(v, flat)?;
        out[[v, 0]] = x;
        out[[v, 1]] = y;
        out[[v, 2]] = s;
    }
    Ok(out)
}

/// Dispatches on the grid kind.
pub fn absolute_models(best_models: ArrayView1<'_, usize>, grid: &CandidateGrid) -> FwrfResult<Array2<f32>> {
    if grid.is_shared() {
        shared_models(best_models, grid)
    } else {
        per_unit_models(best_models, grid)
    }
}

/// Effective population RF per voxel.
///
/// The size is the weighted average, over features, of
/// `sqrt(fmap_sigma[f]^2 + pool_sigma[v]^2)` using the voxel's fitted weights;
/// the position is the pooling RF position. When a voxel's weights sum to zero
/// the pooling size is returned unchanged.
pub fn effective_rf(
    weights: ArrayView2<'_, f32>,
    fmap_sigma: ArrayView1<'_, f32>,
    pool_rf: ArrayView2<'_, f32>,
) -> FwrfResult<Array2<f32>> {
    let (nv, nf) = weights.dim();
    if fmap_sigma.len() != nf {
        return Err(FwrfError::shape("feature map sigmas", &[nf], fmap_sigma.shape()));
    }
    if pool_rf.dim() != (nv, 3) {
        return Err(FwrfError::shape("pooling rf", &[nv, 3], pool_rf.shape()));
    }
    let mut out = pool_rf.to_owned();
    for v in 0..nv {
        let pool = f64::from(pool_rf[[v, 2]]);
        let mut total = 0.0f64;
        let mut weighted = 0.0f64;
        for f in 0..nf {
            let w = f64::from(weights[[v, f]]);
            let sigma = f64::from(fmap_sigma[f]);
            total += w;
            weighted += w * (sigma * sigma + pool * pool).sqrt();
        }
        if total.abs() > f64::EPSILON {
            out[[v, 2]] = (weighted / total) as f32;
        }
    }
    Ok(out)
}
