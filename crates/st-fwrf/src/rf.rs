// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Gaussian receptive-field pooling weights.
//!
//! For a candidate RF `(x, y, size)` every feature-map pixel receives the mass
//! of an isotropic Gaussian integrated over that pixel, normalised so the
//! pixels of one candidate sum to one. The weight of a pixel is therefore the
//! probability that the voxel "sees" it through its receptive field; whether
//! the pixel matters is left to the encoding weights.
//!
//! Visual space spans `[-fov/2, fov/2]` on both axes, x grows to the right and
//! y grows upwards, so row 0 of a map is the top edge.

use crate::error::{FwrfError, FwrfResult};
use ndarray::{s, Array4, ArrayView2, ArrayView4, ArrayViewMut2};
use serde::{Deserialize, Serialize};
use std::f64::consts::SQRT_2;
use tracing::{debug, info};

/// Shape metadata of one group of feature maps sharing a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMapSpec {
    pub layer: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl FeatureMapSpec {
    pub fn new(layer: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            layer,
            channels,
            height,
            width,
        }
    }

    /// Reads the metadata of a `(samples, channels, height, width)` array.
    pub fn of(layer: usize, maps: &ArrayView4<'_, f32>) -> Self {
        let (_, channels, height, width) = maps.dim();
        Self::new(layer, channels, height, width)
    }

    pub fn pixels(&self) -> usize {
        self.height
    }

    pub fn ensure_square(&self, index: usize) -> FwrfResult<()> {
        if self.height != self.width {
            return Err(FwrfError::NonSquareFeatureMap {
                index,
                height: self.height,
                width: self.width,
            });
        }
        Ok(())
    }
}

/// Validates a list of specs and returns the total feature count.
pub fn total_features(specs: &[FeatureMapSpec]) -> FwrfResult<usize> {
    if specs.is_empty() {
        return Err(FwrfError::NoFeatureMaps);
    }
    let mut total = 0;
    for (index, spec) in specs.iter().enumerate() {
        spec.ensure_square(index)?;
        total += spec.channels;
    }
    Ok(total)
}

fn pixel_masses(center: f64, sigma: f64, pixels: usize, dpix: f64, origin: f64, descending: bool) -> Vec<f64> {
    let scale = SQRT_2 * sigma;
    (0..pixels)
        .map(|k| {
            let (lo, hi) = if descending {
                (origin - (k + 1) as f64 * dpix, origin - k as f64 * dpix)
            } else {
                (origin + k as f64 * dpix, origin + (k + 1) as f64 * dpix)
            };
            0.5 * (libm::erf((hi - center) / scale) - libm::erf((lo - center) / scale))
        })
        .collect()
}

/// Writes the normalised Gaussian mass of one RF into a `pixels x pixels` view.
///
/// Non-positive or non-finite sizes and RFs whose mass vanishes inside the
/// field of view produce an all-zero mask.
pub fn gaussian_mass_into(x: f32, y: f32, size: f32, field_of_view: f32, out: &mut ArrayViewMut2<'_, f32>) {
    let (rows, cols) = out.dim();
    out.fill(0.0);
    if !(size > 0.0) || !size.is_finite() || rows == 0 || cols == 0 {
        return;
    }
    let fov = f64::from(field_of_view);
    let dpix = fov / cols as f64;
    let half = fov / 2.0;
    let sigma = f64::from(size);
    let mx = pixel_masses(f64::from(x), sigma, cols, dpix, -half, false);
    let my = pixel_masses(f64::from(y), sigma, rows, dpix, half, true);
    let total = mx.iter().sum::<f64>() * my.iter().sum::<f64>();
    if !(total > f64::MIN_POSITIVE) {
        return;
    }
    for (i, wy) in my.iter().enumerate() {
        for (j, wx) in mx.iter().enumerate() {
            out[[i, j]] = (wy * wx / total) as f32;
        }
    }
}

/// Preallocated RF weights, one `(units, candidates, pixels, pixels)` tensor per
/// feature-map resolution.
///
/// The buffer is overwritten in place by [`RfWeightBuffer::fill`]; a view into
/// it is only meaningful until the next fill.
#[derive(Debug, Clone)]
pub struct RfWeightBuffer {
    field_of_view: f32,
    batch_units: usize,
    batch_candidates: usize,
    weights: Vec<Array4<f32>>,
}

impl RfWeightBuffer {
    pub fn new(
        specs: &[FeatureMapSpec],
        batch_units: usize,
        batch_candidates: usize,
        field_of_view: f32,
    ) -> FwrfResult<Self> {
        if batch_units == 0 {
            return Err(FwrfError::ZeroBatchSize { axis: "voxel" });
        }
        if batch_candidates == 0 {
            return Err(FwrfError::ZeroBatchSize { axis: "candidate" });
        }
        if !(field_of_view > 0.0) || !field_of_view.is_finite() {
            return Err(FwrfError::InvalidScalar {
                label: "field_of_view",
                value: field_of_view,
            });
        }
        let features = total_features(specs)?;
        let mut weights = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let pixels = spec.pixels();
            debug!(
                target: "st_fwrf::rf",
                resolution = index,
                shape = ?(batch_units, batch_candidates, pixels, pixels),
                "allocating rf weights"
            );
            weights.push(Array4::zeros((batch_units, batch_candidates, pixels, pixels)));
        }
        let buffer = Self {
            field_of_view,
            batch_units,
            batch_candidates,
            weights,
        };
        info!(
            target: "st_fwrf::rf",
            features,
            resolutions = specs.len(),
            megabytes = buffer.memory_bytes() as f64 / (1024.0 * 1024.0),
            "rf weight buffer ready"
        );
        Ok(buffer)
    }

    pub fn batch_shape(&self) -> (usize, usize) {
        (self.batch_units, self.batch_candidates)
    }

    pub fn field_of_view(&self) -> f32 {
        self.field_of_view
    }

    pub fn resolutions(&self) -> &[Array4<f32>] {
        &self.weights
    }

    pub fn memory_bytes(&self) -> usize {
        self.weights
            .iter()
            .map(|w| w.len() * std::mem::size_of::<f32>())
            .sum()
    }

    /// Synthesises the weights of a `(units, candidates)` block of RFs.
    ///
    /// `units` may be smaller than the buffer's unit batch; the trailing rows
    /// are zeroed so residual voxel batches carry no weight.
    pub fn fill(
        &mut self,
        xs: ArrayView2<'_, f32>,
        ys: ArrayView2<'_, f32>,
        sizes: ArrayView2<'_, f32>,
    ) -> FwrfResult<()> {
        let (units, candidates) = xs.dim();
        if ys.dim() != xs.dim() || sizes.dim() != xs.dim() {
            return Err(FwrfError::shape("rf coordinates", xs.shape(), ys.shape()));
        }
        if units > self.batch_units || candidates != self.batch_candidates {
            return Err(FwrfError::shape(
                "rf block",
                &[self.batch_units, self.batch_candidates],
                &[units, candidates],
            ));
        }
        let fov = self.field_of_view;
        for weights in self.weights.iter_mut() {
            for u in 0..units {
                for t in 0..candidates {
                    let mut mask = weights.slice_mut(s![u, t, .., ..]);
                    gaussian_mass_into(xs[[u, t]], ys[[u, t]], sizes[[u, t]], fov, &mut mask);
                }
            }
            if units < self.batch_units {
                weights.slice_mut(s![units.., .., .., ..]).fill(0.0);
            }
        }
        Ok(())
    }

    /// Drops the allocation once a session is over.
    pub fn release(&mut self) {
        for weights in self.weights.iter_mut() {
            *weights = Array4::zeros((0, 0, 0, 0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn mass_sums_to_one_and_peaks_at_center() {
        let mut mask = Array2::<f32>::zeros((8, 8));
        gaussian_mass_into(0.0, 0.0, 2.0, 16.0, &mut mask.view_mut());
        assert_abs_diff_eq!(mask.sum(), 1.0, epsilon = 1e-5);
        // pixels 3 and 4 straddle the origin on both axes
        let peak = mask[[3, 3]];
        assert_abs_diff_eq!(peak, mask[[4, 4]], epsilon = 1e-7);
        assert!(mask.iter().all(|&w| w <= peak + 1e-7));
    }

    #[test]
    fn positive_y_moves_mass_to_top_rows() {
        let mut mask = Array2::<f32>::zeros((10, 10));
        gaussian_mass_into(-5.0, 5.0, 1.0, 20.0, &mut mask.view_mut());
        let top_left: f32 = mask.slice(s![..5, ..5]).sum();
        assert!(top_left > 0.95, "mass {top_left}");
    }

    #[test]
    fn degenerate_size_yields_zero_mask() {
        let mut mask = Array2::<f32>::ones((4, 4));
        gaussian_mass_into(0.0, 0.0, 0.0, 4.0, &mut mask.view_mut());
        assert_eq!(mask.sum(), 0.0);
    }

    #[test]
    fn buffer_rejects_non_square_maps() {
        let specs = [FeatureMapSpec::new(0, 3, 4, 5)];
        assert!(matches!(
            RfWeightBuffer::new(&specs, 1, 1, 20.0),
            Err(FwrfError::NonSquareFeatureMap { index: 0, .. })
        ));
    }

    #[test]
    fn fill_zeroes_padding_units() {
        let specs = [FeatureMapSpec::new(0, 1, 4, 4), FeatureMapSpec::new(1, 2, 2, 2)];
        let mut buffer = RfWeightBuffer::new(&specs, 2, 2, 8.0).unwrap();
        buffer.fill(array![[0.0, 1.0]].view(), array![[0.0, -1.0]].view(), array![[1.0, 2.0]].view()).unwrap();
        for weights in buffer.resolutions() {
            assert_abs_diff_eq!(weights.slice(s![0, 0, .., ..]).sum(), 1.0, epsilon = 1e-5);
            assert_eq!(weights.slice(s![1, .., .., ..]).sum(), 0.0);
        }
        assert_eq!(buffer.memory_bytes(), 4 * (2 * 2 * 16 + 2 * 2 * 4));
        buffer.release();
        assert_eq!(buffer.memory_bytes(), 0);
    }
}
