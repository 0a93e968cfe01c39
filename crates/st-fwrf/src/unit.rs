// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Trainable voxel encoders used inside one (voxel batch, candidate batch) cell.
//!
//! Inputs are RF-weighted features shaped `(samples, features, voxels_or_1,
//! candidates)`; a voxel axis of length one is broadcast to every voxel of the
//! unit. Outputs are shaped `(samples, voxels, candidates)`.

use crate::error::{FwrfError, FwrfResult};
use crate::optim::{Sgd, UpdateRule};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};

/// Shape contract between the fitting engine and a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitShape {
    pub features: usize,
    pub voxels: usize,
    pub candidates: usize,
}

impl UnitShape {
    pub fn new(features: usize, voxels: usize, candidates: usize) -> Self {
        Self {
            features,
            voxels,
            candidates,
        }
    }

    pub fn weight_dim(&self) -> (usize, usize, usize) {
        (self.features, self.voxels, self.candidates)
    }

    pub fn bias_dim(&self) -> (usize, usize) {
        (self.voxels, self.candidates)
    }

    fn check_inputs(&self, inputs: &ArrayView4<'_, f32>) -> FwrfResult<()> {
        let (_, features, voxels, candidates) = inputs.dim();
        if features != self.features
            || candidates != self.candidates
            || (voxels != 1 && voxels != self.voxels)
        {
            return Err(FwrfError::shape(
                "unit inputs",
                &[self.features, self.voxels, self.candidates],
                &[features, voxels, candidates],
            ));
        }
        Ok(())
    }
}

/// A batch of linear voxel models evaluated for every candidate at once.
pub trait TrainableUnit {
    fn shape(&self) -> UnitShape;

    /// Predictions `(samples, voxels, candidates)`.
    fn forward(&self, inputs: ArrayView4<'_, f32>) -> FwrfResult<Array3<f32>>;

    /// One optimisation step on a sample batch. `targets` is `(samples, voxels)`.
    fn apply_gradient_step(
        &mut self,
        inputs: ArrayView4<'_, f32>,
        targets: ArrayView2<'_, f32>,
    ) -> FwrfResult<()>;

    /// Weights `(features, voxels, candidates)`.
    fn weight(&self) -> ArrayView3<'_, f32>;

    /// Bias `(voxels, candidates)`.
    fn bias(&self) -> ArrayView2<'_, f32>;
}

/// Creates units for the fitting engine, once per candidate batch.
pub trait UnitFactory {
    type Unit: TrainableUnit;

    fn create(
        &mut self,
        shape: UnitShape,
        weight: Array3<f32>,
        bias: Array2<f32>,
    ) -> FwrfResult<Self::Unit>;
}

/// Linear encoder `pred[s, v, t] = sum_f x[s, f, v, t] * w[f, v, t] + b[v, t]`
/// trained on the per-(voxel, candidate) mean squared error plus an L2 penalty
/// on the weights.
///
/// Every voxel is computed independently and with a fixed summation order, so
/// the result for a voxel does not depend on which batch it was packed into.
#[derive(Debug, Clone)]
pub struct LinearVoxelUnit<R> {
    shape: UnitShape,
    weight: Array3<f32>,
    bias: Array2<f32>,
    l2: f32,
    rule: R,
    grad_weight: Array3<f32>,
    grad_bias: Array2<f32>,
}

impl<R: UpdateRule> LinearVoxelUnit<R> {
    pub fn new(
        shape: UnitShape,
        weight: Array3<f32>,
        bias: Array2<f32>,
        l2: f32,
        rule: R,
    ) -> FwrfResult<Self> {
        if weight.dim() != shape.weight_dim() {
            let (f, v, t) = weight.dim();
            let (ef, ev, et) = shape.weight_dim();
            return Err(FwrfError::shape("unit weight", &[ef, ev, et], &[f, v, t]));
        }
        if bias.dim() != shape.bias_dim() {
            let (ev, et) = shape.bias_dim();
            return Err(FwrfError::shape("unit bias", &[ev, et], bias.shape()));
        }
        if !(l2 >= 0.0) || !l2.is_finite() {
            return Err(FwrfError::InvalidScalar {
                label: "l2",
                value: l2,
            });
        }
        Ok(Self {
            grad_weight: Array3::zeros(shape.weight_dim()),
            grad_bias: Array2::zeros(shape.bias_dim()),
            shape,
            weight,
            bias,
            l2,
            rule,
        })
    }

    pub fn rule(&self) -> &R {
        &self.rule
    }
}

impl<R: UpdateRule> TrainableUnit for LinearVoxelUnit<R> {
    fn shape(&self) -> UnitShape {
        self.shape
    }

    fn forward(&self, inputs: ArrayView4<'_, f32>) -> FwrfResult<Array3<f32>> {
        self.shape.check_inputs(&inputs)?;
        let UnitShape {
            voxels, candidates, ..
        } = self.shape;
        let mut out = Array3::zeros((inputs.dim().0, voxels, candidates));
        out.assign(&self.bias);
        // accumulate feature by feature so each output keeps one summation order
        for (x, w) in inputs.axis_iter(Axis(1)).zip(self.weight.outer_iter()) {
            Zip::from(&mut out)
                .and_broadcast(&x)
                .and_broadcast(&w)
                .for_each(|o, &x, &w| *o += x * w);
        }
        Ok(out)
    }

    fn apply_gradient_step(
        &mut self,
        inputs: ArrayView4<'_, f32>,
        targets: ArrayView2<'_, f32>,
    ) -> FwrfResult<()> {
        let samples = inputs.dim().0;
        if targets.dim() != (samples, self.shape.voxels) {
            return Err(FwrfError::shape(
                "unit targets",
                &[samples, self.shape.voxels],
                targets.shape(),
            ));
        }
        if samples == 0 {
            return Ok(());
        }
        let err = &self.forward(inputs.view())? - &targets.insert_axis(Axis(2));
        let scale = 2.0 / samples as f32;
        let decay = 2.0 * self.l2;

        Zip::from(&mut self.grad_bias)
            .and(err.lanes(Axis(0)))
            .for_each(|g, e| *g = scale * e.fold(0.0, |acc, &e| acc + e));
        for (f, grad) in self.grad_weight.axis_iter_mut(Axis(0)).enumerate() {
            let feature = inputs.index_axis(Axis(1), f);
            let x = feature
                .broadcast(err.raw_dim())
                .ok_or_else(|| FwrfError::shape("unit inputs", err.shape(), feature.shape()))?;
            Zip::from(grad)
                .and(self.weight.index_axis(Axis(0), f))
                .and(err.lanes(Axis(0)))
                .and(x.lanes(Axis(0)))
                .for_each(|g, &w, e, x| {
                    let dot = Zip::from(e).and(x).fold(0.0, |acc, &e, &x| acc + e * x);
                    *g = scale * dot + decay * w;
                });
        }
        self.rule.apply(
            &mut self.weight,
            &mut self.bias,
            &self.grad_weight,
            &self.grad_bias,
        )
    }

    fn weight(&self) -> ArrayView3<'_, f32> {
        self.weight.view()
    }

    fn bias(&self) -> ArrayView2<'_, f32> {
        self.bias.view()
    }
}

/// Factory producing [`LinearVoxelUnit`]s with a fresh [`Sgd`] rule each time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdUnitFactory {
    pub learning_rate: f32,
    pub l2: f32,
    pub momentum: f32,
}

impl SgdUnitFactory {
    pub fn new(learning_rate: f32, l2: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            l2,
            momentum,
        }
    }

    pub fn from_options(options: &crate::config::TrainingOptions) -> Self {
        Self::new(options.learning_rate, options.l2, options.momentum)
    }
}

impl UnitFactory for SgdUnitFactory {
    type Unit = LinearVoxelUnit<Sgd>;

    fn create(
        &mut self,
        shape: UnitShape,
        weight: Array3<f32>,
        bias: Array2<f32>,
    ) -> FwrfResult<Self::Unit> {
        let rule = Sgd::new(self.learning_rate, self.momentum)?;
        LinearVoxelUnit::new(shape, weight, bias, self.l2, rule)
    }
}

/// Sum over samples of the squared error, per `(voxel, candidate)`.
pub fn squared_error_sums(
    pred: &Array3<f32>,
    targets: ArrayView2<'_, f32>,
) -> FwrfResult<Array2<f32>> {
    let (samples, voxels, candidates) = pred.dim();
    if targets.dim() != (samples, voxels) {
        return Err(FwrfError::shape(
            "validation targets",
            &[samples, voxels],
            targets.shape(),
        ));
    }
    let err = pred - &targets.insert_axis(Axis(2));
    Ok(Zip::from(err.lanes(Axis(0))).map_collect(|e| e.fold(0.0, |acc, &d| acc + d * d)))
}
