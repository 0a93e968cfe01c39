// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parameter update rules for batched voxel units.

use crate::error::{FwrfError, FwrfResult};
use ndarray::{Array2, Array3, Zip};

/// Applies one optimisation step to a unit's weights and bias.
///
/// Implementations may keep state between steps (velocities, step counters).
/// The fitting engine asks its [`crate::unit::UnitFactory`] for a fresh unit per
/// candidate batch, so state never leaks from one batch into the next unless a
/// factory deliberately shares it.
pub trait UpdateRule {
    fn apply(
        &mut self,
        weight: &mut Array3<f32>,
        bias: &mut Array2<f32>,
        grad_weight: &Array3<f32>,
        grad_bias: &Array2<f32>,
    ) -> FwrfResult<()>;
}

impl<R: UpdateRule + ?Sized> UpdateRule for Box<R> {
    fn apply(
        &mut self,
        weight: &mut Array3<f32>,
        bias: &mut Array2<f32>,
        grad_weight: &Array3<f32>,
        grad_bias: &Array2<f32>,
    ) -> FwrfResult<()> {
        (**self).apply(weight, bias, grad_weight, grad_bias)
    }
}

/// Stochastic gradient descent with optional heavy-ball momentum.
///
/// `v <- momentum * v - lr * g; p <- p + v`. With zero momentum this is plain
/// `p <- p - lr * g`.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocity_weight: Option<Array3<f32>>,
    velocity_bias: Option<Array2<f32>>,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32) -> FwrfResult<Self> {
        if !(learning_rate > 0.0) || !learning_rate.is_finite() {
            return Err(FwrfError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(FwrfError::InvalidScalar {
                label: "momentum",
                value: momentum,
            });
        }
        Ok(Self {
            learning_rate,
            momentum,
            velocity_weight: None,
            velocity_bias: None,
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Clears accumulated velocities.
    pub fn reset(&mut self) {
        self.velocity_weight = None;
        self.velocity_bias = None;
    }

    fn step_weight(&mut self, weight: &mut Array3<f32>, grad: &Array3<f32>) {
        let lr = self.learning_rate;
        if self.momentum == 0.0 {
            Zip::from(weight).and(grad).for_each(|p, &g| *p -= lr * g);
            return;
        }
        let momentum = self.momentum;
        if self.velocity_weight.as_ref().map(|v| v.dim()) != Some(grad.dim()) {
            self.velocity_weight = None;
        }
        let velocity = self
            .velocity_weight
            .get_or_insert_with(|| Array3::zeros(grad.dim()));
        Zip::from(weight)
            .and(velocity)
            .and(grad)
            .for_each(|p, v, &g| {
                *v = momentum * *v - lr * g;
                *p += *v;
            });
    }

    fn step_bias(&mut self, bias: &mut Array2<f32>, grad: &Array2<f32>) {
        let lr = self.learning_rate;
        if self.momentum == 0.0 {
            Zip::from(bias).and(grad).for_each(|p, &g| *p -= lr * g);
            return;
        }
        let momentum = self.momentum;
        if self.velocity_bias.as_ref().map(|v| v.dim()) != Some(grad.dim()) {
            self.velocity_bias = None;
        }
        let velocity = self
            .velocity_bias
            .get_or_insert_with(|| Array2::zeros(grad.dim()));
        Zip::from(bias).and(velocity).and(grad).for_each(|p, v, &g| {
            *v = momentum * *v - lr * g;
            *p += *v;
        });
    }
}

impl UpdateRule for Sgd {
    fn apply(
        &mut self,
        weight: &mut Array3<f32>,
        bias: &mut Array2<f32>,
        grad_weight: &Array3<f32>,
        grad_bias: &Array2<f32>,
    ) -> FwrfResult<()> {
        if weight.dim() != grad_weight.dim() {
            let (a, b, c) = weight.dim();
            let (x, y, z) = grad_weight.dim();
            return Err(FwrfError::shape("weight gradient", &[a, b, c], &[x, y, z]));
        }
        if bias.dim() != grad_bias.dim() {
            return Err(FwrfError::shape("bias gradient", bias.shape(), grad_bias.shape()));
        }
        self.step_weight(weight, grad_weight);
        self.step_bias(bias, grad_bias);
        Ok(())
    }
}
