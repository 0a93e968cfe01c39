// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Batched candidate search.
//!
//! The engine walks a grid of (voxel batch, candidate batch) cells. In each
//! cell it creates a fresh unit through the caller's [`UnitFactory`], warm
//! started from every voxel's running-best weights (the supplied initial
//! parameters until a first score exists). It trains the unit on the training
//! prefix, scores it on the validation suffix and keeps, per voxel, the
//! candidate with the lowest validation loss seen so far.
//!
//! Units are never reused across candidate batches. An update rule with
//! internal state (momentum) would otherwise carry velocities fitted for one
//! set of candidates into an unrelated set.

use crate::batch::{self, BatchRange};
use crate::config::{OptimizeBatches, TrainingOptions};
use crate::error::{FwrfError, FwrfResult};
use crate::unit::{squared_error_sums, TrainableUnit, UnitFactory, UnitShape};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView4};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Per-voxel outcome of a search session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitState {
    /// Lowest validation loss per voxel, `+inf` until a candidate was scored.
    pub best_scores: Array1<f32>,
    /// Flat candidate index of the winner per voxel.
    pub best_models: Array1<usize>,
    /// Winning weights, `(voxels, features)`.
    pub best_weights: Array2<f32>,
    pub best_bias: Array1<f32>,
    /// Validation losses `(epochs, voxels, candidates)` when recorded.
    pub val_scores: Option<Array3<f32>>,
}

impl FitState {
    pub fn new(voxels: usize, features: usize, history: Option<(usize, usize)>) -> Self {
        Self {
            best_scores: Array1::from_elem(voxels, f32::INFINITY),
            best_models: Array1::zeros(voxels),
            best_weights: Array2::zeros((voxels, features)),
            best_bias: Array1::zeros(voxels),
            val_scores: history.map(|(epochs, candidates)| Array3::zeros((epochs, voxels, candidates))),
        }
    }

    pub fn voxels(&self) -> usize {
        self.best_scores.len()
    }
}

/// Progress of one completed cell.
#[derive(Debug, Clone)]
pub struct CellReport<'a> {
    pub voxels: Range<usize>,
    pub candidates: Range<usize>,
    pub total_voxels: usize,
    pub total_candidates: usize,
    pub epochs: usize,
    pub elapsed: Duration,
    pub models_per_second: f64,
    /// Mean validation loss of the last epoch over the real (unpadded) voxels.
    pub mean_validation_loss: f32,
    /// Best scores of the cell's voxels after selection.
    pub best_scores: ArrayView1<'a, f32>,
}

/// Receives cell reports. Advisory only; the engine never reads anything back.
pub trait ProgressSink {
    fn on_cell(&mut self, report: &CellReport<'_>);
}

impl<F> ProgressSink for F
where
    F: FnMut(&CellReport<'_>),
{
    fn on_cell(&mut self, report: &CellReport<'_>) {
        self(report)
    }
}

/// Logs every cell through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_cell(&mut self, report: &CellReport<'_>) {
        info!(
            target: "st_fwrf::engine",
            voxels = ?report.voxels,
            of_voxels = report.total_voxels,
            candidates = ?report.candidates,
            of_candidates = report.total_candidates,
            epochs = report.epochs,
            seconds = report.elapsed.as_secs_f64(),
            voxel_models_per_second = report.models_per_second,
            validation_loss = report.mean_validation_loss,
            "cell complete"
        );
    }
}

/// Runs search sessions with fixed batch sizes and training options.
///
/// The engine owns the cell's data and target buffers for the duration of a
/// session and releases them when it returns.
#[derive(Debug)]
pub struct BatchedFitter {
    batches: OptimizeBatches,
    training: TrainingOptions,
    data_buffer: Array4<f32>,
    voxel_buffer: Array2<f32>,
}

impl BatchedFitter {
    pub fn new(batches: OptimizeBatches, training: TrainingOptions) -> FwrfResult<Self> {
        for (axis, size) in [
            ("optimisation sample", batches.samples),
            ("optimisation voxel", batches.voxels),
            ("optimisation candidate", batches.candidates),
        ] {
            if size == 0 {
                return Err(FwrfError::ZeroBatchSize { axis });
            }
        }
        training.validate()?;
        Ok(Self {
            batches,
            training,
            data_buffer: Array4::zeros((0, 0, 0, 0)),
            voxel_buffer: Array2::zeros((0, 0)),
        })
    }

    pub fn batches(&self) -> &OptimizeBatches {
        &self.batches
    }

    pub fn training(&self) -> &TrainingOptions {
        &self.training
    }

    /// Bytes currently held by the session buffers.
    pub fn buffer_bytes(&self) -> usize {
        (self.data_buffer.len() + self.voxel_buffer.len()) * std::mem::size_of::<f32>()
    }

    fn release(&mut self) {
        self.data_buffer = Array4::zeros((0, 0, 0, 0));
        self.voxel_buffer = Array2::zeros((0, 0));
    }

    /// Searches every candidate of `rfw` for every voxel.
    ///
    /// * `rfw` is `(samples, features, 1 | voxels, candidates)`;
    /// * `voxels` is `(samples, voxels)`;
    /// * `init_weights` is `(voxels, features)` and `init_bias` is `(voxels,)`,
    ///   the starting point of a voxel's first candidate batch. Later batches
    ///   continue from the voxel's best weights so far.
    pub fn fit<F: UnitFactory>(
        &mut self,
        rfw: ArrayView4<'_, f32>,
        voxels: ArrayView2<'_, f32>,
        init_weights: ArrayView2<'_, f32>,
        init_bias: ArrayView1<'_, f32>,
        factory: &mut F,
        progress: &mut dyn ProgressSink,
    ) -> FwrfResult<FitState> {
        let (n, nf, nu, nt) = rfw.dim();
        let (targets_n, nv) = voxels.dim();
        if n != targets_n {
            return Err(FwrfError::SampleCountMismatch {
                features: n,
                targets: targets_n,
            });
        }
        if nu != 1 && nu != nv {
            return Err(FwrfError::UnitCountMismatch {
                grid: nu,
                requested: nv,
            });
        }
        if init_weights.dim() != (nv, nf) {
            return Err(FwrfError::shape("initial weights", &[nv, nf], init_weights.shape()));
        }
        if init_bias.len() != nv {
            return Err(FwrfError::shape("initial bias", &[nv], init_bias.shape()));
        }
        self.training.check_split(n)?;
        let OptimizeBatches {
            voxels: bv,
            candidates: bt,
            ..
        } = self.batches;
        let nbt = batch::exact_batch_count(nt, bt)?;
        let (nbv, rbv) = batch::layout(nv, bv);
        let epochs = self.training.epochs;
        let history = self.training.record_validation_scores.then_some((epochs, nt));
        let mut state = FitState::new(nv, nf, history);

        info!(
            target: "st_fwrf::engine",
            voxel_batches = nbv,
            voxel_batch = bv,
            voxel_residual = rbv,
            candidate_batches = nbt,
            candidate_batch = bt,
            voxel_models = nv * nt,
            shared = nu == 1,
            "search layout"
        );
        if self.training.dry_run {
            return Ok(state);
        }

        let data_voxels = if nu == 1 { 1 } else { bv };
        self.data_buffer = Array4::zeros((n, nf, data_voxels, bt));
        self.voxel_buffer = Array2::zeros((n, bv));
        debug!(
            target: "st_fwrf::engine",
            megabytes = self.buffer_bytes() as f64 / (1024.0 * 1024.0),
            "session buffers allocated"
        );

        let outcome = self.run(rfw, voxels, init_weights, init_bias, factory, progress, &mut state);
        self.release();
        outcome.map(|()| state)
    }

    #[allow(clippy::too_many_arguments)]
    fn run<F: UnitFactory>(
        &mut self,
        rfw: ArrayView4<'_, f32>,
        voxels: ArrayView2<'_, f32>,
        init_weights: ArrayView2<'_, f32>,
        init_bias: ArrayView1<'_, f32>,
        factory: &mut F,
        progress: &mut dyn ProgressSink,
        state: &mut FitState,
    ) -> FwrfResult<()> {
        let (n, nf, nu, nt) = rfw.dim();
        let nv = voxels.ncols();
        let OptimizeBatches {
            samples: bn,
            voxels: bv,
            candidates: bt,
        } = self.batches;
        let shared = nu == 1;
        let validation = self.training.validation_size;
        let training = n - validation;
        let epochs = self.training.epochs;
        let shape = UnitShape::new(nf, bv, bt);

        for rv in batch::batches(0, nv, bv, "voxel")? {
            let lv = rv.len;
            self.voxel_buffer.fill(0.0);
            self.voxel_buffer
                .slice_mut(s![.., ..lv])
                .assign(&voxels.slice(s![.., rv.range()]));

            for t in 0..nt / bt {
                let cands = BatchRange {
                    start: t * bt,
                    len: bt,
                };
                if shared {
                    self.data_buffer
                        .assign(&rfw.slice(s![.., .., .., cands.range()]));
                } else {
                    self.data_buffer.fill(0.0);
                    self.data_buffer
                        .slice_mut(s![.., .., ..lv, ..])
                        .assign(&rfw.slice(s![.., .., rv.range(), cands.range()]));
                }

                let (start_weight, start_bias) = warm_start(state, init_weights, init_bias, rv, shape);
                let mut unit = factory.create(shape, start_weight, start_bias)?;
                let started = Instant::now();
                let mut val_loss = Array2::<f32>::zeros(shape.bias_dim());
                for epoch in 0..epochs {
                    for sb in batch::batches(0, training, bn, "sample")? {
                        unit.apply_gradient_step(
                            self.data_buffer.slice(s![sb.range(), .., .., ..]),
                            self.voxel_buffer.slice(s![sb.range(), ..]),
                        )?;
                    }
                    val_loss.fill(0.0);
                    for sb in batch::batches(training, validation, bn, "sample")? {
                        let pred = unit.forward(self.data_buffer.slice(s![sb.range(), .., .., ..]))?;
                        val_loss += &squared_error_sums(&pred, self.voxel_buffer.slice(s![sb.range(), ..]))?;
                    }
                    val_loss /= validation as f32;

                    if let Some(history) = state.val_scores.as_mut() {
                        history
                            .slice_mut(s![epoch, rv.range(), cands.range()])
                            .assign(&val_loss.slice(s![..lv, ..]));
                    }
                    select(state, &unit, &val_loss, rv, cands);
                }

                let elapsed = started.elapsed();
                let real = val_loss.slice(s![..lv, ..]);
                let report = CellReport {
                    voxels: rv.range(),
                    candidates: cands.range(),
                    total_voxels: nv,
                    total_candidates: nt,
                    epochs,
                    elapsed,
                    models_per_second: (lv * bt) as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
                    mean_validation_loss: real.mean().unwrap_or(f32::NAN),
                    best_scores: state.best_scores.slice(s![rv.range()]),
                };
                progress.on_cell(&report);
            }
        }
        Ok(())
    }
}

/// Starting parameters of a cell, broadcast over its candidates.
///
/// A voxel that already has a finite best score continues from its running
/// best; otherwise it starts from the supplied initial parameters. Padding
/// voxels stay zero.
fn warm_start(
    state: &FitState,
    init_weights: ArrayView2<'_, f32>,
    init_bias: ArrayView1<'_, f32>,
    voxels: BatchRange,
    shape: UnitShape,
) -> (Array3<f32>, Array2<f32>) {
    let mut weight = Array3::<f32>::zeros(shape.weight_dim());
    let mut bias = Array2::<f32>::zeros(shape.bias_dim());
    for v in 0..voxels.len {
        let voxel = voxels.start + v;
        let (w, b) = if state.best_scores[voxel].is_finite() {
            (state.best_weights.row(voxel), state.best_bias[voxel])
        } else {
            (init_weights.row(voxel), init_bias[voxel])
        };
        for (f, &value) in w.iter().enumerate() {
            weight.slice_mut(s![f, v, ..]).fill(value);
        }
        bias.row_mut(v).fill(b);
    }
    (weight, bias)
}

/// Keeps, per real voxel of the cell, the candidate with the lowest loss when it
/// strictly improves on the voxel's best score.
fn select<U: TrainableUnit>(
    state: &mut FitState,
    unit: &U,
    val_loss: &Array2<f32>,
    voxels: BatchRange,
    candidates: BatchRange,
) {
    let weight = unit.weight();
    let bias = unit.bias();
    for v in 0..voxels.len {
        let row = val_loss.row(v);
        let mut winner: Option<(usize, f32)> = None;
        for (t, &loss) in row.iter().enumerate() {
            if winner.map_or(!loss.is_nan(), |(_, best)| loss < best) {
                winner = Some((t, loss));
            }
        }
        let Some((t, loss)) = winner else {
            continue;
        };
        let voxel = voxels.start + v;
        if loss < state.best_scores[voxel] {
            state.best_scores[voxel] = loss;
            state.best_models[voxel] = candidates.start + t;
            state
                .best_weights
                .row_mut(voxel)
                .assign(&weight.slice(s![.., v, t]));
            state.best_bias[voxel] = bias[[v, t]];
        }
    }
}
