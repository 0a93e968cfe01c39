// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Feature-weighted receptive field (FWRF) search for voxel encoding models.
//!
//! A voxel's response is modelled as a linear read-out of convolutional
//! feature maps pooled through a Gaussian receptive field. The RF position and
//! size are found by exhaustive search over a candidate grid: the feature maps
//! are summarised once per candidate ([`summarize`]), then every
//! (voxel batch, candidate batch) cell trains a linear unit and keeps the
//! candidate with the lowest validation loss per voxel ([`engine`]).
//!
//! ```text
//! feature maps ──► RF weights ──► RFW data ──► batched search ──► best models
//!                  (grid, rf)     (summarize)   (engine, unit)     (mapper, eval)
//! ```

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod grid;
pub mod io;
pub mod mapper;
pub mod model;
pub mod noise;
pub mod optim;
pub mod rf;
pub mod summarize;
pub mod telemetry;
pub mod unit;

pub use config::{
    EvaluateBatches, FwrfConfig, NormalizationOptions, OptimizeBatches, PrecomputeBatches,
    TrainingOptions,
};
pub use engine::{BatchedFitter, CellReport, FitState, ProgressSink, TracingProgress};
pub use error::{FwrfError, FwrfResult};
pub use eval::VoxelParams;
pub use grid::{CandidateGrid, GridShape, ModelSpec, Subdivision};
pub use model::{EvalInput, FitInput, FitOutcome, FwrfModel};
pub use noise::NoiseModel;
pub use optim::{Sgd, UpdateRule};
pub use rf::{FeatureMapSpec, RfWeightBuffer};
pub use summarize::Nonlinearity;
pub use unit::{LinearVoxelUnit, SgdUnitFactory, TrainableUnit, UnitFactory, UnitShape};
