// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Runtime configuration for precompute, optimisation and evaluation passes.
//!
//! Configurations are plain serde structs. They can be loaded from JSON and then
//! patched from `FWRF_*` environment variables:
//!
//! | variable                | field                          |
//! |-------------------------|--------------------------------|
//! | `FWRF_FIELD_OF_VIEW`    | `field_of_view`                |
//! | `FWRF_LEARNING_RATE`    | `training.learning_rate`       |
//! | `FWRF_EPOCHS`           | `training.epochs`              |
//! | `FWRF_VALIDATION_SIZE`  | `training.validation_size`     |
//! | `FWRF_SEED`             | `seed`                         |

use crate::error::{FwrfError, FwrfResult};
use crate::summarize::Nonlinearity;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

/// Batch sizes used while precomputing RF-weighted feature summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecomputeBatches {
    pub samples: usize,
    pub candidates: usize,
    /// Unit batch, only used for per-unit grids.
    pub units: usize,
}

impl Default for PrecomputeBatches {
    fn default() -> Self {
        Self {
            samples: 256,
            candidates: 1,
            units: 1,
        }
    }
}

/// Batch sizes used by the fitting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeBatches {
    pub samples: usize,
    pub voxels: usize,
    pub candidates: usize,
}

impl Default for OptimizeBatches {
    fn default() -> Self {
        Self {
            samples: 256,
            voxels: 64,
            candidates: 1,
        }
    }
}

/// Batch sizes used when predicting from fitted models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluateBatches {
    pub samples: usize,
    pub voxels: usize,
}

impl Default for EvaluateBatches {
    fn default() -> Self {
        Self {
            samples: 256,
            voxels: 64,
        }
    }
}

/// Hyper-parameters of the candidate fitting loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOptions {
    /// Number of trailing samples held out for validation.
    pub validation_size: usize,
    pub learning_rate: f32,
    /// Weight of the squared-L2 penalty on the encoding weights.
    pub l2: f32,
    /// Momentum of the update rule; zero is plain gradient descent.
    pub momentum: f32,
    pub epochs: usize,
    /// Keep the full `(epochs, voxels, candidates)` validation loss history.
    pub record_validation_scores: bool,
    /// Allocate and report, but skip the numeric work.
    pub dry_run: bool,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            validation_size: 100,
            learning_rate: 1e-4,
            l2: 0.0,
            momentum: 0.0,
            epochs: 1,
            record_validation_scores: true,
            dry_run: false,
        }
    }
}

impl TrainingOptions {
    pub fn validate(&self) -> FwrfResult<()> {
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(FwrfError::NonPositiveLearningRate {
                rate: self.learning_rate,
            });
        }
        if !(self.l2 >= 0.0) || !self.l2.is_finite() {
            return Err(FwrfError::InvalidScalar {
                label: "l2",
                value: self.l2,
            });
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(FwrfError::InvalidScalar {
                label: "momentum",
                value: self.momentum,
            });
        }
        if self.epochs == 0 {
            return Err(FwrfError::InvalidScalar {
                label: "epochs",
                value: 0.0,
            });
        }
        Ok(())
    }

    /// Checks the validation split against the number of available samples.
    pub fn check_split(&self, samples: usize) -> FwrfResult<()> {
        if self.validation_size == 0 || self.validation_size >= samples {
            return Err(FwrfError::InvalidValidationSplit {
                validation: self.validation_size,
                samples,
            });
        }
        Ok(())
    }
}

/// Post-processing applied to precomputed RF-weighted features.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationOptions {
    pub nonlinearity: Nonlinearity,
    pub zscore: bool,
    /// Samples used to estimate the z-score statistics; all samples when unset.
    pub training_size: Option<usize>,
    /// Added to the standard deviation before dividing.
    pub epsilon: f32,
}

impl Default for NormalizationOptions {
    fn default() -> Self {
        Self {
            nonlinearity: Nonlinearity::Identity,
            zscore: false,
            training_size: None,
            epsilon: 1.0,
        }
    }
}

/// Full configuration of a fitting session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FwrfConfig {
    pub precompute: PrecomputeBatches,
    pub optimize: OptimizeBatches,
    pub evaluate: EvaluateBatches,
    /// Width of visual space covered by every feature map, in degrees.
    pub field_of_view: f32,
    pub training: TrainingOptions,
    pub normalization: NormalizationOptions,
    pub seed: Option<u64>,
}

impl Default for FwrfConfig {
    fn default() -> Self {
        Self {
            precompute: PrecomputeBatches::default(),
            optimize: OptimizeBatches::default(),
            evaluate: EvaluateBatches::default(),
            field_of_view: 20.0,
            training: TrainingOptions::default(),
            normalization: NormalizationOptions::default(),
            seed: None,
        }
    }
}

impl FwrfConfig {
    pub fn from_json_str(raw: &str) -> FwrfResult<Self> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> FwrfResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| FwrfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Applies the `FWRF_*` overrides present in the process environment.
    pub fn with_env_overrides(self) -> FwrfResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`. Unparsable values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> FwrfResult<Self> {
        if let Some(fov) = parse_var(&lookup, "FWRF_FIELD_OF_VIEW") {
            self.field_of_view = fov;
        }
        if let Some(rate) = parse_var(&lookup, "FWRF_LEARNING_RATE") {
            self.training.learning_rate = rate;
        }
        if let Some(epochs) = parse_var(&lookup, "FWRF_EPOCHS") {
            self.training.epochs = epochs;
        }
        if let Some(size) = parse_var(&lookup, "FWRF_VALIDATION_SIZE") {
            self.training.validation_size = size;
        }
        if let Some(seed) = parse_var(&lookup, "FWRF_SEED") {
            self.seed = Some(seed);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> FwrfResult<()> {
        let sizes = [
            ("precompute sample", self.precompute.samples),
            ("precompute candidate", self.precompute.candidates),
            ("precompute unit", self.precompute.units),
            ("optimisation sample", self.optimize.samples),
            ("optimisation voxel", self.optimize.voxels),
            ("optimisation candidate", self.optimize.candidates),
            ("evaluation sample", self.evaluate.samples),
            ("evaluation voxel", self.evaluate.voxels),
        ];
        for (axis, size) in sizes {
            if size == 0 {
                return Err(FwrfError::ZeroBatchSize { axis });
            }
        }
        if !(self.field_of_view > 0.0) || !self.field_of_view.is_finite() {
            return Err(FwrfError::InvalidScalar {
                label: "field_of_view",
                value: self.field_of_view,
            });
        }
        if !(self.normalization.epsilon >= 0.0) {
            return Err(FwrfError::InvalidScalar {
                label: "epsilon",
                value: self.normalization.epsilon,
            });
        }
        self.training.validate()
    }

    /// RNG for the component `label`, honouring the configured seed.
    pub fn rng(&self, label: &str) -> StdRng {
        rng_from_optional(self.seed, label)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse::<T>().ok())
}

fn seed_for(base: u64, label: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    base.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

/// RNG derived from `FWRF_SEED` and `label`, or from entropy when unset.
pub fn rng_from_label(label: &str) -> StdRng {
    match std::env::var("FWRF_SEED")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
    {
        Some(base) => StdRng::seed_from_u64(seed_for(base, label)),
        None => StdRng::from_entropy(),
    }
}

/// RNG seeded from an explicit seed when provided.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => rng_from_label(label),
    }
}
