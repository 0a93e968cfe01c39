// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::PathBuf;
use thiserror::Error;

/// Errors emitted by the receptive-field search and fitting routines.
///
/// Everything except [`FwrfError::Shape`] and the persistence variants
/// ([`FwrfError::Io`], [`FwrfError::Json`], [`FwrfError::Bincode`]) is a
/// configuration error: it is raised by precondition
/// checks before any batched work starts.
#[derive(Debug, Error)]
pub enum FwrfError {
    #[error("candidate batch size {batch} must divide the candidate count {candidates}")]
    CandidateBatchMismatch { batch: usize, candidates: usize },
    #[error("sample count mismatch: features carry {features} samples, targets carry {targets}")]
    SampleCountMismatch { features: usize, targets: usize },
    #[error("feature map {index} is not square ({height}x{width})")]
    NonSquareFeatureMap {
        index: usize,
        height: usize,
        width: usize,
    },
    #[error("{axis} batch size must be greater than zero")]
    ZeroBatchSize { axis: &'static str },
    #[error("validation size {validation} must lie in 1..{samples} (exclusive)")]
    InvalidValidationSplit { validation: usize, samples: usize },
    #[error("{label}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        label: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("learning rate must be positive and finite, got {rate}")]
    NonPositiveLearningRate { rate: f32 },
    #[error("{label} must be finite and non-negative, got {value}")]
    InvalidScalar { label: &'static str, value: f32 },
    #[error("candidate grid is empty")]
    EmptyGrid,
    #[error("candidate index {index} out of range for {candidates} candidates")]
    CandidateOutOfRange { index: usize, candidates: usize },
    #[error("grid describes {grid} units but {requested} models were supplied")]
    UnitCountMismatch { grid: usize, requested: usize },
    #[error("no feature maps were supplied")]
    NoFeatureMaps,
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialise: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode binary snapshot: {0}")]
    Bincode(#[from] bincode::Error),
}

impl FwrfError {
    /// Returns `true` for the precondition failures that abort a call before work begins.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            FwrfError::Shape(_) | FwrfError::Io { .. } | FwrfError::Json(_) | FwrfError::Bincode(_)
        )
    }

    pub(crate) fn shape(label: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        FwrfError::ShapeMismatch {
            label,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type FwrfResult<T> = Result<T, FwrfError>;
