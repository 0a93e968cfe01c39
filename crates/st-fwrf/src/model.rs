// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! High level entry points tying precompute, search, mapping and evaluation
//! together for one set of feature-map resolutions.

use crate::config::FwrfConfig;
use crate::engine::{BatchedFitter, FitState, ProgressSink, TracingProgress};
use crate::error::{FwrfError, FwrfResult};
use crate::eval::{self, VoxelParams};
use crate::grid::{CandidateGrid, GridShape};
use crate::mapper;
use crate::noise::NoiseModel;
use crate::rf::{self, FeatureMapSpec};
use crate::summarize;
use crate::unit::{SgdUnitFactory, UnitFactory};
use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView2, ArrayView4, CowArray, Ix4};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

/// Data fed to a training session.
#[derive(Debug, Clone, Copy)]
pub enum FitInput<'a> {
    /// Raw feature maps, one `(samples, channels, pixels, pixels)` array per resolution.
    FeatureMaps(&'a [ArrayView4<'a, f32>]),
    /// RFW data already produced by [`FwrfModel::precompute_rfw_data`].
    Precomputed(ArrayView4<'a, f32>),
}

/// Data and models fed to validation.
#[derive(Debug, Clone, Copy)]
pub enum EvalInput<'a> {
    /// Raw feature maps and absolute `(voxels, 3)` models.
    FeatureMaps {
        maps: &'a [ArrayView4<'a, f32>],
        models: ArrayView2<'a, f32>,
    },
    /// RFW data and the flat candidate index of every voxel.
    Precomputed {
        rfw: ArrayView4<'a, f32>,
        best_models: ArrayView1<'a, usize>,
    },
}

/// Result of a training session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOutcome {
    pub grid: GridShape,
    pub state: FitState,
    /// Absolute `(x, y, size)` of every voxel's winning candidate.
    pub abs_models: Array2<f32>,
}

impl FitOutcome {
    pub fn params(&self) -> VoxelParams<'_> {
        VoxelParams::new(self.state.best_weights.view(), self.state.best_bias.view())
    }
}

/// Feature-weighted receptive field model over a fixed set of feature maps.
#[derive(Debug)]
pub struct FwrfModel {
    config: FwrfConfig,
    specs: Vec<FeatureMapSpec>,
    features: usize,
    fitter: BatchedFitter,
}

impl FwrfModel {
    pub fn new(config: FwrfConfig, specs: Vec<FeatureMapSpec>) -> FwrfResult<Self> {
        config.validate()?;
        let features = rf::total_features(&specs)?;
        let fitter = BatchedFitter::new(config.optimize, config.training)?;
        info!(
            target: "st_fwrf::model",
            features,
            resolutions = specs.len(),
            field_of_view = config.field_of_view,
            "fwrf model created"
        );
        Ok(Self {
            config,
            specs,
            features,
            fitter,
        })
    }

    /// Builds a model whose specs are read from sample feature maps.
    pub fn for_feature_maps(config: FwrfConfig, maps: &[ArrayView4<'_, f32>]) -> FwrfResult<Self> {
        let specs = maps
            .iter()
            .enumerate()
            .map(|(layer, m)| FeatureMapSpec::of(layer, m))
            .collect();
        Self::new(config, specs)
    }

    pub fn config(&self) -> &FwrfConfig {
        &self.config
    }

    pub fn specs(&self) -> &[FeatureMapSpec] {
        &self.specs
    }

    pub fn feature_count(&self) -> usize {
        self.features
    }

    fn check_maps(&self, maps: &[ArrayView4<'_, f32>]) -> FwrfResult<usize> {
        if maps.len() != self.specs.len() {
            return Err(FwrfError::shape(
                "feature map resolutions",
                &[self.specs.len()],
                &[maps.len()],
            ));
        }
        for (spec, m) in self.specs.iter().zip(maps) {
            let (_, channels, height, width) = m.dim();
            if (channels, height, width) != (spec.channels, spec.height, spec.width) {
                return Err(FwrfError::shape(
                    "feature maps",
                    &[spec.channels, spec.height, spec.width],
                    &[channels, height, width],
                ));
            }
        }
        summarize::sample_count(maps)
    }

    /// Precomputes `(samples, features, units, candidates)` RFW data for `grid`,
    /// applying the configured normalization.
    pub fn precompute_rfw_data(&self, maps: &[ArrayView4<'_, f32>], grid: &CandidateGrid) -> FwrfResult<Array4<f32>> {
        self.check_maps(maps)?;
        summarize::precompute(
            maps,
            grid,
            &self.config.precompute,
            self.config.field_of_view,
            &self.config.normalization,
            self.config.training.dry_run,
        )
    }

    /// Searches `grid` for every voxel and returns the winners.
    ///
    /// Feature maps are summarised first (without normalization); precomputed
    /// data is used as is. `init` is where each voxel's first candidate batch
    /// starts, zeros when absent; later batches continue from the running best.
    pub fn shared_model_training<F: UnitFactory>(
        &mut self,
        input: FitInput<'_>,
        voxels: ArrayView2<'_, f32>,
        grid: &CandidateGrid,
        init: Option<VoxelParams<'_>>,
        factory: &mut F,
        progress: &mut dyn ProgressSink,
    ) -> FwrfResult<FitOutcome> {
        let rfw: CowArray<'_, f32, Ix4> = match input {
            FitInput::FeatureMaps(maps) => {
                let samples = self.check_maps(maps)?;
                if samples != voxels.nrows() {
                    return Err(FwrfError::SampleCountMismatch {
                        features: samples,
                        targets: voxels.nrows(),
                    });
                }
                summarize::precompute(
                    maps,
                    grid,
                    &self.config.precompute,
                    self.config.field_of_view,
                    &Default::default(),
                    self.config.training.dry_run,
                )?
                .into()
            }
            FitInput::Precomputed(view) => view.into(),
        };
        let (_, nf, nu, nt) = rfw.dim();
        let expected_units = grid.units();
        if nf != self.features || nt != grid.len() || (nu != expected_units && nu != 1) {
            return Err(FwrfError::shape(
                "rfw data",
                &[self.features, expected_units, grid.len()],
                &[nf, nu, nt],
            ));
        }
        if !grid.is_shared() && grid.units() != voxels.ncols() {
            return Err(FwrfError::UnitCountMismatch {
                grid: grid.units(),
                requested: voxels.ncols(),
            });
        }

        let nv = voxels.ncols();
        let zeros_w;
        let zeros_b;
        // reborrow so the caller's views and the local zeros share one lifetime
        let (init_weights, init_bias) = match &init {
            Some(params) => (params.weights.reborrow(), params.bias.reborrow()),
            None => {
                zeros_w = Array2::<f32>::zeros((nv, nf));
                zeros_b = Array1::<f32>::zeros(nv);
                (zeros_w.view(), zeros_b.view())
            }
        };

        info!(target: "st_fwrf::model", voxel_models = nv * nt, "voxel-candidate model optimisation");
        let started = Instant::now();
        let state = self
            .fitter
            .fit(rfw.view(), voxels, init_weights, init_bias, factory, progress)?;
        let abs_models = mapper::absolute_models(state.best_models.view(), grid)?;
        let seconds = started.elapsed().as_secs_f64();
        info!(
            target: "st_fwrf::model",
            epochs = self.config.training.epochs,
            voxel_models = nv * nt,
            seconds,
            voxel_models_per_second = (nv * nt) as f64 / seconds.max(f64::EPSILON),
            "optimisation finished"
        );
        Ok(FitOutcome {
            grid: grid.shape(),
            state,
            abs_models,
        })
    }

    /// [`Self::shared_model_training`] with the configured SGD options and
    /// tracing progress.
    pub fn train(
        &mut self,
        input: FitInput<'_>,
        voxels: ArrayView2<'_, f32>,
        grid: &CandidateGrid,
        init: Option<VoxelParams<'_>>,
    ) -> FwrfResult<FitOutcome> {
        let mut factory = SgdUnitFactory::from_options(&self.config.training);
        self.shared_model_training(input, voxels, grid, init, &mut factory, &mut TracingProgress)
    }

    /// Predicts and correlates against `voxels`. Returns `(predictions, scores)`.
    pub fn validate_models(
        &self,
        input: EvalInput<'_>,
        voxels: ArrayView2<'_, f32>,
        params: VoxelParams<'_>,
    ) -> FwrfResult<(Array2<f32>, Array1<f32>)> {
        match input {
            EvalInput::FeatureMaps { maps, models } => {
                self.check_maps(maps)?;
                eval::validate(
                    maps,
                    voxels,
                    models,
                    params,
                    &self.config.evaluate,
                    self.config.field_of_view,
                )
            }
            EvalInput::Precomputed { rfw, best_models } => {
                eval::validate_precomputed(rfw, voxels, best_models, params, &self.config.evaluate)
            }
        }
    }

    /// Adds `noise` to `responses` with the RNG stream labelled `"noise"`, seeded
    /// from the configured seed when one is set.
    pub fn add_noise(&self, responses: ArrayView2<'_, f32>, noise: &NoiseModel) -> FwrfResult<Array2<f32>> {
        let mut rng = self.config.rng("noise");
        noise.apply(responses, &mut rng)
    }

    /// Predicts `(samples, voxels)` responses for new feature maps.
    pub fn prediction(
        &self,
        maps: &[ArrayView4<'_, f32>],
        models: ArrayView2<'_, f32>,
        params: VoxelParams<'_>,
    ) -> FwrfResult<Array2<f32>> {
        self.check_maps(maps)?;
        eval::predict(maps, models, params, &self.config.evaluate, self.config.field_of_view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{ModelSpec, Subdivision};

    fn config() -> FwrfConfig {
        let mut cfg = FwrfConfig::default();
        cfg.optimize.candidates = 2;
        cfg.optimize.voxels = 2;
        cfg.optimize.samples = 4;
        cfg.training.validation_size = 4;
        cfg.training.learning_rate = 0.05;
        cfg.training.epochs = 2;
        cfg.field_of_view = 8.0;
        cfg
    }

    #[test]
    fn rejects_mismatched_maps() {
        let maps = Array4::<f32>::zeros((12, 2, 4, 4));
        let model = FwrfModel::new(config(), vec![FeatureMapSpec::new(0, 3, 4, 4)]).unwrap();
        let grid = CandidateGrid::shared(
            &ModelSpec::new([0.0, 0.0, 1.0], [2.0, 2.0, 0.0]),
            [Subdivision::linear(2), Subdivision::linear(1), Subdivision::constant(1)],
        )
        .unwrap();
        assert!(model.precompute_rfw_data(&[maps.view()], &grid).is_err());
    }

    #[test]
    fn training_maps_winners_to_visual_space() {
        let maps = Array4::from_shape_fn((12, 1, 4, 4), |(n, _, i, j)| {
            // one bright quadrant per sample parity
            if (i < 2) == (n % 2 == 0) && j < 2 {
                (n % 5) as f32 + 1.0
            } else {
                0.0
            }
        });
        let grid = CandidateGrid::shared(
            &ModelSpec::new([0.0, 0.0, 0.5], [4.0, 4.0, 0.0]),
            [Subdivision::linear(2), Subdivision::linear(2), Subdivision::constant(1)],
        )
        .unwrap();
        let views = [maps.view()];
        let mut model = FwrfModel::for_feature_maps(config(), &views).unwrap();
        let rfw = model.precompute_rfw_data(&views, &grid).unwrap();
        let voxels = Array2::from_shape_fn((12, 3), |(n, v)| rfw[[n, 0, 0, v]]);
        let outcome = model
            .train(FitInput::Precomputed(rfw.view()), voxels.view(), &grid, None)
            .unwrap();
        assert_eq!(outcome.abs_models.dim(), (3, 3));
        for v in 0..3 {
            let [x, y, s] = grid.candidate(0, outcome.state.best_models[v]).unwrap();
            assert_eq!(outcome.abs_models.row(v).to_vec(), vec![x, y, s]);
        }

        let (pred, scores) = model
            .validate_models(
                EvalInput::Precomputed {
                    rfw: rfw.view(),
                    best_models: outcome.state.best_models.view(),
                },
                voxels.view(),
                outcome.params(),
            )
            .unwrap();
        assert_eq!(pred.dim(), (12, 3));
        assert_eq!(scores.len(), 3);
    }

    #[test]
    fn explicit_initial_parameters_are_used() {
        let rfw = Array4::from_shape_fn((12, 2, 1, 4), |(n, f, _, t)| ((n * 3 + f * 5 + t) % 7) as f32 / 7.0 - 0.5);
        let voxels = Array2::from_shape_fn((12, 2), |(n, v)| rfw[[n, v, 0, v]]);
        let grid = CandidateGrid::shared(
            &ModelSpec::new([0.0, 0.0, 0.5], [4.0, 4.0, 0.0]),
            [Subdivision::linear(2), Subdivision::linear(2), Subdivision::constant(1)],
        )
        .unwrap();
        let mut model = FwrfModel::new(config(), vec![FeatureMapSpec::new(0, 2, 4, 4)]).unwrap();

        let default = model
            .train(FitInput::Precomputed(rfw.view()), voxels.view(), &grid, None)
            .unwrap();
        let zeros_w = Array2::<f32>::zeros((2, 2));
        let zeros_b = Array1::<f32>::zeros(2);
        let zeros = model
            .train(
                FitInput::Precomputed(rfw.view()),
                voxels.view(),
                &grid,
                Some(VoxelParams::new(zeros_w.view(), zeros_b.view())),
            )
            .unwrap();
        assert_eq!(default, zeros);

        let start_w = Array2::from_elem((2, 2), 0.25f32);
        let start_b = Array1::from_elem(2, -0.5f32);
        let shifted = model
            .train(
                FitInput::Precomputed(rfw.view()),
                voxels.view(),
                &grid,
                Some(VoxelParams::new(start_w.view(), start_b.view())),
            )
            .unwrap();
        assert_ne!(default.state.val_scores, shifted.state.val_scores);

        let wrong_w = Array2::<f32>::zeros((3, 2));
        let err = model
            .train(
                FitInput::Precomputed(rfw.view()),
                voxels.view(),
                &grid,
                Some(VoxelParams::new(wrong_w.view(), zeros_b.view())),
            )
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn noise_follows_configured_seed() {
        let mut cfg = config();
        cfg.seed = Some(7);
        let model = FwrfModel::new(cfg.clone(), vec![FeatureMapSpec::new(0, 1, 4, 4)]).unwrap();
        let twin = FwrfModel::new(cfg.clone(), vec![FeatureMapSpec::new(0, 1, 4, 4)]).unwrap();
        cfg.seed = Some(8);
        let other = FwrfModel::new(cfg, vec![FeatureMapSpec::new(0, 1, 4, 4)]).unwrap();

        let responses = Array2::<f32>::zeros((32, 2));
        let noise = NoiseModel {
            mean: Array1::from_elem(2, 0.0),
            std: Array1::from_elem(2, 1.0),
        };
        let a = model.add_noise(responses.view(), &noise).unwrap();
        let b = twin.add_noise(responses.view(), &noise).unwrap();
        let c = other.add_noise(responses.view(), &noise).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
