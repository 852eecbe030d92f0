//! Landmark cascade training.
//!
//! 1. Average the ground-truth shapes in face-box space to get the mean.
//! 2. Measure how the rigidly-aligned mean deviates from ground truth, fold
//!    the bias into the mean and measure again.
//! 3. Initialise every image with the rigid placement plus bootstrap
//!    perturbations drawn from those statistics.
//! 4. For each cascade step, extract descriptors at the current landmarks,
//!    ridge-regress the remaining shape error onto them and apply the update.

use std::sync::Arc;

use image::GrayImage;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use thiserror::Error;

use crate::alignment::{align_rigid, calculate_mean, AlignmentError, MeanNormalization};
use crate::bootstrap::BootstrapSampler;
use crate::config::{ConfigError, TrainingConfig};
use crate::descriptor::{DescriptorError, DescriptorExtractor, DescriptorRegistry};
use crate::model::{cascade_features, check_landmark_id, ModelError, SdmLandmarkModel};
use crate::regressor::{normalised_residual, LinearRegressor, RegressionError, Regressor, SingularPolicy};
use crate::regulariser::Regulariser;
use crate::statistics::AlignmentStatistics;
use crate::types::{BoundingBox, Shape};

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("invalid training input: {0}")]
    InvalidInput(String),
    #[error("mean computation failed: {0}")]
    MeanComputation(#[source] AlignmentError),
    #[error("alignment statistics failed: {0}")]
    AlignmentStatistics(#[source] AlignmentError),
    #[error("cascade step {step}, sample {sample}: {source}")]
    Descriptor {
        step: usize,
        sample: usize,
        #[source]
        source: DescriptorError,
    },
    #[error("cascade step {step}: {source}")]
    Regression {
        step: usize,
        #[source]
        source: RegressionError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("assembling model: {0}")]
    Model(#[from] ModelError),
}

/// One annotated training image.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub image: GrayImage,
    pub face_box: BoundingBox,
    /// Ground truth `[x1..xN, y1..yN]` in image coordinates.
    pub landmarks: Shape,
}

/// Learns an [`SdmLandmarkModel`] from annotated images.
#[derive(Debug, Clone)]
pub struct CascadeTrainer {
    descriptors: Vec<Arc<dyn DescriptorExtractor>>,
    samples_per_image: usize,
    mean_normalization: MeanNormalization,
    regulariser: Regulariser,
    singular_policy: SingularPolicy,
    seed: u64,
}

impl CascadeTrainer {
    /// One cascade step per descriptor, in order.
    pub fn new(descriptors: Vec<Arc<dyn DescriptorExtractor>>) -> Self {
        let defaults = TrainingConfig::default();
        Self {
            descriptors,
            samples_per_image: defaults.samples_per_image,
            mean_normalization: defaults.mean_normalization,
            regulariser: defaults.regularisation.regulariser(),
            singular_policy: defaults.singular_policy,
            seed: defaults.seed,
        }
    }

    pub fn from_config(config: &TrainingConfig, registry: &DescriptorRegistry) -> Result<Self, TrainingError> {
        config.validate()?;
        Ok(Self {
            descriptors: config.build_descriptors(registry)?,
            samples_per_image: config.samples_per_image,
            mean_normalization: config.mean_normalization,
            regulariser: config.regularisation.regulariser(),
            singular_policy: config.singular_policy,
            seed: config.seed,
        })
    }

    pub fn with_samples_per_image(mut self, n: usize) -> Self {
        self.samples_per_image = n;
        self
    }

    pub fn with_regulariser(mut self, regulariser: Regulariser) -> Self {
        self.regulariser = regulariser;
        self
    }

    pub fn with_singular_policy(mut self, policy: SingularPolicy) -> Self {
        self.singular_policy = policy;
        self
    }

    pub fn with_mean_normalization(mut self, normalization: MeanNormalization) -> Self {
        self.mean_normalization = normalization;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn num_cascade_steps(&self) -> usize {
        self.descriptors.len()
    }

    pub fn train(
        &self,
        samples: &[TrainingSample],
        landmark_ids: Vec<String>,
    ) -> Result<SdmLandmarkModel, TrainingError> {
        let param_dim = validate_samples(samples, &landmark_ids)?;
        let truths: Vec<Shape> = samples.iter().map(|s| s.landmarks.clone()).collect();
        let boxes: Vec<BoundingBox> = samples.iter().map(|s| s.face_box).collect();

        let mean = calculate_mean(&truths, Some(&boxes), self.mean_normalization)
            .map_err(TrainingError::MeanComputation)?;
        let initial_stats =
            AlignmentStatistics::estimate(&mean, &truths, &boxes).map_err(TrainingError::AlignmentStatistics)?;
        let mean = initial_stats.rescale_mean(&mean);
        let stats =
            AlignmentStatistics::estimate(&mean, &truths, &boxes).map_err(TrainingError::AlignmentStatistics)?;

        // Row i of the training set belongs to image `owners[i]`.
        let sampler = BootstrapSampler::new(&mean, stats);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut owners = Vec::with_capacity(samples.len() * (self.samples_per_image + 1));
        let mut initial = Vec::with_capacity(owners.capacity());
        for (i, sample) in samples.iter().enumerate() {
            owners.push(i);
            initial.push(align_rigid(&mean, &sample.face_box));
            for shape in sampler.perturbed_shapes(&sample.face_box, self.samples_per_image, &mut rng) {
                owners.push(i);
                initial.push(shape);
            }
        }
        let rows = owners.len();
        let mut current = DMatrix::<f32>::from_fn(rows, param_dim, |r, c| initial[r][c]);
        let groundtruth = DMatrix::<f32>::from_fn(rows, param_dim, |r, c| truths[owners[r]][c]);

        tracing::info!(
            images = samples.len(),
            rows,
            landmarks = landmark_ids.len(),
            steps = self.num_cascade_steps(),
            initial_residual = normalised_residual(&current, &groundtruth),
            "starting cascade training"
        );

        let mut regressors = Vec::with_capacity(self.num_cascade_steps());
        for (step, extractor) in self.descriptors.iter().enumerate() {
            let features = self.feature_matrix(step, extractor.as_ref(), samples, &owners, &current)?;
            let delta = &groundtruth - &current;

            let mut regressor = LinearRegressor::new(self.regulariser).with_singular_policy(self.singular_policy);
            let well_posed = regressor
                .learn(&features, &delta)
                .map_err(|source| TrainingError::Regression { step, source })?;
            let update = regressor
                .predict(&features)
                .map_err(|source| TrainingError::Regression { step, source })?;
            current += update;

            tracing::info!(
                step,
                descriptor = extractor.descriptor_type(),
                feature_dim = features.ncols(),
                well_posed,
                residual = normalised_residual(&current, &groundtruth),
                "cascade step trained"
            );
            regressors.push(regressor.matrix().clone());
        }

        Ok(SdmLandmarkModel::new(
            mean,
            landmark_ids,
            regressors,
            self.descriptors.clone(),
        )?)
    }

    /// Descriptor rows for every training row, computed in parallel.
    fn feature_matrix(
        &self,
        step: usize,
        extractor: &dyn DescriptorExtractor,
        samples: &[TrainingSample],
        owners: &[usize],
        current: &DMatrix<f32>,
    ) -> Result<DMatrix<f32>, TrainingError> {
        let rows: Vec<_> = (0..owners.len())
            .into_par_iter()
            .map(|r| {
                let shape: Shape = current.row(r).into_owned();
                cascade_features(extractor, &samples[owners[r]].image, &shape)
                    .map_err(|source| TrainingError::Descriptor { step, sample: r, source })
            })
            .collect::<Result<_, _>>()?;

        let cols = rows.first().map_or(0, |r| r.len());
        Ok(DMatrix::from_fn(rows.len(), cols, |r, c| rows[r][c]))
    }
}

/// Checks the samples agree with each other and the identifiers; returns the
/// parameter dimension `2N`.
fn validate_samples(samples: &[TrainingSample], landmark_ids: &[String]) -> Result<usize, TrainingError> {
    let first = samples
        .first()
        .ok_or_else(|| TrainingError::InvalidInput("no training samples".into()))?;
    let param_dim = first.landmarks.len();
    if param_dim == 0 || param_dim % 2 != 0 {
        return Err(TrainingError::InvalidInput(format!(
            "landmark vector must have positive even length, got {param_dim}"
        )));
    }
    if landmark_ids.len() * 2 != param_dim {
        return Err(TrainingError::InvalidInput(format!(
            "{} landmark identifiers for {} landmarks",
            landmark_ids.len(),
            param_dim / 2
        )));
    }
    for id in landmark_ids {
        check_landmark_id(id).map_err(TrainingError::InvalidInput)?;
    }
    for (i, s) in samples.iter().enumerate() {
        if s.landmarks.len() != param_dim {
            return Err(TrainingError::InvalidInput(format!(
                "sample {i} has {} landmark values, expected {param_dim}",
                s.landmarks.len()
            )));
        }
        if !s.face_box.is_valid() {
            return Err(TrainingError::InvalidInput(format!(
                "sample {i} has a degenerate face box {:?}",
                s.face_box
            )));
        }
    }
    Ok(param_dim)
}
