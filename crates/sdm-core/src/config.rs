//! Cascade training configuration, loaded from TOML with `SDM_*`
//! environment overrides.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alignment::MeanNormalization;
use crate::descriptor::{DescriptorError, DescriptorExtractor, DescriptorRegistry, PatchDescriptor};
use crate::regressor::SingularPolicy;
use crate::regulariser::{RegularisationType, Regulariser};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("descriptor for cascade step {step}: {source}")]
    Descriptor {
        step: usize,
        #[source]
        source: DescriptorError,
    },
}

/// Regularisation section of the config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularisationConfig {
    #[serde(rename = "type")]
    pub kind: RegularisationType,
    pub factor: f32,
    pub regularise_last_row: bool,
}

impl Default for RegularisationConfig {
    fn default() -> Self {
        Self {
            kind: RegularisationType::MatrixNorm,
            factor: 0.5,
            regularise_last_row: false,
        }
    }
}

impl RegularisationConfig {
    pub fn regulariser(&self) -> Regulariser {
        Regulariser::new(self.kind, self.factor, self.regularise_last_row)
    }
}

/// One `[[descriptors]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorConfig {
    #[serde(rename = "type")]
    pub descriptor_type: String,
    #[serde(default)]
    pub parameters: String,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        let patch = PatchDescriptor::default();
        Self {
            descriptor_type: PatchDescriptor::TYPE.to_string(),
            parameters: patch.parameter_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of cascade steps (regressors) to learn.
    pub cascade_steps: usize,
    /// Bootstrap initialisations drawn per training image, in addition to
    /// the rigid one.
    pub samples_per_image: usize,
    pub mean_normalization: MeanNormalization,
    pub regularisation: RegularisationConfig,
    pub singular_policy: SingularPolicy,
    /// Seed for bootstrap sampling.
    pub seed: u64,
    /// Per-step descriptors. A list shorter than `cascade_steps` repeats its
    /// last entry.
    pub descriptors: Vec<DescriptorConfig>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            cascade_steps: 5,
            samples_per_image: 10,
            mean_normalization: MeanNormalization::default(),
            regularisation: RegularisationConfig::default(),
            singular_policy: SingularPolicy::default(),
            seed: 0,
            descriptors: vec![DescriptorConfig::default()],
        }
    }
}

impl TrainingConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply `SDM_*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `SDM_*` environment overrides, validated like [`Self::load`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `SDM_CASCADE_STEPS`, `SDM_SAMPLES_PER_IMAGE`,
    /// `SDM_SEED` and `SDM_REGULARISATION_FACTOR` where set and parseable.
    pub fn apply_env(&mut self) {
        self.cascade_steps = env_or("SDM_CASCADE_STEPS", self.cascade_steps);
        self.samples_per_image = env_or("SDM_SAMPLES_PER_IMAGE", self.samples_per_image);
        self.seed = env_or("SDM_SEED", self.seed);
        self.regularisation.factor = env_or("SDM_REGULARISATION_FACTOR", self.regularisation.factor);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cascade_steps > 0 && self.descriptors.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one descriptor is required when cascade_steps > 0".into(),
            ));
        }
        let factor = self.regularisation.factor;
        if !factor.is_finite() || factor < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "regularisation factor must be non-negative, got {factor}"
            )));
        }
        Ok(())
    }

    /// Descriptor configuration for cascade step `step`.
    pub fn descriptor_for_step(&self, step: usize) -> Option<&DescriptorConfig> {
        self.descriptors.get(step).or_else(|| self.descriptors.last())
    }

    /// Instantiate one extractor per cascade step.
    pub fn build_descriptors(
        &self,
        registry: &DescriptorRegistry,
    ) -> Result<Vec<Arc<dyn DescriptorExtractor>>, ConfigError> {
        (0..self.cascade_steps)
            .map(|step| {
                let dc = self.descriptor_for_step(step).ok_or_else(|| {
                    ConfigError::Invalid(format!("no descriptor for cascade step {step}"))
                })?;
                registry
                    .create(&dc.descriptor_type, &dc.parameters)
                    .map_err(|source| ConfigError::Descriptor { step, source })
            })
            .collect()
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = TrainingConfig::from_toml_str("").unwrap();
        assert_eq!(config, TrainingConfig::default());
        assert_eq!(config.regularisation.kind, RegularisationType::MatrixNorm);
        assert!(!config.regularisation.regularise_last_row);
    }

    #[test]
    fn test_full_config() {
        let text = r#"
            cascade_steps = 3
            samples_per_image = 4
            mean_normalization = "none"
            singular_policy = "tolerate"
            seed = 99

            [regularisation]
            type = "eigenvalue_threshold"
            regularise_last_row = true

            [[descriptors]]
            type = "patch"
            parameters = "patchSize 7 spacing 3"

            [[descriptors]]
            type = "patch"
            parameters = "patchSize 5 spacing 1.5"
        "#;
        let config = TrainingConfig::from_toml_str(text).unwrap();
        assert_eq!(config.cascade_steps, 3);
        assert_eq!(config.mean_normalization, MeanNormalization::None);
        assert_eq!(config.singular_policy, SingularPolicy::Tolerate);
        assert_eq!(config.regularisation.kind, RegularisationType::EigenvalueThreshold);

        let descriptors = config.build_descriptors(&DescriptorRegistry::default()).unwrap();
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].descriptor_dim(), 49);
        assert_eq!(descriptors[1].descriptor_dim(), 25);
        // Last entry repeats.
        assert_eq!(descriptors[2].parameter_string(), "patchSize 5 spacing 1.5");
    }

    #[test]
    fn test_unknown_descriptor_is_reported_with_step() {
        let text = r#"
            cascade_steps = 2
            [[descriptors]]
            type = "patch"
            [[descriptors]]
            type = "vlhog-dt"
        "#;
        let config = TrainingConfig::from_toml_str(text).unwrap();
        let err = config.build_descriptors(&DescriptorRegistry::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Descriptor { step: 1, .. }), "{err}");
    }

    #[test]
    fn test_env_overrides_are_validated() {
        // Only this test touches SDM_REGULARISATION_FACTOR.
        std::env::set_var("SDM_REGULARISATION_FACTOR", "-2.5");
        let rejected = TrainingConfig::from_env();
        std::env::set_var("SDM_REGULARISATION_FACTOR", "0.25");
        let accepted = TrainingConfig::from_env();
        std::env::remove_var("SDM_REGULARISATION_FACTOR");

        assert!(matches!(rejected, Err(ConfigError::Invalid(_))));
        assert_eq!(accepted.unwrap().regularisation.factor, 0.25);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(matches!(
            TrainingConfig::from_toml_str("descriptors = []"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TrainingConfig::from_toml_str("[regularisation]\nfactor = -1.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TrainingConfig::from_toml_str("cascade_steps = \"many\""),
            Err(ConfigError::Toml(_))
        ));
    }
}
