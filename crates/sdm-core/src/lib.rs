//! sdm-core — Supervised Descent Method engine.
//!
//! A cascade of learned linear regressors replaces Newton steps when the
//! objective's derivative is unavailable. The generic optimiser works on any
//! observation function; the landmark model applies the same cascade to
//! facial landmarks driven by image descriptors, and the pose estimator to a
//! rigid 3D model under pinhole projection.

pub mod alignment;
pub mod bootstrap;
pub mod config;
pub mod descriptor;
pub mod model;
pub mod optimiser;
pub mod pose;
pub mod regressor;
pub mod regulariser;
pub mod statistics;
pub mod trainer;
pub mod types;

pub use config::TrainingConfig;
pub use descriptor::{DescriptorExtractor, DescriptorRegistry, PatchDescriptor};
pub use model::SdmLandmarkModel;
pub use optimiser::{Observer, SupervisedDescentOptimiser};
pub use pose::{PoseEstimator, RigidProjection};
pub use regressor::{LinearRegressor, Regressor, SingularPolicy};
pub use regulariser::{RegularisationType, Regulariser};
pub use trainer::{CascadeTrainer, TrainingSample};
pub use types::{BoundingBox, Point, Shape};
