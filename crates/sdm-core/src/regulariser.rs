//! Diagonal regularisation for ridge-regression solves.
//!
//! The matrix returned by [`Regulariser::matrix`] is added to the Gram matrix
//! `AᵗA` before it is inverted.

use nalgebra::{DMatrix, FullPivLU};
use serde::{Deserialize, Serialize};

use crate::regressor::pivot_summary;

/// How the regularisation strength is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegularisationType {
    /// Fixed `lambda·I`.
    Manual,
    /// `lambda = factor · ‖AᵗA‖_F / num_training_elements`.
    MatrixNorm,
    /// `lambda = 2 · |max pivot| · threshold` from a full-pivot LU of `AᵗA`.
    ///
    /// The threshold is the LU rank threshold `ε · dim`, so this is the smallest
    /// amount that lifts numerically-zero eigenvalues strictly above zero.
    EigenvalueThreshold,
}

/// Produces the diagonal matrix added to a Gram matrix before inversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Regulariser {
    pub regularisation_type: RegularisationType,
    /// `lambda` for [`RegularisationType::Manual`], the scaling factor for
    /// [`RegularisationType::MatrixNorm`]; unused by the eigenvalue threshold.
    pub param: f32,
    /// When false, the last diagonal entry is left at zero so a trailing bias
    /// column is never shrunk.
    pub regularise_last_row: bool,
}

impl Default for Regulariser {
    /// Manual regularisation with `lambda = 0`, i.e. plain least squares.
    fn default() -> Self {
        Self::manual(0.0)
    }
}

impl Regulariser {
    pub fn new(regularisation_type: RegularisationType, param: f32, regularise_last_row: bool) -> Self {
        Self {
            regularisation_type,
            param,
            regularise_last_row,
        }
    }

    pub fn manual(lambda: f32) -> Self {
        Self::new(RegularisationType::Manual, lambda, true)
    }

    pub fn matrix_norm(factor: f32) -> Self {
        Self::new(RegularisationType::MatrixNorm, factor, true)
    }

    pub fn eigenvalue_threshold() -> Self {
        Self::new(RegularisationType::EigenvalueThreshold, 0.0, true)
    }

    /// Builder-style toggle for [`Regulariser::regularise_last_row`].
    pub fn with_last_row(mut self, regularise_last_row: bool) -> Self {
        self.regularise_last_row = regularise_last_row;
        self
    }

    /// Effective `lambda` for the given Gram matrix.
    pub fn lambda(&self, gram: &DMatrix<f32>, num_training_elements: usize) -> f32 {
        match self.regularisation_type {
            RegularisationType::Manual => self.param,
            RegularisationType::MatrixNorm => {
                if num_training_elements == 0 {
                    return 0.0;
                }
                self.param * gram.norm() / num_training_elements as f32
            }
            RegularisationType::EigenvalueThreshold => {
                if gram.is_empty() {
                    return 0.0;
                }
                let lu = FullPivLU::new(gram.clone());
                let pivots = pivot_summary(&lu);
                2.0 * pivots.max_pivot * pivots.threshold
            }
        }
    }

    /// Square diagonal matrix with the same size as `gram`.
    pub fn matrix(&self, gram: &DMatrix<f32>, num_training_elements: usize) -> DMatrix<f32> {
        let dim = gram.nrows();
        let lambda = self.lambda(gram, num_training_elements);
        let mut reg = DMatrix::<f32>::identity(dim, dim) * lambda;
        if !self.regularise_last_row && dim > 0 {
            reg[(dim - 1, dim - 1)] = 0.0;
        }
        tracing::debug!(
            kind = ?self.regularisation_type,
            lambda,
            dim,
            "regularisation matrix"
        );
        reg
    }
}
