//! Per-cascade-step ridge regression.

use nalgebra::{DMatrix, Dyn, FullPivLU};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::regulariser::Regulariser;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegressionError {
    #[error("regression data has no rows")]
    Empty,
    #[error("data has {data} rows but labels have {labels}")]
    RowMismatch { data: usize, labels: usize },
    #[error("input has {actual} columns, regressor expects {expected}")]
    ColumnMismatch { expected: usize, actual: usize },
    #[error("regressor has not been trained")]
    NotTrained,
    #[error("regularised Gram matrix is singular (rank {rank} of {dim}); increase regularisation")]
    SingularGram { rank: usize, dim: usize },
}

/// What `learn` does when the regularised Gram matrix is rank deficient.
///
/// The decision is the same in every build profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingularPolicy {
    /// Return [`RegressionError::SingularGram`] and keep the previous solution.
    #[default]
    Fail,
    /// Keep the ill-conditioned solution and report it via `Ok(false)`.
    Tolerate,
}

/// A learner that maps a feature matrix to parameter corrections.
pub trait Regressor {
    /// Fit on `data` (`n × d`) against `labels` (`n × p`).
    ///
    /// Returns whether the solve was well-posed.
    fn learn(&mut self, data: &DMatrix<f32>, labels: &DMatrix<f32>) -> Result<bool, RegressionError>;

    /// Apply the fitted mapping to `values` (`m × d`), giving `m × p`.
    fn predict(&self, values: &DMatrix<f32>) -> Result<DMatrix<f32>, RegressionError>;

    /// Relative residual `‖predict(data) − labels‖₂ / ‖labels‖₂`.
    fn test(&self, data: &DMatrix<f32>, labels: &DMatrix<f32>) -> Result<f64, RegressionError> {
        if data.nrows() != labels.nrows() {
            return Err(RegressionError::RowMismatch {
                data: data.nrows(),
                labels: labels.nrows(),
            });
        }
        let predictions = self.predict(data)?;
        Ok(normalised_residual(&predictions, labels))
    }
}

/// `‖a − b‖₂ / ‖b‖₂`, accumulated in double precision.
///
/// An all-zero `b` has no scale to normalise by: the result is `0.0` when `a`
/// matches it exactly and `f64::INFINITY` otherwise, never NaN.
pub(crate) fn normalised_residual(a: &DMatrix<f32>, b: &DMatrix<f32>) -> f64 {
    let diff: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&p, &q)| {
            let d = p as f64 - q as f64;
            d * d
        })
        .sum();
    let norm: f64 = b.iter().map(|&q| (q as f64) * (q as f64)).sum();
    if norm == 0.0 {
        if diff == 0.0 {
            return 0.0;
        }
        tracing::warn!(
            error = diff.sqrt(),
            "residual normalised by an all-zero ground truth"
        );
        return f64::INFINITY;
    }
    diff.sqrt() / norm.sqrt()
}

/// Pivot information from a full-pivot LU decomposition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PivotSummary {
    /// Largest absolute pivot.
    pub max_pivot: f32,
    /// Relative rank threshold, `ε · dim`.
    pub threshold: f32,
    /// Number of pivots strictly above `threshold · max_pivot`.
    pub rank: usize,
}

pub(crate) fn pivot_summary(lu: &FullPivLU<f32, Dyn, Dyn>) -> PivotSummary {
    let u = lu.u();
    let dim = u.nrows().min(u.ncols());
    let max_pivot = (0..dim).map(|i| u[(i, i)].abs()).fold(0.0f32, f32::max);
    let threshold = f32::EPSILON * dim as f32;
    let rank = (0..dim)
        .filter(|&i| u[(i, i)].abs() > threshold * max_pivot)
        .count();
    PivotSummary {
        max_pivot,
        threshold,
        rank,
    }
}

/// Ridge regressor `R = (AᵗA + Reg)⁻¹ Aᵗ b`, solved via full-pivot LU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegressor {
    regulariser: Regulariser,
    singular_policy: SingularPolicy,
    /// `d × p`; empty until trained.
    x: DMatrix<f32>,
}

impl Default for LinearRegressor {
    fn default() -> Self {
        Self::new(Regulariser::default())
    }
}

impl LinearRegressor {
    pub fn new(regulariser: Regulariser) -> Self {
        Self {
            regulariser,
            singular_policy: SingularPolicy::default(),
            x: DMatrix::zeros(0, 0),
        }
    }

    pub fn with_singular_policy(mut self, policy: SingularPolicy) -> Self {
        self.singular_policy = policy;
        self
    }

    /// Wrap an already-learned coefficient matrix.
    pub fn from_matrix(x: DMatrix<f32>) -> Self {
        Self {
            x,
            ..Self::default()
        }
    }

    pub fn regulariser(&self) -> &Regulariser {
        &self.regulariser
    }

    /// The learned `d × p` coefficient matrix.
    pub fn matrix(&self) -> &DMatrix<f32> {
        &self.x
    }

    pub fn is_trained(&self) -> bool {
        !self.x.is_empty()
    }
}

impl Regressor for LinearRegressor {
    fn learn(&mut self, data: &DMatrix<f32>, labels: &DMatrix<f32>) -> Result<bool, RegressionError> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(RegressionError::Empty);
        }
        if data.nrows() != labels.nrows() {
            return Err(RegressionError::RowMismatch {
                data: data.nrows(),
                labels: labels.nrows(),
            });
        }

        let mut gram = data.tr_mul(data);
        gram += self.regulariser.matrix(&gram, data.nrows());
        let dim = gram.nrows();

        let lu = FullPivLU::new(gram.clone());
        let pivots = pivot_summary(&lu);
        let invertible = pivots.rank == dim;

        if !invertible {
            tracing::warn!(
                rank = pivots.rank,
                dim,
                policy = ?self.singular_policy,
                "regularised Gram matrix is not invertible"
            );
            if self.singular_policy == SingularPolicy::Fail {
                return Err(RegressionError::SingularGram {
                    rank: pivots.rank,
                    dim,
                });
            }
        }

        // An exactly-zero pivot leaves LU without an inverse; fall back to the
        // pseudo-inverse so a tolerated solve still yields a regressor.
        let inverse = match lu.try_inverse() {
            Some(inv) => inv,
            None => gram
                .pseudo_inverse(f32::EPSILON)
                .map_err(|_| RegressionError::SingularGram {
                    rank: pivots.rank,
                    dim,
                })?,
        };

        self.x = inverse * data.transpose() * labels;
        Ok(invertible)
    }

    fn predict(&self, values: &DMatrix<f32>) -> Result<DMatrix<f32>, RegressionError> {
        if !self.is_trained() {
            return Err(RegressionError::NotTrained);
        }
        if values.ncols() != self.x.nrows() {
            return Err(RegressionError::ColumnMismatch {
                expected: self.x.nrows(),
                actual: values.ncols(),
            });
        }
        Ok(values * &self.x)
    }
}
