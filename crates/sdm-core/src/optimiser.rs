//! Supervised descent: a learned cascade of regressors that stands in for
//! Newton steps on an observation function without needing its derivative.
//!
//! Given ground-truth parameters `x`, initial guesses `x0`, and target
//! observations `y`, each cascade level learns the mapping from the
//! observation residual `h(x_k) − y` to the parameter error `x_k − x`.
//! At inference the same levels are applied in order:
//!
//! ```text
//! x_{k+1} = x_k − R_k · (h(x_k) − y)
//! ```

use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::regressor::{normalised_residual, RegressionError, Regressor};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimiserError {
    #[error("{what} has {actual} rows, expected {expected}")]
    RowMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what} has {actual} columns, expected {expected}")]
    ColumnMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("observation for row {row} has length {actual}, targets have width {expected}")]
    ObservationWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("no training examples")]
    Empty,
    #[error("regressor {level}: {source}")]
    Regression {
        level: usize,
        #[source]
        source: RegressionError,
    },
}

/// The observation function `h`: parameters → something comparable to `y`.
///
/// Implementations must be free of side effects visible to the optimiser;
/// rows are evaluated in parallel.
pub trait Observer: Sync {
    fn evaluate(&self, params: &[f32]) -> Vec<f32>;

    /// Length of every observation, when known up front. Lets the optimiser
    /// reject mismatched targets before evaluating anything.
    fn observation_len(&self) -> Option<usize> {
        None
    }
}

impl<F> Observer for F
where
    F: Fn(&[f32]) -> Vec<f32> + Sync,
{
    fn evaluate(&self, params: &[f32]) -> Vec<f32> {
        self(params)
    }
}

/// Cascade driver over an ordered, fixed-size list of regressors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedDescentOptimiser<R> {
    regressors: Vec<R>,
}

impl<R: Regressor> SupervisedDescentOptimiser<R> {
    pub fn new(regressors: Vec<R>) -> Self {
        Self { regressors }
    }

    pub fn regressors(&self) -> &[R] {
        &self.regressors
    }

    pub fn num_levels(&self) -> usize {
        self.regressors.len()
    }

    /// Learn every regressor level. See [`Self::train_with_callback`].
    pub fn train<H: Observer>(
        &mut self,
        x: &DMatrix<f32>,
        x0: &DMatrix<f32>,
        y: &DMatrix<f32>,
        h: &H,
    ) -> Result<(), OptimiserError> {
        self.train_with_callback(x, x0, y, h, |_| {})
    }

    /// Learn every regressor level, calling `on_epoch` with the updated
    /// estimate after each one.
    ///
    /// `x` and `x0` are `n × paramDim`, `y` is `n × obsDim`.
    pub fn train_with_callback<H, F>(
        &mut self,
        x: &DMatrix<f32>,
        x0: &DMatrix<f32>,
        y: &DMatrix<f32>,
        h: &H,
        mut on_epoch: F,
    ) -> Result<(), OptimiserError>
    where
        H: Observer,
        F: FnMut(&DMatrix<f32>),
    {
        check_inputs(x0, y)?;
        if x.nrows() != x0.nrows() {
            return Err(OptimiserError::RowMismatch {
                what: "ground truth",
                expected: x0.nrows(),
                actual: x.nrows(),
            });
        }
        if x.ncols() != x0.ncols() {
            return Err(OptimiserError::ColumnMismatch {
                what: "ground truth",
                expected: x0.ncols(),
                actual: x.ncols(),
            });
        }

        let mut current = x0.clone();
        for (level, regressor) in self.regressors.iter_mut().enumerate() {
            let residual_input = observation_residual(h, &current, y)?;
            let correction = &current - x;

            let well_posed = regressor
                .learn(&residual_input, &correction)
                .map_err(|source| OptimiserError::Regression { level, source })?;
            let step = regressor
                .predict(&residual_input)
                .map_err(|source| OptimiserError::Regression { level, source })?;
            check_step(&step, &current, level)?;
            current -= step;

            tracing::debug!(
                level,
                well_posed,
                residual = normalised_residual(&current, x),
                "trained regressor level"
            );
            on_epoch(&current);
        }
        Ok(())
    }

    /// Run the cascade from `x0` toward `y` for every row.
    pub fn test<H: Observer>(
        &self,
        x0: &DMatrix<f32>,
        y: &DMatrix<f32>,
        h: &H,
    ) -> Result<DMatrix<f32>, OptimiserError> {
        check_inputs(x0, y)?;
        let mut current = x0.clone();
        for (level, regressor) in self.regressors.iter().enumerate() {
            let residual_input = observation_residual(h, &current, y)?;
            let step = regressor
                .predict(&residual_input)
                .map_err(|source| OptimiserError::Regression { level, source })?;
            check_step(&step, &current, level)?;
            current -= step;
        }
        Ok(current)
    }

    /// Like [`Self::test`], also returning the normalised residual against
    /// known ground truth. Intended for training-time validation.
    pub fn test_with_ground_truth<H: Observer>(
        &self,
        x0: &DMatrix<f32>,
        y: &DMatrix<f32>,
        h: &H,
        x: &DMatrix<f32>,
    ) -> Result<(DMatrix<f32>, f64), OptimiserError> {
        let predictions = self.test(x0, y, h)?;
        if x.shape() != predictions.shape() {
            return Err(OptimiserError::ColumnMismatch {
                what: "ground truth",
                expected: predictions.ncols(),
                actual: x.ncols(),
            });
        }
        let residual = normalised_least_squares_residual(&predictions, x);
        Ok((predictions, residual))
    }

    /// Single-example inference.
    pub fn predict<H: Observer>(&self, x0: &[f32], y: &[f32], h: &H) -> Result<Vec<f32>, OptimiserError> {
        let x0 = DMatrix::from_row_slice(1, x0.len(), x0);
        let y = DMatrix::from_row_slice(1, y.len(), y);
        let out = self.test(&x0, &y, h)?;
        Ok(out.iter().copied().collect())
    }
}

/// `‖prediction − ground_truth‖₂ / ‖ground_truth‖₂`.
///
/// An all-zero ground truth gives `0.0` for an exact match and
/// `f64::INFINITY` otherwise.
pub fn normalised_least_squares_residual(prediction: &DMatrix<f32>, ground_truth: &DMatrix<f32>) -> f64 {
    normalised_residual(prediction, ground_truth)
}

fn check_inputs(x0: &DMatrix<f32>, y: &DMatrix<f32>) -> Result<(), OptimiserError> {
    if x0.nrows() == 0 {
        return Err(OptimiserError::Empty);
    }
    if y.nrows() != x0.nrows() {
        return Err(OptimiserError::RowMismatch {
            what: "targets",
            expected: x0.nrows(),
            actual: y.nrows(),
        });
    }
    Ok(())
}

fn check_step(step: &DMatrix<f32>, current: &DMatrix<f32>, level: usize) -> Result<(), OptimiserError> {
    if step.ncols() != current.ncols() {
        return Err(OptimiserError::Regression {
            level,
            source: RegressionError::ColumnMismatch {
                expected: current.ncols(),
                actual: step.ncols(),
            },
        });
    }
    Ok(())
}

/// `h(current[i]) − y[i]` for every row. Rows are evaluated in parallel and
/// assembled in order.
fn observation_residual<H: Observer>(
    h: &H,
    current: &DMatrix<f32>,
    y: &DMatrix<f32>,
) -> Result<DMatrix<f32>, OptimiserError> {
    let width = y.ncols();
    if let Some(len) = h.observation_len() {
        if len != width {
            return Err(OptimiserError::ObservationWidth {
                row: 0,
                expected: width,
                actual: len,
            });
        }
    }
    let observations: Vec<Vec<f32>> = (0..current.nrows())
        .into_par_iter()
        .map(|i| {
            let params: Vec<f32> = current.row(i).iter().copied().collect();
            h.evaluate(&params)
        })
        .collect();

    let mut residual = DMatrix::<f32>::zeros(current.nrows(), width);
    for (i, obs) in observations.iter().enumerate() {
        if obs.len() != width {
            return Err(OptimiserError::ObservationWidth {
                row: i,
                expected: width,
                actual: obs.len(),
            });
        }
        for (j, &value) in obs.iter().enumerate() {
            residual[(i, j)] = value - y[(i, j)];
        }
    }
    Ok(residual)
}
