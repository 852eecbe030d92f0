//! Rigid 6-DOF pose estimation from 2D landmarks with supervised descent.
//!
//! Parameters are `[rx, ry, rz, tx, ty, tz]`: Euler angles in degrees
//! (roll, pitch, yaw about x, y, z) and a translation in model units. The
//! observation is the pinhole projection of a reduced set of 3D model
//! vertices, laid out `[u1..uN, v1..vN]` like landmark shapes.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::{DMatrix, Matrix3xX, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::optimiser::{Observer, OptimiserError, SupervisedDescentOptimiser};
use crate::regressor::LinearRegressor;

pub const POSE_DIM: usize = 6;

#[derive(Error, Debug)]
pub enum PoseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Archive(#[from] serde_json::Error),
    #[error("{0} vertex ids for {1} model points")]
    VertexIds(usize, usize),
    #[error(transparent)]
    Optimiser(#[from] OptimiserError),
}

/// Pinhole projection of fixed 3D points under a rigid transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidProjection {
    points: Matrix3xX<f32>,
    focal_length: f32,
    principal_point: (f32, f32),
}

impl RigidProjection {
    pub fn new(points: Matrix3xX<f32>, focal_length: f32, principal_point: (f32, f32)) -> Self {
        Self {
            points,
            focal_length,
            principal_point,
        }
    }

    pub fn num_points(&self) -> usize {
        self.points.ncols()
    }

    pub fn rotation(rx: f32, ry: f32, rz: f32) -> Rotation3<f32> {
        Rotation3::from_euler_angles(rx.to_radians(), ry.to_radians(), rz.to_radians())
    }
}

impl Observer for RigidProjection {
    /// Projects every point; a parameter vector of the wrong length yields an
    /// empty observation, which the optimiser rejects.
    fn evaluate(&self, params: &[f32]) -> Vec<f32> {
        let [rx, ry, rz, tx, ty, tz] = match params {
            &[rx, ry, rz, tx, ty, tz] => [rx, ry, rz, tx, ty, tz],
            _ => return Vec::new(),
        };
        let r = Self::rotation(rx, ry, rz);
        let t = Vector3::new(tx, ty, tz);
        let n = self.num_points();
        let (cx, cy) = self.principal_point;
        let mut out = vec![0.0f32; 2 * n];
        for (i, p) in self.points.column_iter().enumerate() {
            let pc = r * p.clone_owned() + t;
            out[i] = self.focal_length * pc.x / pc.z + cx;
            out[i + n] = self.focal_length * pc.y / pc.z + cy;
        }
        out
    }

    fn observation_len(&self) -> Option<usize> {
        Some(2 * self.num_points())
    }
}

/// A trained pose predictor, persisted as one opaque JSON archive.
///
/// No compatibility is promised across crate versions; an archive only has
/// to reload into an identical predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseEstimator {
    optimiser: SupervisedDescentOptimiser<LinearRegressor>,
    projection: RigidProjection,
    vertex_ids: Vec<usize>,
}

impl PoseEstimator {
    /// Learn `regressors` on ground-truth poses `x` (`n × 6`) starting from
    /// `x0`. Targets are the projections of the ground-truth poses.
    pub fn train(
        projection: RigidProjection,
        vertex_ids: Vec<usize>,
        regressors: Vec<LinearRegressor>,
        x: &DMatrix<f32>,
        x0: &DMatrix<f32>,
    ) -> Result<Self, PoseError> {
        if vertex_ids.len() != projection.num_points() {
            return Err(PoseError::VertexIds(vertex_ids.len(), projection.num_points()));
        }
        if x.ncols() != POSE_DIM {
            return Err(OptimiserError::ColumnMismatch {
                what: "poses",
                expected: POSE_DIM,
                actual: x.ncols(),
            }
            .into());
        }
        let width = 2 * projection.num_points();
        let mut y = DMatrix::<f32>::zeros(x.nrows(), width);
        for (i, row) in x.row_iter().enumerate() {
            let params: Vec<f32> = row.iter().copied().collect();
            let obs = projection.evaluate(&params);
            for (j, v) in obs.into_iter().enumerate() {
                y[(i, j)] = v;
            }
        }

        let mut optimiser = SupervisedDescentOptimiser::new(regressors);
        optimiser.train_with_callback(x, x0, &y, &projection, |current| {
            tracing::debug!(
                residual = crate::optimiser::normalised_least_squares_residual(current, x),
                "pose training epoch"
            );
        })?;

        Ok(Self {
            optimiser,
            projection,
            vertex_ids,
        })
    }

    pub fn vertex_ids(&self) -> &[usize] {
        &self.vertex_ids
    }

    pub fn projection(&self) -> &RigidProjection {
        &self.projection
    }

    pub fn num_levels(&self) -> usize {
        self.optimiser.num_levels()
    }

    /// Pose whose projection matches `landmarks` (`[u1..uN, v1..vN]`).
    pub fn estimate(&self, landmarks: &[f32], initial_pose: &[f32]) -> Result<Vec<f32>, PoseError> {
        Ok(self.optimiser.predict(initial_pose, landmarks, &self.projection)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PoseError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PoseError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
