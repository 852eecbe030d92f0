//! Rigid placement of a mean shape inside a face box, and mean-shape
//! computation from ground-truth landmarks.
//!
//! Model space is centred on the unit square `[-0.5, 0.5]²`: a model point at
//! the origin lands in the middle of the face box.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{centroid, num_landmarks, BoundingBox, Shape};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("no shapes given")]
    NoShapes,
    #[error("shape {index} has {actual} values, expected {expected}")]
    ShapeLength {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("got {boxes} face boxes for {shapes} shapes")]
    BoxCount { shapes: usize, boxes: usize },
    #[error("face box {index} is degenerate: {face_box:?}")]
    DegenerateBox { index: usize, face_box: BoundingBox },
    #[error("shape {index} has zero extent along {axis}")]
    ZeroExtent { index: usize, axis: char },
    #[error("mean shape has zero norm and cannot be normalised")]
    ZeroNorm,
}

/// How the averaged mean shape is normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeanNormalization {
    /// Leave the plain average.
    None,
    /// Centre on the origin, then scale to unit Frobenius norm, which makes
    /// the mean independent of the landmark count.
    #[default]
    UnitSumSquaredNorms,
}

/// Place `mean` inside `face_box` with the given per-axis scale and
/// translation (translation is in box-size units):
///
/// ```text
/// x' = (x·scale_x + 0.5 + translation_x)·width  + box_x
/// y' = (y·scale_y + 0.5 + translation_y)·height + box_y
/// ```
pub fn align_mean(
    mean: &Shape,
    face_box: &BoundingBox,
    scale_x: f32,
    scale_y: f32,
    translation_x: f32,
    translation_y: f32,
) -> Shape {
    let n = num_landmarks(mean);
    let mut aligned = mean.clone();
    for i in 0..n {
        aligned[i] = (mean[i] * scale_x + 0.5 + translation_x) * face_box.width + face_box.x;
        aligned[i + n] = (mean[i + n] * scale_y + 0.5 + translation_y) * face_box.height + face_box.y;
    }
    aligned
}

/// The inference-time initial shape: [`align_mean`] with unit scale and no
/// translation.
pub fn align_rigid(mean: &Shape, face_box: &BoundingBox) -> Shape {
    align_mean(mean, face_box, 1.0, 1.0, 0.0, 0.0)
}

/// Inverse of [`align_rigid`]: map an image-space shape into model space
/// relative to its face box.
pub fn normalise_to_box(shape: &Shape, face_box: &BoundingBox) -> Shape {
    let n = num_landmarks(shape);
    let mut out = shape.clone();
    for i in 0..n {
        out[i] = (shape[i] - face_box.x) / face_box.width - 0.5;
        out[i + n] = (shape[i + n] - face_box.y) / face_box.height - 0.5;
    }
    out
}

/// Row-wise average of `shapes`.
///
/// With `face_boxes`, each shape is first normalised into its box so the mean
/// lives in model space; without, the shapes are averaged as given.
pub fn calculate_mean(
    shapes: &[Shape],
    face_boxes: Option<&[BoundingBox]>,
    normalization: MeanNormalization,
) -> Result<Shape, AlignmentError> {
    let first = shapes.first().ok_or(AlignmentError::NoShapes)?;
    let len = first.len();
    if let Some(boxes) = face_boxes {
        if boxes.len() != shapes.len() {
            return Err(AlignmentError::BoxCount {
                shapes: shapes.len(),
                boxes: boxes.len(),
            });
        }
    }

    let mut sum = Shape::zeros(len);
    for (index, shape) in shapes.iter().enumerate() {
        if shape.len() != len {
            return Err(AlignmentError::ShapeLength {
                index,
                expected: len,
                actual: shape.len(),
            });
        }
        match face_boxes {
            Some(boxes) => {
                let face_box = &boxes[index];
                if !face_box.is_valid() {
                    return Err(AlignmentError::DegenerateBox {
                        index,
                        face_box: *face_box,
                    });
                }
                sum += normalise_to_box(shape, face_box);
            }
            None => sum += shape,
        }
    }
    let mut mean = sum / shapes.len() as f32;

    if normalization == MeanNormalization::UnitSumSquaredNorms {
        let n = num_landmarks(&mean);
        let (cx, cy) = centroid(&mean);
        for i in 0..n {
            mean[i] -= cx;
            mean[i + n] -= cy;
        }
        let norm = mean.norm();
        if norm <= f32::EPSILON {
            return Err(AlignmentError::ZeroNorm);
        }
        mean /= norm;
    }

    Ok(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{extent, shape_from_points, Point};

    fn square() -> Shape {
        shape_from_points(&[
            Point::new(-0.25, -0.25),
            Point::new(0.25, -0.25),
            Point::new(0.25, 0.25),
            Point::new(-0.25, 0.25),
        ])
    }

    #[test]
    fn test_align_rigid_centres_in_box() {
        let face_box = BoundingBox::new(100.0, 50.0, 200.0, 100.0);
        let aligned = align_rigid(&square(), &face_box);
        let (cx, cy) = centroid(&aligned);
        assert!((cx - 200.0).abs() < 1e-4, "cx = {cx}");
        assert!((cy - 100.0).abs() < 1e-4, "cy = {cy}");
        let (w, h) = extent(&aligned);
        assert!((w - 100.0).abs() < 1e-4);
        assert!((h - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_align_mean_scale_and_translation() {
        let face_box = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let aligned = align_mean(&square(), &face_box, 2.0, 1.0, 0.1, -0.1);
        let (cx, cy) = centroid(&aligned);
        assert!((cx - 60.0).abs() < 1e-4, "cx = {cx}");
        assert!((cy - 40.0).abs() < 1e-4, "cy = {cy}");
        let (w, h) = extent(&aligned);
        assert!((w - 100.0).abs() < 1e-3, "w = {w}");
        assert!((h - 50.0).abs() < 1e-3, "h = {h}");
    }

    #[test]
    fn test_normalise_inverts_align() {
        let face_box = BoundingBox::new(13.0, 27.0, 80.0, 90.0);
        let back = normalise_to_box(&align_rigid(&square(), &face_box), &face_box);
        for (a, b) in back.iter().zip(square().iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mean_unit_norm_and_centred() {
        let a = square();
        let b = square() * 3.0;
        let mean = calculate_mean(&[a, b], None, MeanNormalization::UnitSumSquaredNorms).unwrap();
        assert!((mean.norm() - 1.0).abs() < 1e-5);
        let (cx, cy) = centroid(&mean);
        assert!(cx.abs() < 1e-6 && cy.abs() < 1e-6);
    }

    #[test]
    fn test_mean_with_face_boxes() {
        let boxes = [
            BoundingBox::new(0.0, 0.0, 100.0, 100.0),
            BoundingBox::new(500.0, 200.0, 50.0, 50.0),
        ];
        let shapes = [align_rigid(&square(), &boxes[0]), align_rigid(&square(), &boxes[1])];
        let mean = calculate_mean(&shapes, Some(&boxes[..]), MeanNormalization::None).unwrap();
        for (a, b) in mean.iter().zip(square().iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mean_errors() {
        assert_eq!(
            calculate_mean(&[], None, MeanNormalization::None),
            Err(AlignmentError::NoShapes)
        );
        let shapes = [square(), Shape::zeros(4)];
        assert_eq!(
            calculate_mean(&shapes, None, MeanNormalization::None),
            Err(AlignmentError::ShapeLength {
                index: 1,
                expected: 8,
                actual: 4
            })
        );
        let boxes = [BoundingBox::new(0.0, 0.0, 1.0, 1.0)];
        assert_eq!(
            calculate_mean(&[square(), square()], Some(&boxes[..]), MeanNormalization::None),
            Err(AlignmentError::BoxCount { shapes: 2, boxes: 1 })
        );
        let zero = [Shape::zeros(8)];
        assert_eq!(
            calculate_mean(&zero, None, MeanNormalization::UnitSumSquaredNorms),
            Err(AlignmentError::ZeroNorm)
        );
    }
}
