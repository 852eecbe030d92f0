//! Empirical bias and scale error of the rigid initial placement.
//!
//! The face detector's boxes are not centred on the landmarks in a consistent
//! way, nor sized to them exactly. Comparing ground truth against the
//! rigidly-aligned mean over the training set gives a Gaussian per axis for
//! translation and scale, which is folded back into the mean and used to draw
//! realistic bootstrap initialisations.

use serde::{Deserialize, Serialize};

use crate::alignment::{align_rigid, AlignmentError};
use crate::types::{centroid, extent, num_landmarks, BoundingBox, Shape};

/// Mean and standard deviation of a normal distribution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Gaussian {
    pub mu: f32,
    pub sigma: f32,
}

impl Gaussian {
    pub const fn new(mu: f32, sigma: f32) -> Self {
        Self { mu, sigma }
    }

    /// Population mean and standard deviation of `values`.
    pub fn estimate(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mu = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mu).powi(2)).sum::<f64>() / n;
        Self::new(mu as f32, var.sqrt() as f32)
    }
}

/// Per-axis translation and scale error of the rigidly-aligned mean relative
/// to ground truth. Translation is in box-size units, scale is an extent ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentStatistics {
    pub scale_x: Gaussian,
    pub scale_y: Gaussian,
    pub translation_x: Gaussian,
    pub translation_y: Gaussian,
}

impl Default for AlignmentStatistics {
    /// No bias, no spread.
    fn default() -> Self {
        Self {
            scale_x: Gaussian::new(1.0, 0.0),
            scale_y: Gaussian::new(1.0, 0.0),
            translation_x: Gaussian::new(0.0, 0.0),
            translation_y: Gaussian::new(0.0, 0.0),
        }
    }
}

impl AlignmentStatistics {
    /// Measure how ground truth deviates from `mean` aligned into each face box.
    pub fn estimate(
        mean: &Shape,
        ground_truth: &[Shape],
        face_boxes: &[BoundingBox],
    ) -> Result<Self, AlignmentError> {
        if ground_truth.is_empty() {
            return Err(AlignmentError::NoShapes);
        }
        if ground_truth.len() != face_boxes.len() {
            return Err(AlignmentError::BoxCount {
                shapes: ground_truth.len(),
                boxes: face_boxes.len(),
            });
        }

        let count = ground_truth.len();
        let mut tx = Vec::with_capacity(count);
        let mut ty = Vec::with_capacity(count);
        let mut sx = Vec::with_capacity(count);
        let mut sy = Vec::with_capacity(count);

        for (index, (truth, face_box)) in ground_truth.iter().zip(face_boxes).enumerate() {
            if truth.len() != mean.len() {
                return Err(AlignmentError::ShapeLength {
                    index,
                    expected: mean.len(),
                    actual: truth.len(),
                });
            }
            if !face_box.is_valid() {
                return Err(AlignmentError::DegenerateBox {
                    index,
                    face_box: *face_box,
                });
            }

            let aligned = align_rigid(mean, face_box);
            let (truth_cx, truth_cy) = centroid(truth);
            let (aligned_cx, aligned_cy) = centroid(&aligned);
            tx.push((truth_cx - aligned_cx) / face_box.width);
            ty.push((truth_cy - aligned_cy) / face_box.height);

            let (truth_w, truth_h) = extent(truth);
            let (aligned_w, aligned_h) = extent(&aligned);
            if aligned_w <= 0.0 {
                return Err(AlignmentError::ZeroExtent { index, axis: 'x' });
            }
            if aligned_h <= 0.0 {
                return Err(AlignmentError::ZeroExtent { index, axis: 'y' });
            }
            sx.push(truth_w / aligned_w);
            sy.push(truth_h / aligned_h);
        }

        let stats = Self {
            scale_x: Gaussian::estimate(&sx),
            scale_y: Gaussian::estimate(&sy),
            translation_x: Gaussian::estimate(&tx),
            translation_y: Gaussian::estimate(&ty),
        };
        tracing::info!(
            samples = count,
            scale_x = ?stats.scale_x,
            scale_y = ?stats.scale_y,
            translation_x = ?stats.translation_x,
            translation_y = ?stats.translation_y,
            "alignment statistics"
        );
        Ok(stats)
    }

    /// Fold the mean bias and scale into `mean`, so that aligning the result
    /// rigidly has approximately zero translation error and unit scale error.
    ///
    /// Scaling is about the mean's own centroid so it does not shift it.
    pub fn rescale_mean(&self, mean: &Shape) -> Shape {
        let n = num_landmarks(mean);
        let (cx, cy) = centroid(mean);
        let mut out = mean.clone();
        for i in 0..n {
            out[i] = (mean[i] - cx) * self.scale_x.mu + cx + self.translation_x.mu;
            out[i + n] = (mean[i + n] - cy) * self.scale_y.mu + cy + self.translation_y.mu;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::align_mean;
    use crate::types::{shape_from_points, Point};

    fn triangle() -> Shape {
        shape_from_points(&[Point::new(-0.3, -0.2), Point::new(0.3, -0.2), Point::new(0.0, 0.3)])
    }

    fn biased_data() -> (Vec<Shape>, Vec<BoundingBox>) {
        let boxes = vec![
            BoundingBox::new(10.0, 20.0, 100.0, 100.0),
            BoundingBox::new(300.0, 40.0, 60.0, 80.0),
            BoundingBox::new(50.0, 200.0, 150.0, 120.0),
        ];
        // Every face is 20% wider and 10% taller than the box suggests and
        // sits 5% of the box to the right.
        let truths = boxes
            .iter()
            .map(|b| align_mean(&triangle(), b, 1.2, 1.1, 0.05, 0.0))
            .collect();
        (truths, boxes)
    }

    #[test]
    fn test_gaussian_estimate() {
        let g = Gaussian::estimate(&[1.0, 3.0]);
        assert!((g.mu - 2.0).abs() < 1e-6);
        assert!((g.sigma - 1.0).abs() < 1e-6);
        assert_eq!(Gaussian::estimate(&[]), Gaussian::default());
    }

    #[test]
    fn test_estimate_recovers_bias() {
        let (truths, boxes) = biased_data();
        let stats = AlignmentStatistics::estimate(&triangle(), &truths, &boxes).unwrap();
        assert!((stats.scale_x.mu - 1.2).abs() < 1e-4, "{:?}", stats.scale_x);
        assert!((stats.scale_y.mu - 1.1).abs() < 1e-4, "{:?}", stats.scale_y);
        assert!(stats.scale_x.sigma < 1e-4);
        // The triangle's centroid is off-origin in y, so only check x.
        assert!(stats.translation_x.mu > 0.0);
    }

    #[test]
    fn test_rescaled_mean_removes_bias() {
        let (truths, boxes) = biased_data();
        let mean = triangle();
        let stats = AlignmentStatistics::estimate(&mean, &truths, &boxes).unwrap();
        let corrected = stats.rescale_mean(&mean);
        let again = AlignmentStatistics::estimate(&corrected, &truths, &boxes).unwrap();
        assert!((again.scale_x.mu - 1.0).abs() < 1e-4, "{:?}", again.scale_x);
        assert!((again.scale_y.mu - 1.0).abs() < 1e-4, "{:?}", again.scale_y);
        assert!(again.translation_x.mu.abs() < 1e-4, "{:?}", again.translation_x);
        assert!(again.translation_y.mu.abs() < 1e-4, "{:?}", again.translation_y);
    }

    #[test]
    fn test_estimate_errors() {
        let (truths, boxes) = biased_data();
        assert_eq!(
            AlignmentStatistics::estimate(&triangle(), &truths, &boxes[..2]),
            Err(AlignmentError::BoxCount { shapes: 3, boxes: 2 })
        );
        let flat = Shape::zeros(6);
        assert_eq!(
            AlignmentStatistics::estimate(&flat, &truths, &boxes),
            Err(AlignmentError::ZeroExtent { index: 0, axis: 'x' })
        );
    }
}
