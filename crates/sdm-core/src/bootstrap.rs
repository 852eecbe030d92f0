//! Synthetic initial shapes for training-set augmentation.
//!
//! Perturbations follow the measured [`AlignmentStatistics`], so the extra
//! samples mimic how a real face detector misplaces the initial shape rather
//! than adding arbitrary noise.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::alignment::align_mean;
use crate::statistics::{AlignmentStatistics, Gaussian};
use crate::types::{BoundingBox, Shape};

fn draw<R: Rng + ?Sized>(rng: &mut R, g: &Gaussian) -> f32 {
    let z: f32 = rng.sample(StandardNormal);
    g.mu + g.sigma * z
}

/// Draws perturbed placements of a mean shape inside a face box.
#[derive(Debug, Clone)]
pub struct BootstrapSampler<'a> {
    mean: &'a Shape,
    statistics: AlignmentStatistics,
}

impl<'a> BootstrapSampler<'a> {
    pub fn new(mean: &'a Shape, statistics: AlignmentStatistics) -> Self {
        Self { mean, statistics }
    }

    /// One initial shape with scale and translation drawn from the statistics.
    pub fn perturbed_shape<R: Rng + ?Sized>(&self, face_box: &BoundingBox, rng: &mut R) -> Shape {
        let s = &self.statistics;
        let scale_x = draw(rng, &s.scale_x);
        let scale_y = draw(rng, &s.scale_y);
        let translation_x = draw(rng, &s.translation_x);
        let translation_y = draw(rng, &s.translation_y);
        align_mean(self.mean, face_box, scale_x, scale_y, translation_x, translation_y)
    }

    /// `count` independent perturbations for the same face box.
    pub fn perturbed_shapes<R: Rng + ?Sized>(
        &self,
        face_box: &BoundingBox,
        count: usize,
        rng: &mut R,
    ) -> Vec<Shape> {
        (0..count).map(|_| self.perturbed_shape(face_box, rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::align_rigid;
    use crate::types::{centroid, shape_from_points, Point};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn mean() -> Shape {
        shape_from_points(&[Point::new(-0.2, -0.2), Point::new(0.2, -0.1), Point::new(0.0, 0.25)])
    }

    #[test]
    fn test_unbiased_tight_statistics_reproduce_rigid_alignment() {
        let mean = mean();
        let stats = AlignmentStatistics {
            scale_x: Gaussian::new(1.0, 1e-6),
            scale_y: Gaussian::new(1.0, 1e-6),
            translation_x: Gaussian::new(0.0, 1e-6),
            translation_y: Gaussian::new(0.0, 1e-6),
        };
        let face_box = BoundingBox::new(40.0, 60.0, 120.0, 140.0);
        let sampler = BootstrapSampler::new(&mean, stats);
        let mut rng = StdRng::seed_from_u64(7);
        let expected = align_rigid(&mean, &face_box);
        for shape in sampler.perturbed_shapes(&face_box, 20, &mut rng) {
            for (a, b) in shape.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-2, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_samples_follow_translation_statistics() {
        let mean = mean();
        let stats = AlignmentStatistics {
            translation_x: Gaussian::new(0.1, 0.05),
            ..AlignmentStatistics::default()
        };
        let face_box = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let sampler = BootstrapSampler::new(&mean, stats);
        let mut rng = StdRng::seed_from_u64(42);
        let rigid_cx = centroid(&align_rigid(&mean, &face_box)).0;

        let shifts: Vec<f32> = sampler
            .perturbed_shapes(&face_box, 2000, &mut rng)
            .iter()
            .map(|s| (centroid(s).0 - rigid_cx) / face_box.width)
            .collect();
        let g = Gaussian::estimate(&shifts);
        assert!((g.mu - 0.1).abs() < 0.01, "mu = {}", g.mu);
        assert!((g.sigma - 0.05).abs() < 0.01, "sigma = {}", g.sigma);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let mean = mean();
        let stats = AlignmentStatistics {
            scale_x: Gaussian::new(1.0, 0.1),
            ..AlignmentStatistics::default()
        };
        let face_box = BoundingBox::new(0.0, 0.0, 50.0, 50.0);
        let sampler = BootstrapSampler::new(&mean, stats);
        let a = sampler.perturbed_shapes(&face_box, 3, &mut StdRng::seed_from_u64(1));
        let b = sampler.perturbed_shapes(&face_box, 3, &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
    }
}
