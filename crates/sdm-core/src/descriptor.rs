//! Local feature descriptors evaluated at landmark locations.
//!
//! Extractors are selected by a type string when a model is loaded. The
//! [`DescriptorRegistry`] maps each string to a factory; an unknown string is
//! an error, never a silent fallback. HOG or SIFT backends live outside this
//! crate and are plugged in with [`DescriptorRegistry::register`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use image::GrayImage;
use nalgebra::DMatrix;
use thiserror::Error;

use crate::types::Point;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("unknown descriptor type: {0}")]
    UnknownType(String),
    #[error("invalid parameters for {descriptor}: {reason}")]
    InvalidParameters { descriptor: String, reason: String },
    #[error("{descriptor} returned a {rows}×{cols} matrix for {keypoints} keypoints, expected {keypoints}×{dim}")]
    OutputShape {
        descriptor: String,
        keypoints: usize,
        dim: usize,
        rows: usize,
        cols: usize,
    },
    #[error("descriptor extraction failed: {0}")]
    Extraction(String),
}

/// Computes one descriptor row per keypoint.
pub trait DescriptorExtractor: Send + Sync + fmt::Debug {
    /// Type string written to and matched from the model file.
    fn descriptor_type(&self) -> &str;

    /// Parameter tokens written to the model file; must be accepted by the
    /// registry factory for [`Self::descriptor_type`].
    fn parameter_string(&self) -> String;

    /// Length of each descriptor row.
    fn descriptor_dim(&self) -> usize;

    /// `keypoints.len() × descriptor_dim()` matrix.
    fn descriptors(&self, image: &GrayImage, keypoints: &[Point]) -> Result<DMatrix<f32>, DescriptorError>;
}

/// Run `extractor` and check the output has the promised shape.
pub fn checked_descriptors(
    extractor: &dyn DescriptorExtractor,
    image: &GrayImage,
    keypoints: &[Point],
) -> Result<DMatrix<f32>, DescriptorError> {
    let out = extractor.descriptors(image, keypoints)?;
    let dim = extractor.descriptor_dim();
    if out.nrows() != keypoints.len() || out.ncols() != dim {
        return Err(DescriptorError::OutputShape {
            descriptor: extractor.descriptor_type().to_string(),
            keypoints: keypoints.len(),
            dim,
            rows: out.nrows(),
            cols: out.ncols(),
        });
    }
    Ok(out)
}

pub type ExtractorFactory =
    Box<dyn Fn(&str) -> Result<Arc<dyn DescriptorExtractor>, DescriptorError> + Send + Sync>;

/// Factory lookup keyed by descriptor type string.
pub struct DescriptorRegistry {
    factories: BTreeMap<String, ExtractorFactory>,
}

impl fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DescriptorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl DescriptorRegistry {
    /// Registry with no extractors at all.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the extractors implemented in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(PatchDescriptor::TYPE, |params| {
            Ok(Arc::new(PatchDescriptor::from_parameter_string(params)?) as Arc<dyn DescriptorExtractor>)
        });
        registry
    }

    /// Add or replace the factory for `descriptor_type`.
    pub fn register<F>(&mut self, descriptor_type: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn DescriptorExtractor>, DescriptorError> + Send + Sync + 'static,
    {
        self.factories.insert(descriptor_type.to_string(), Box::new(factory));
    }

    pub fn contains(&self, descriptor_type: &str) -> bool {
        self.factories.contains_key(descriptor_type)
    }

    pub fn create(
        &self,
        descriptor_type: &str,
        parameters: &str,
    ) -> Result<Arc<dyn DescriptorExtractor>, DescriptorError> {
        let factory = self
            .factories
            .get(descriptor_type)
            .ok_or_else(|| DescriptorError::UnknownType(descriptor_type.to_string()))?;
        factory(parameters)
    }
}

/// Square grid of bilinearly-sampled intensities around each keypoint,
/// normalised to zero mean and unit norm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchDescriptor {
    /// Samples per side; the descriptor has `patch_size²` entries.
    pub patch_size: usize,
    /// Distance between neighbouring samples, in pixels.
    pub spacing: f32,
}

impl Default for PatchDescriptor {
    fn default() -> Self {
        Self {
            patch_size: 5,
            spacing: 2.0,
        }
    }
}

impl PatchDescriptor {
    pub const TYPE: &'static str = "patch";

    pub fn new(patch_size: usize, spacing: f32) -> Self {
        Self { patch_size, spacing }
    }

    /// Parse `patchSize <n> spacing <s>`; omitted keys keep their defaults.
    pub fn from_parameter_string(params: &str) -> Result<Self, DescriptorError> {
        let invalid = |reason: String| DescriptorError::InvalidParameters {
            descriptor: Self::TYPE.to_string(),
            reason,
        };
        let mut out = Self::default();
        let mut tokens = params.split_whitespace();
        while let Some(key) = tokens.next() {
            let value = tokens
                .next()
                .ok_or_else(|| invalid(format!("missing value for {key}")))?;
            match key {
                "patchSize" => {
                    out.patch_size = value
                        .parse()
                        .map_err(|_| invalid(format!("bad patchSize {value:?}")))?;
                }
                "spacing" => {
                    out.spacing = value
                        .parse()
                        .map_err(|_| invalid(format!("bad spacing {value:?}")))?;
                }
                other => return Err(invalid(format!("unknown key {other:?}"))),
            }
        }
        if out.patch_size == 0 {
            return Err(invalid("patchSize must be positive".into()));
        }
        if !(out.spacing.is_finite() && out.spacing > 0.0) {
            return Err(invalid("spacing must be positive".into()));
        }
        Ok(out)
    }
}

/// Bilinear sample with clamp-to-edge addressing.
fn sample_bilinear(image: &GrayImage, x: f32, y: f32) -> f32 {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;
    let sx = x.clamp(0.0, max_x);
    let sy = y.clamp(0.0, max_y);

    let x0 = sx.floor() as u32;
    let y0 = sy.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let px = |x: u32, y: u32| image.get_pixel(x, y)[0] as f32;
    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x1, y0) * fx * (1.0 - fy)
        + px(x0, y1) * (1.0 - fx) * fy
        + px(x1, y1) * fx * fy
}

impl DescriptorExtractor for PatchDescriptor {
    fn descriptor_type(&self) -> &str {
        Self::TYPE
    }

    fn parameter_string(&self) -> String {
        format!("patchSize {} spacing {}", self.patch_size, self.spacing)
    }

    fn descriptor_dim(&self) -> usize {
        self.patch_size * self.patch_size
    }

    fn descriptors(&self, image: &GrayImage, keypoints: &[Point]) -> Result<DMatrix<f32>, DescriptorError> {
        let n = self.patch_size;
        let half = (n as f32 - 1.0) / 2.0;
        let mut out = DMatrix::<f32>::zeros(keypoints.len(), self.descriptor_dim());

        for (row, kp) in keypoints.iter().enumerate() {
            if !(kp.x.is_finite() && kp.y.is_finite()) {
                return Err(DescriptorError::Extraction(format!(
                    "keypoint {row} is not finite: {kp:?}"
                )));
            }
            for gy in 0..n {
                for gx in 0..n {
                    let x = kp.x + (gx as f32 - half) * self.spacing;
                    let y = kp.y + (gy as f32 - half) * self.spacing;
                    out[(row, gy * n + gx)] = sample_bilinear(image, x, y);
                }
            }

            let mut patch = out.row_mut(row);
            let mean = patch.mean();
            patch.add_scalar_mut(-mean);
            let norm = patch.norm();
            if norm > f32::EPSILON {
                patch /= norm;
            }
        }

        Ok(out)
    }
}
