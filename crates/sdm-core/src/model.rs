//! Trained SDM landmark model: persistence and fitting.
//!
//! A model is immutable once built. Fitting takes the model by shared
//! reference plus per-call state (image, face box or initial shape), so one
//! loaded model can serve any number of frames or threads.
//!
//! Text format:
//!
//! ```text
//! # <comment>
//! numLandmarks <N>
//! <landmarkId_1>                  (N lines)
//! <meanShape value>               (2N lines: all x, then all y)
//! numCascadeSteps <K>
//! cascadeStep <k> rows <R> cols <C>
//! descriptorType <name>
//! descriptorPostprocessing none
//! descriptorParameters <tokens>
//! <R lines of C space-separated floats>
//! ...                             (repeated per cascade step)
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use image::GrayImage;
use nalgebra::{DMatrix, RowDVector};
use thiserror::Error;

use crate::alignment::align_rigid;
use crate::descriptor::{checked_descriptors, DescriptorError, DescriptorExtractor, DescriptorRegistry};
use crate::types::{num_landmarks, shape_to_points, BoundingBox, Point, Shape};

const POSTPROCESSING_NONE: &str = "none";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("unexpected end of model file, expected {0}")]
    UnexpectedEof(String),
    #[error("invalid model: {0}")]
    Invalid(String),
    #[error("shape has {actual} values, model expects {expected}")]
    ShapeLength { expected: usize, actual: usize },
    #[error("cascade step {step}: {source}")]
    Descriptor {
        step: usize,
        #[source]
        source: DescriptorError,
    },
}

/// Flattened descriptors at every landmark of `shape`, followed by a bias `1`.
pub(crate) fn cascade_features(
    extractor: &dyn DescriptorExtractor,
    image: &GrayImage,
    shape: &Shape,
) -> Result<RowDVector<f32>, DescriptorError> {
    let keypoints: Vec<Point> = shape_to_points(shape);
    let descriptors = checked_descriptors(extractor, image, &keypoints)?;
    let dim = descriptors.ncols();
    let mut row = RowDVector::<f32>::zeros(keypoints.len() * dim + 1);
    for (i, d) in descriptors.row_iter().enumerate() {
        row.columns_mut(i * dim, dim).copy_from(&d);
    }
    row[keypoints.len() * dim] = 1.0;
    Ok(row)
}

/// Checks that `id` survives a save/load cycle: one line, non-empty, no
/// surrounding whitespace and not read back as a comment.
pub(crate) fn check_landmark_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("landmark identifier is empty".into());
    }
    if id.trim() != id {
        return Err(format!("landmark identifier {id:?} has surrounding whitespace"));
    }
    if id.starts_with('#') {
        return Err(format!("landmark identifier {id:?} starts with '#'"));
    }
    if id.contains(['\n', '\r']) {
        return Err(format!("landmark identifier {id:?} spans several lines"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SdmLandmarkModel {
    mean_shape: Shape,
    landmark_ids: Vec<String>,
    regressors: Vec<DMatrix<f32>>,
    descriptors: Vec<Arc<dyn DescriptorExtractor>>,
}

impl SdmLandmarkModel {
    /// Assemble a model, checking that the pieces agree with each other.
    pub fn new(
        mean_shape: Shape,
        landmark_ids: Vec<String>,
        regressors: Vec<DMatrix<f32>>,
        descriptors: Vec<Arc<dyn DescriptorExtractor>>,
    ) -> Result<Self, ModelError> {
        if mean_shape.len() % 2 != 0 {
            return Err(ModelError::Invalid(format!(
                "mean shape has odd length {}",
                mean_shape.len()
            )));
        }
        let n = num_landmarks(&mean_shape);
        if landmark_ids.len() != n {
            return Err(ModelError::Invalid(format!(
                "{} landmark identifiers for {n} landmarks",
                landmark_ids.len()
            )));
        }
        for id in &landmark_ids {
            check_landmark_id(id).map_err(ModelError::Invalid)?;
        }
        if regressors.len() != descriptors.len() {
            return Err(ModelError::Invalid(format!(
                "{} regressors but {} descriptor extractors",
                regressors.len(),
                descriptors.len()
            )));
        }
        for (step, (r, d)) in regressors.iter().zip(&descriptors).enumerate() {
            if r.ncols() != 2 * n {
                return Err(ModelError::Invalid(format!(
                    "cascade step {step}: regressor has {} columns, expected {}",
                    r.ncols(),
                    2 * n
                )));
            }
            let rows = n * d.descriptor_dim() + 1;
            if r.nrows() != rows {
                return Err(ModelError::Invalid(format!(
                    "cascade step {step}: regressor has {} rows, {} descriptors need {rows}",
                    r.nrows(),
                    d.descriptor_type()
                )));
            }
        }
        Ok(Self {
            mean_shape,
            landmark_ids,
            regressors,
            descriptors,
        })
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmark_ids.len()
    }

    pub fn num_cascade_steps(&self) -> usize {
        self.regressors.len()
    }

    pub fn landmark_ids(&self) -> &[String] {
        &self.landmark_ids
    }

    /// Mean shape in model space, `[x1..xN, y1..yN]`.
    pub fn mean_shape(&self) -> &Shape {
        &self.mean_shape
    }

    pub fn regressor(&self, step: usize) -> Option<&DMatrix<f32>> {
        self.regressors.get(step)
    }

    pub fn descriptor(&self, step: usize) -> Option<&Arc<dyn DescriptorExtractor>> {
        self.descriptors.get(step)
    }

    /// Position of landmark `id` in a fitted `shape`.
    pub fn landmark(&self, shape: &Shape, id: &str) -> Option<Point> {
        let n = self.num_landmarks();
        if shape.len() != 2 * n {
            return None;
        }
        let i = self.landmark_ids.iter().position(|l| l == id)?;
        Some(Point::new(shape[i], shape[i + n]))
    }

    /// Mean shape placed rigidly in `face_box`; the starting point for
    /// [`Self::optimize`].
    pub fn align_rigid(&self, face_box: &BoundingBox) -> Shape {
        align_rigid(&self.mean_shape, face_box)
    }

    /// Refine `shape` by running every cascade step once.
    pub fn optimize(&self, shape: &Shape, image: &GrayImage) -> Result<Shape, ModelError> {
        if shape.len() != self.mean_shape.len() {
            return Err(ModelError::ShapeLength {
                expected: self.mean_shape.len(),
                actual: shape.len(),
            });
        }
        let mut current = shape.clone();
        for (step, (regressor, extractor)) in self.regressors.iter().zip(&self.descriptors).enumerate() {
            let features = cascade_features(extractor.as_ref(), image, &current)
                .map_err(|source| ModelError::Descriptor { step, source })?;
            current += features * regressor;
        }
        Ok(current)
    }

    /// [`Self::align_rigid`] followed by [`Self::optimize`].
    pub fn fit(&self, image: &GrayImage, face_box: &BoundingBox) -> Result<Shape, ModelError> {
        self.optimize(&self.align_rigid(face_box), image)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P, registry: &DescriptorRegistry) -> Result<Self, ModelError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), registry)
    }

    /// Write the text format. Floats use Rust's shortest round-trip
    /// representation, so a reload reproduces every value bit for bit.
    pub fn to_writer<W: Write>(&self, w: &mut W) -> Result<(), ModelError> {
        writeln!(w, "# SDM landmark model")?;
        writeln!(w, "numLandmarks {}", self.num_landmarks())?;
        for id in &self.landmark_ids {
            writeln!(w, "{id}")?;
        }
        for v in self.mean_shape.iter() {
            writeln!(w, "{v}")?;
        }
        writeln!(w, "numCascadeSteps {}", self.num_cascade_steps())?;
        for (step, (r, d)) in self.regressors.iter().zip(&self.descriptors).enumerate() {
            writeln!(w, "cascadeStep {step} rows {} cols {}", r.nrows(), r.ncols())?;
            writeln!(w, "descriptorType {}", d.descriptor_type())?;
            writeln!(w, "descriptorPostprocessing {POSTPROCESSING_NONE}")?;
            writeln!(w, "descriptorParameters {}", d.parameter_string())?;
            for row in r.row_iter() {
                let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                writeln!(w, "{}", line.join(" "))?;
            }
        }
        Ok(())
    }

    pub fn from_reader<R: BufRead>(reader: R, registry: &DescriptorRegistry) -> Result<Self, ModelError> {
        let lines = reader.lines().collect::<Result<Vec<_>, _>>()?;
        let mut p = LineParser::new(&lines);

        // Counts come from the file, so nothing is reserved up front and every
        // product is checked.
        let (line, n): (usize, usize) = p.keyed("numLandmarks")?;
        let param_dim = n.checked_mul(2).ok_or_else(|| ModelError::Parse {
            line,
            message: format!("numLandmarks {n} is too large"),
        })?;
        let mut landmark_ids = Vec::new();
        for _ in 0..n {
            let (_, id) = p.next("landmark identifier")?;
            landmark_ids.push(id.to_string());
        }
        let mut mean = Vec::new();
        for _ in 0..param_dim {
            mean.push(p.value::<f32>("mean shape value")?);
        }
        let mean_shape = RowDVector::from_vec(mean);

        let (_, k): (usize, usize) = p.keyed("numCascadeSteps")?;
        let mut regressors = Vec::new();
        let mut descriptors = Vec::new();
        for step in 0..k {
            let (line, header) = p.next("cascadeStep header")?;
            let (rows, cols) = parse_step_header(line, header, step)?;
            if rows.checked_mul(cols).is_none() {
                return Err(ModelError::Parse {
                    line,
                    message: format!("regressor of {rows}x{cols} values is too large"),
                });
            }

            let (line, descriptor_type) = p.keyed_str("descriptorType")?;
            let descriptor_type = descriptor_type.to_string();
            let (post_line, post) = p.keyed_str("descriptorPostprocessing")?;
            if post != POSTPROCESSING_NONE {
                return Err(ModelError::Parse {
                    line: post_line,
                    message: format!("unsupported descriptor postprocessing {post:?}"),
                });
            }
            let (_, params) = p.keyed_str("descriptorParameters")?;
            let extractor = registry
                .create(&descriptor_type, params)
                .map_err(|e| ModelError::Parse {
                    line,
                    message: e.to_string(),
                })?;

            let mut data = Vec::new();
            for _ in 0..rows {
                let (line, text) = p.next("regressor row")?;
                let before = data.len();
                for token in text.split_whitespace() {
                    data.push(token.parse::<f32>().map_err(|_| ModelError::Parse {
                        line,
                        message: format!("bad float {token:?}"),
                    })?);
                }
                if data.len() - before != cols {
                    return Err(ModelError::Parse {
                        line,
                        message: format!("expected {cols} values, found {}", data.len() - before),
                    });
                }
            }
            regressors.push(DMatrix::from_row_slice(rows, cols, &data));
            descriptors.push(extractor);
        }

        if let Some((line, extra)) = p.next_opt() {
            return Err(ModelError::Parse {
                line,
                message: format!("trailing content {extra:?}"),
            });
        }

        let model = Self::new(mean_shape, landmark_ids, regressors, descriptors)?;
        tracing::debug!(
            landmarks = model.num_landmarks(),
            steps = model.num_cascade_steps(),
            "loaded SDM landmark model"
        );
        Ok(model)
    }
}

fn parse_step_header(line: usize, header: &str, step: usize) -> Result<(usize, usize), ModelError> {
    let bad = || ModelError::Parse {
        line,
        message: format!("expected \"cascadeStep {step} rows <R> cols <C>\", found {header:?}"),
    };
    let tokens: Vec<&str> = header.split_whitespace().collect();
    match tokens.as_slice() {
        ["cascadeStep", s, "rows", r, "cols", c] => {
            let s: usize = s.parse().map_err(|_| bad())?;
            if s != step {
                return Err(bad());
            }
            Ok((r.parse().map_err(|_| bad())?, c.parse().map_err(|_| bad())?))
        }
        _ => Err(bad()),
    }
}

/// Line cursor that skips blank and `#` comment lines and reports 1-based
/// line numbers.
struct LineParser<'a> {
    lines: &'a [String],
    pos: usize,
}

impl<'a> LineParser<'a> {
    fn new(lines: &'a [String]) -> Self {
        Self { lines, pos: 0 }
    }

    fn next_opt(&mut self) -> Option<(usize, &'a str)> {
        while self.pos < self.lines.len() {
            let line = self.lines[self.pos].trim();
            self.pos += 1;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            return Some((self.pos, line));
        }
        None
    }

    fn next(&mut self, what: &str) -> Result<(usize, &'a str), ModelError> {
        self.next_opt()
            .ok_or_else(|| ModelError::UnexpectedEof(what.to_string()))
    }

    fn value<T: std::str::FromStr>(&mut self, what: &str) -> Result<T, ModelError> {
        let (line, text) = self.next(what)?;
        text.parse().map_err(|_| ModelError::Parse {
            line,
            message: format!("bad {what}: {text:?}"),
        })
    }

    /// `<key> <rest of line>`; the rest may be empty.
    fn keyed_str(&mut self, key: &str) -> Result<(usize, &'a str), ModelError> {
        let (line, text) = self.next(key)?;
        let rest = text
            .strip_prefix(key)
            .filter(|r| r.is_empty() || r.starts_with(char::is_whitespace))
            .ok_or_else(|| ModelError::Parse {
                line,
                message: format!("expected {key}, found {text:?}"),
            })?;
        Ok((line, rest.trim()))
    }

    /// `<key> <value>`, returning the line number with the parsed value.
    fn keyed<T: std::str::FromStr>(&mut self, key: &str) -> Result<(usize, T), ModelError> {
        let (line, rest) = self.keyed_str(key)?;
        let value = rest.parse().map_err(|_| ModelError::Parse {
            line,
            message: format!("bad value for {key}: {rest:?}"),
        })?;
        Ok((line, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PatchDescriptor;
    use crate::types::{shape_from_points, Point};

    fn mean() -> Shape {
        shape_from_points(&[Point::new(-0.2, -0.1), Point::new(0.2, -0.1), Point::new(0.0, 0.2)])
    }

    fn ids() -> Vec<String> {
        vec!["left_eye".into(), "right_eye".into(), "mouth".into()]
    }

    fn small_model() -> SdmLandmarkModel {
        let d: Arc<dyn DescriptorExtractor> = Arc::new(PatchDescriptor::new(2, 1.0));
        let rows = 3 * 4 + 1;
        let r0 = DMatrix::from_fn(rows, 6, |i, j| (i as f32 - j as f32) * 0.01 + 1.0 / 3.0);
        let r1 = DMatrix::from_fn(rows, 6, |i, j| ((i * 7 + j) % 5) as f32 * -0.125);
        SdmLandmarkModel::new(mean(), ids(), vec![r0, r1], vec![d.clone(), d]).unwrap()
    }

    fn roundtrip(model: &SdmLandmarkModel) -> SdmLandmarkModel {
        let mut buf = Vec::new();
        model.to_writer(&mut buf).unwrap();
        SdmLandmarkModel::from_reader(buf.as_slice(), &DescriptorRegistry::default()).unwrap()
    }

    #[test]
    fn test_text_roundtrip_is_exact() {
        let model = small_model();
        let loaded = roundtrip(&model);
        assert_eq!(loaded.mean_shape(), model.mean_shape());
        assert_eq!(loaded.landmark_ids(), model.landmark_ids());
        assert_eq!(loaded.num_cascade_steps(), 2);
        for k in 0..2 {
            assert_eq!(loaded.regressor(k), model.regressor(k));
            let (a, b) = (loaded.descriptor(k).unwrap(), model.descriptor(k).unwrap());
            assert_eq!(a.descriptor_type(), b.descriptor_type());
            assert_eq!(a.parameter_string(), b.parameter_string());
        }
    }

    #[test]
    fn test_invariants_enforced() {
        let d: Arc<dyn DescriptorExtractor> = Arc::new(PatchDescriptor::new(2, 1.0));
        let bad_cols = DMatrix::zeros(13, 4);
        assert!(matches!(
            SdmLandmarkModel::new(mean(), ids(), vec![bad_cols], vec![d.clone()]),
            Err(ModelError::Invalid(_))
        ));
        assert!(matches!(
            SdmLandmarkModel::new(mean(), ids(), vec![], vec![d.clone()]),
            Err(ModelError::Invalid(_))
        ));
        assert!(matches!(
            SdmLandmarkModel::new(mean(), vec!["a".into()], vec![], vec![]),
            Err(ModelError::Invalid(_))
        ));
        let bad_rows = DMatrix::zeros(12, 6);
        assert!(matches!(
            SdmLandmarkModel::new(mean(), ids(), vec![bad_rows], vec![d]),
            Err(ModelError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_descriptor_type_fails_at_load() {
        let mut buf = Vec::new();
        small_model().to_writer(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap().replace("descriptorType patch", "descriptorType vlhog-dt");
        let err = SdmLandmarkModel::from_reader(text.as_bytes(), &DescriptorRegistry::default()).unwrap_err();
        match err {
            ModelError::Parse { message, .. } => assert!(message.contains("vlhog-dt"), "{message}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_truncated_file_fails() {
        let mut buf = Vec::new();
        small_model().to_writer(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let truncated: String = text.lines().take(20).collect::<Vec<_>>().join("\n");
        assert!(matches!(
            SdmLandmarkModel::from_reader(truncated.as_bytes(), &DescriptorRegistry::default()),
            Err(ModelError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn test_malformed_header_reports_line() {
        let text = "# comment\nnumLandmarks two\n";
        match SdmLandmarkModel::from_reader(text.as_bytes(), &DescriptorRegistry::default()) {
            Err(ModelError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_huge_landmark_count_is_an_error() {
        let text = "numLandmarks 18446744073709551615\n";
        match SdmLandmarkModel::from_reader(text.as_bytes(), &DescriptorRegistry::default()) {
            Err(ModelError::Parse { line, .. }) => assert_eq!(line, 1),
            other => panic!("unexpected result: {other:?}"),
        }

        // Fits in `2 * n` but the file ends long before that many lines.
        let text = "numLandmarks 4611686018427387903\nleft_eye\n";
        assert!(matches!(
            SdmLandmarkModel::from_reader(text.as_bytes(), &DescriptorRegistry::default()),
            Err(ModelError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn test_huge_regressor_header_is_an_error() {
        let mut text = String::from("numLandmarks 1\nnose\n0.5\n0.5\nnumCascadeSteps 1\n");
        text.push_str("cascadeStep 0 rows 4294967296 cols 4294967296\n");
        match SdmLandmarkModel::from_reader(text.as_bytes(), &DescriptorRegistry::default()) {
            Err(ModelError::Parse { line, message }) => {
                assert_eq!(line, 6);
                assert!(message.contains("too large"), "{message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let text = "numLandmarks 1\nnose\n0.5\n0.5\nnumCascadeSteps 18446744073709551615\n";
        assert!(matches!(
            SdmLandmarkModel::from_reader(text.as_bytes(), &DescriptorRegistry::default()),
            Err(ModelError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn test_unsavable_landmark_ids_rejected() {
        for bad in ["# chin", "", " left", "right ", "two\nlines"] {
            let ids = vec![bad.to_string(), "nose".into(), "mouth".into()];
            assert!(
                matches!(
                    SdmLandmarkModel::new(mean(), ids, vec![], vec![]),
                    Err(ModelError::Invalid(_))
                ),
                "accepted {bad:?}"
            );
        }
        let ids = vec!["left eye".to_string(), "nose#1".into(), "mouth".into()];
        let model = SdmLandmarkModel::new(mean(), ids, vec![], vec![]).unwrap();
        assert_eq!(roundtrip(&model).landmark_ids(), model.landmark_ids());
    }

    #[test]
    fn test_zero_steps_keeps_initial_shape() {
        let model = SdmLandmarkModel::new(mean(), ids(), vec![], vec![]).unwrap();
        let image = GrayImage::new(32, 32);
        let face_box = BoundingBox::new(4.0, 4.0, 20.0, 20.0);
        let fitted = model.fit(&image, &face_box).unwrap();
        assert_eq!(fitted, model.align_rigid(&face_box));
        assert_eq!(roundtrip(&model).num_cascade_steps(), 0);
    }

    #[test]
    fn test_optimize_rejects_wrong_shape_length() {
        let model = small_model();
        let image = GrayImage::new(32, 32);
        assert!(matches!(
            model.optimize(&Shape::zeros(4), &image),
            Err(ModelError::ShapeLength { expected: 6, actual: 4 })
        ));
    }

    #[test]
    fn test_landmark_lookup() {
        let model = small_model();
        let shape = model.align_rigid(&BoundingBox::new(0.0, 0.0, 100.0, 100.0));
        let mouth = model.landmark(&shape, "mouth").unwrap();
        assert!((mouth.x - 50.0).abs() < 1e-4);
        assert!((mouth.y - 70.0).abs() < 1e-4);
        assert!(model.landmark(&shape, "nose").is_none());
    }

    #[test]
    fn test_cascade_features_layout() {
        let image = GrayImage::from_fn(32, 32, |x, y| image::Luma([(x * 3 + y) as u8]));
        let d = PatchDescriptor::new(2, 1.0);
        let shape = shape_from_points(&[Point::new(10.0, 10.0), Point::new(20.0, 12.0)]);
        let row = cascade_features(&d, &image, &shape).unwrap();
        assert_eq!(row.len(), 2 * 4 + 1);
        assert_eq!(row[8], 1.0);
        let direct = d.descriptors(&image, &shape_to_points(&shape)).unwrap();
        assert_eq!(row[5], direct[(1, 1)]);
    }
}
