use nalgebra::RowDVector;
use serde::{Deserialize, Serialize};

/// A 2D image location in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Face bounding box as returned by a face detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A box is usable for alignment only if it has positive, finite extent.
    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }
}

/// A landmark shape stored as a flattened row vector `[x1..xN, y1..yN]`.
///
/// This is the parameter-vector layout used throughout training and fitting:
/// all x coordinates first, then all y coordinates.
pub type Shape = RowDVector<f32>;

/// Number of landmarks in a flattened shape.
pub fn num_landmarks(shape: &Shape) -> usize {
    shape.len() / 2
}

/// Build a flattened shape from a list of points.
pub fn shape_from_points(points: &[Point]) -> Shape {
    let n = points.len();
    RowDVector::from_fn(2 * n, |_, c| {
        if c < n {
            points[c].x
        } else {
            points[c - n].y
        }
    })
}

/// Split a flattened shape into points.
pub fn shape_to_points(shape: &Shape) -> Vec<Point> {
    let n = num_landmarks(shape);
    (0..n).map(|i| Point::new(shape[i], shape[i + n])).collect()
}

/// Mean x and y coordinate of a shape.
pub fn centroid(shape: &Shape) -> (f32, f32) {
    let n = num_landmarks(shape);
    if n == 0 {
        return (0.0, 0.0);
    }
    let sx: f32 = shape.columns(0, n).iter().sum();
    let sy: f32 = shape.columns(n, n).iter().sum();
    (sx / n as f32, sy / n as f32)
}

/// Width and height of the axis-aligned hull of a shape.
pub fn extent(shape: &Shape) -> (f32, f32) {
    let n = num_landmarks(shape);
    if n == 0 {
        return (0.0, 0.0);
    }
    let xs = shape.columns(0, n);
    let ys = shape.columns(n, n);
    (xs.max() - xs.min(), ys.max() - ys.min())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_layout_is_x_then_y() {
        let pts = [Point::new(1.0, 10.0), Point::new(2.0, 20.0), Point::new(3.0, 30.0)];
        let shape = shape_from_points(&pts);
        assert_eq!(shape.len(), 6);
        assert_eq!(shape[0], 1.0);
        assert_eq!(shape[2], 3.0);
        assert_eq!(shape[3], 10.0);
        assert_eq!(shape[5], 30.0);
        assert_eq!(shape_to_points(&shape), pts.to_vec());
    }

    #[test]
    fn test_centroid_and_extent() {
        let shape = shape_from_points(&[
            Point::new(0.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(4.0, 2.0),
            Point::new(0.0, 2.0),
        ]);
        let (cx, cy) = centroid(&shape);
        assert!((cx - 2.0).abs() < 1e-6);
        assert!((cy - 1.0).abs() < 1e-6);
        assert_eq!(extent(&shape), (4.0, 2.0));
    }

    #[test]
    fn test_empty_shape() {
        let shape = Shape::zeros(0);
        assert_eq!(centroid(&shape), (0.0, 0.0));
        assert_eq!(extent(&shape), (0.0, 0.0));
    }

    #[test]
    fn test_bounding_box_validity() {
        assert!(BoundingBox::new(0.0, 0.0, 10.0, 10.0).is_valid());
        assert!(!BoundingBox::new(0.0, 0.0, 0.0, 10.0).is_valid());
        assert!(!BoundingBox::new(0.0, 0.0, f32::NAN, 10.0).is_valid());
    }
}
