use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrayError};

/// A point in image coordinates: `x` is the column, `y` is the row.
///
/// Raster indexing elsewhere (`get_pixel(x, y)`) uses the same order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Four corners in the fixed order top-left, bottom-left, bottom-right, top-right.
pub type Quad = [Point; 4];

/// Width:height ratio of the real-world rectangle being photographed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AspectRatio {
    pub width: f64,
    pub height: f64,
}

impl AspectRatio {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn value(&self) -> f64 {
        self.width / self.height
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::new(4.0, 3.0)
    }
}

/// Corners of a `width` x `height` raster, in [`Quad`] order
pub fn image_corners(width: u32, height: u32) -> Quad {
    let (w, h) = (width as f64, height as f64);
    [
        Point::new(0.0, 0.0),
        Point::new(0.0, h),
        Point::new(w, h),
        Point::new(w, 0.0),
    ]
}

/// Reject quadrilaterals where any three corners are (nearly) collinear.
fn check_non_degenerate(quad: &Quad) -> Result<()> {
    let extent = quad
        .iter()
        .flat_map(|p| [p.x.abs(), p.y.abs()])
        .fold(1.0_f64, f64::max);
    let eps = 1e-9 * extent * extent;

    for skip in 0..4 {
        let tri: Vec<&Point> = quad
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .map(|(_, p)| p)
            .collect();
        let cross = (tri[1].x - tri[0].x) * (tri[2].y - tri[0].y)
            - (tri[1].y - tri[0].y) * (tri[2].x - tri[0].x);
        if cross.abs() <= eps {
            return Err(TrayError::DegenerateCalibration(format!(
                "corners {:?} contain three collinear points",
                quad
            )));
        }
    }
    Ok(())
}

/// Solve for the 3x3 homography mapping each `src[i]` onto `dst[i]`.
///
/// Fixes `h33 = 1` and solves the resulting 8x8 linear system, so the
/// result is exact for four correspondences.
pub fn perspective_matrix(src: &Quad, dst: &Quad) -> Result<Matrix3<f64>> {
    check_non_degenerate(src)?;
    check_non_degenerate(dst)?;

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);
        let r = 2 * i;
        a.row_mut(r)
            .copy_from_slice(&[x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u]);
        a.row_mut(r + 1)
            .copy_from_slice(&[0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v]);
        b[r] = u;
        b[r + 1] = v;
    }

    let h = a.lu().solve(&b).ok_or_else(|| {
        TrayError::DegenerateCalibration("perspective system is singular".to_string())
    })?;

    let matrix = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
    if !matrix.iter().all(|v| v.is_finite()) || matrix.determinant().abs() < f64::EPSILON {
        return Err(TrayError::DegenerateCalibration(
            "perspective matrix is not invertible".to_string(),
        ));
    }
    Ok(matrix)
}

/// Transform a point using a homogeneous 3x3 matrix
pub fn transform_point(matrix: &Matrix3<f64>, p: Point) -> Point {
    let r = matrix * Vector3::new(p.x, p.y, 1.0);
    Point::new(r.x / r.z, r.y / r.z)
}

/// Axis-aligned bounding box of a point set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn of(points: &[Point]) -> Self {
        let min_x = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let max_x = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Where the four corners of a `width` x `height` image land under `matrix`
pub fn compute_output_bounds(matrix: &Matrix3<f64>, width: u32, height: u32) -> Bounds {
    let transformed: Vec<Point> = image_corners(width, height)
        .iter()
        .map(|&p| transform_point(matrix, p))
        .collect();
    Bounds::of(&transformed)
}

/// Left-compose a translation by `(-dx, -dy)` onto `matrix`.
pub fn shift_matrix(matrix: &Matrix3<f64>, dx: f64, dy: f64) -> Matrix3<f64> {
    #[rustfmt::skip]
    let translate = Matrix3::new(
        1.0, 0.0, -dx,
        0.0, 1.0, -dy,
        0.0, 0.0, 1.0,
    );
    let shifted = translate * matrix;
    shifted / shifted[(2, 2)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn quad(pts: [(f64, f64); 4]) -> Quad {
        pts.map(Point::from)
    }

    #[test]
    fn test_aspect_ratio_value() {
        assert_relative_eq!(AspectRatio::default().value(), 4.0 / 3.0);
    }

    #[test]
    fn test_identity_homography() {
        let q = quad([(10.0, 20.0), (15.0, 300.0), (400.0, 280.0), (390.0, 5.0)]);
        let h = perspective_matrix(&q, &q).unwrap();
        assert_relative_eq!(h, Matrix3::identity(), epsilon = 1e-9);
    }

    #[test]
    fn test_homography_maps_corners() {
        let src = quad([(120.0, 80.0), (90.0, 700.0), (980.0, 760.0), (900.0, 60.0)]);
        let dst = quad([(0.0, 0.0), (0.0, 600.0), (800.0, 600.0), (800.0, 0.0)]);
        let h = perspective_matrix(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(dst.iter()) {
            let p = transform_point(&h, *s);
            assert_relative_eq!(p.x, d.x, epsilon = 1e-6);
            assert_relative_eq!(p.y, d.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_collinear_corners_rejected() {
        let src = quad([(0.0, 0.0), (10.0, 10.0), (20.0, 20.0), (30.0, 5.0)]);
        let dst = quad([(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0)]);
        let err = perspective_matrix(&src, &dst).unwrap_err();
        assert!(matches!(err, TrayError::DegenerateCalibration(_)));
    }

    #[test]
    fn test_shift_moves_origin() {
        let h = Matrix3::new(2.0, 0.0, 5.0, 0.0, 3.0, -7.0, 0.0, 0.0, 1.0);
        let bounds = compute_output_bounds(&h, 10, 10);
        assert_relative_eq!(bounds.min_x, 5.0);
        assert_relative_eq!(bounds.min_y, -7.0);

        let shifted = shift_matrix(&h, bounds.min_x, bounds.min_y);
        let origin = transform_point(&shifted, Point::new(0.0, 0.0));
        assert_relative_eq!(origin.x, 0.0);
        assert_relative_eq!(origin.y, 0.0);
    }
}
