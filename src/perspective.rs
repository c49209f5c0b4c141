use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use nalgebra::Matrix3;
use tracing::debug;

use crate::error::{Result, TrayError};
use crate::geometry::{
    compute_output_bounds, perspective_matrix, shift_matrix, transform_point, AspectRatio, Point,
    Quad,
};

/// Default horizontal inset of the destination rectangle, in pixels
pub const DEFAULT_MARGIN_X: f64 = 320.0;

/// Convert a homogeneous matrix into an `imageproc` projection
pub(crate) fn to_projection(matrix: &Matrix3<f64>) -> Option<Projection> {
    let mut coeffs = [0.0_f32; 9];
    for row in 0..3 {
        for col in 0..3 {
            coeffs[row * 3 + col] = matrix[(row, col)] as f32;
        }
    }
    Projection::from_matrix(coeffs)
}

/// Vertical inset that gives the destination rectangle the reference aspect ratio
fn margin_y(width: u32, height: u32, aspect: f64, margin_x: f64) -> f64 {
    let dy = margin_x / aspect + (height as f64 - width as f64 / aspect) / 2.0;
    dy.round_ties_even()
}

/// Destination rectangle inset by `(dx, dy)`, in [`Quad`] order
fn destination_quad(width: u32, height: u32, dx: f64, dy: f64) -> Quad {
    let (w, h) = (width as f64, height as f64);
    [
        Point::new(dx, dy),
        Point::new(dx, h - dy),
        Point::new(w - dx, h - dy),
        Point::new(w - dx, dy),
    ]
}

/// Rectifies photos from a fixed camera so the photographed rectangle
/// becomes axis-aligned with its real aspect ratio.
///
/// The matrix is computed once from the calibration corners and then reused
/// for every image; the whole source image stays on the output canvas.
#[derive(Debug, Clone)]
pub struct PerspectiveTransformer {
    matrix: Matrix3<f64>,
    projection: Projection,
    destination: Quad,
    width: u32,
    height: u32,
}

impl PerspectiveTransformer {
    /// Build with the default 4:3 reference ratio and 320 px margin
    pub fn new(width: u32, height: u32, corners: Quad) -> Result<Self> {
        Self::with_reference(width, height, corners, AspectRatio::default(), DEFAULT_MARGIN_X)
    }

    /// Build from the camera image size and the observed corners
    /// (top-left, bottom-left, bottom-right, top-right).
    pub fn with_reference(
        width: u32,
        height: u32,
        corners: Quad,
        aspect: AspectRatio,
        margin_x: f64,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(TrayError::malformed(format!(
                "camera image has zero size: {}x{}",
                width, height
            )));
        }
        if !(aspect.width > 0.0 && aspect.height > 0.0) {
            return Err(TrayError::malformed(format!(
                "aspect ratio must be positive, got {}:{}",
                aspect.width, aspect.height
            )));
        }

        let dy = margin_y(width, height, aspect.value(), margin_x);
        let destination = destination_quad(width, height, margin_x, dy);
        let raw = perspective_matrix(&corners, &destination)?;

        // Shift so that no part of the source image lands at negative coordinates
        let bounds = compute_output_bounds(&raw, width, height);
        let matrix = shift_matrix(&raw, bounds.min_x, bounds.min_y);

        let out_width = bounds.width().round_ties_even();
        let out_height = bounds.height().round_ties_even();
        if !(out_width >= 1.0 && out_height >= 1.0) {
            return Err(TrayError::DegenerateCalibration(format!(
                "output canvas collapses to {}x{}",
                out_width, out_height
            )));
        }

        let projection = to_projection(&matrix).ok_or_else(|| {
            TrayError::DegenerateCalibration("shifted matrix is not invertible".to_string())
        })?;

        debug!(
            dy,
            canvas_width = out_width,
            canvas_height = out_height,
            offset_x = bounds.min_x,
            offset_y = bounds.min_y,
            "built perspective transform"
        );

        Ok(Self {
            matrix,
            projection,
            destination: destination.map(|p| Point::new(p.x - bounds.min_x, p.y - bounds.min_y)),
            width: out_width as u32,
            height: out_height as u32,
        })
    }

    /// The translated source-to-canvas matrix
    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Output canvas size (width, height)
    pub fn canvas_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Where the calibration corners land on the output canvas
    pub fn destination(&self) -> &Quad {
        &self.destination
    }

    /// Map a source-image point onto the output canvas
    pub fn map_point(&self, p: Point) -> Point {
        transform_point(&self.matrix, p)
    }

    /// Warp `image` onto the output canvas; unmapped pixels get `fill`.
    pub fn transform(&self, image: &RgbImage, fill: Rgb<u8>) -> RgbImage {
        let mut output = RgbImage::new(self.width, self.height);
        warp_into(
            image,
            &self.projection,
            Interpolation::Bilinear,
            fill,
            &mut output,
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::geometry::image_corners;

    fn quad(pts: [(f64, f64); 4]) -> Quad {
        pts.map(Point::from)
    }

    #[test]
    fn test_margin_y_matches_aspect() {
        // 1600x1200 at 4:3 already has the right shape, so dy = dx * 3/4
        assert_relative_eq!(margin_y(1600, 1200, 4.0 / 3.0, 320.0), 240.0);
        assert_relative_eq!(margin_y(1600, 1600, 4.0 / 3.0, 320.0), 440.0);
    }

    #[test]
    fn test_own_corners_give_identity() {
        let transformer = PerspectiveTransformer::with_reference(
            800,
            600,
            image_corners(800, 600),
            AspectRatio::new(800.0, 600.0),
            0.0,
        )
        .unwrap();

        assert_relative_eq!(*transformer.matrix(), Matrix3::identity(), epsilon = 1e-9);
        assert_eq!(transformer.canvas_size(), (800, 600));
    }

    #[test]
    fn test_destination_corners_give_identity() {
        // Calibration already equal to the inset destination rectangle
        let corners = quad([
            (320.0, 240.0),
            (320.0, 960.0),
            (1280.0, 960.0),
            (1280.0, 240.0),
        ]);
        let transformer = PerspectiveTransformer::new(1600, 1200, corners).unwrap();

        assert_relative_eq!(*transformer.matrix(), Matrix3::identity(), epsilon = 1e-9);
        assert_eq!(transformer.canvas_size(), (1600, 1200));
    }

    #[test]
    fn test_square_tray_scenario() {
        let corners = quad([
            (100.0, 100.0),
            (100.0, 1500.0),
            (1500.0, 1500.0),
            (1500.0, 100.0),
        ]);
        let transformer = PerspectiveTransformer::new(1600, 1600, corners).unwrap();

        // dy = 440, destination spans 960x720; scale is 960/1400 by 720/1400
        let sx: f64 = 960.0 / 1400.0;
        let sy: f64 = 720.0 / 1400.0;
        let expected = ((1600.0 * sx).round() as u32, (1600.0 * sy).round() as u32);
        assert_eq!(transformer.canvas_size(), expected);
        assert_eq!(expected, (1097, 823));

        // Corner round-trip: calibration corners land on a 4:3 rectangle
        let mapped: Vec<Point> = corners.iter().map(|&p| transformer.map_point(p)).collect();
        for (m, d) in mapped.iter().zip(transformer.destination()) {
            assert_relative_eq!(m.x, d.x, epsilon = 1e-6);
            assert_relative_eq!(m.y, d.y, epsilon = 1e-6);
        }
        assert_relative_eq!(mapped[0].x, 100.0 * sx, epsilon = 1e-6);
        assert_relative_eq!(mapped[0].y, 100.0 * sy, epsilon = 1e-6);
        let w = mapped[3].x - mapped[0].x;
        let h = mapped[1].y - mapped[0].y;
        assert_relative_eq!(w / h, 4.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_canvas_never_clips() {
        let corners = quad([
            (300.0, 150.0),
            (120.0, 1100.0),
            (1500.0, 1150.0),
            (1250.0, 180.0),
        ]);
        let transformer = PerspectiveTransformer::new(1600, 1200, corners).unwrap();
        let (w, h) = transformer.canvas_size();

        for p in image_corners(1600, 1200) {
            let m = transformer.map_point(p);
            assert!(m.x >= -1e-6 && m.y >= -1e-6, "{:?} clipped", m);
            assert!(m.x <= w as f64 + 1.0 && m.y <= h as f64 + 1.0, "{:?} outside", m);
        }
    }

    #[test]
    fn test_degenerate_calibration() {
        let corners = quad([(0.0, 0.0), (0.0, 0.0), (10.0, 10.0), (10.0, 0.0)]);
        let err = PerspectiveTransformer::new(100, 100, corners).unwrap_err();
        assert!(matches!(err, TrayError::DegenerateCalibration(_)));
    }

    #[test]
    fn test_transform_identity_preserves_content() {
        let mut img = RgbImage::from_pixel(40, 30, Rgb([10, 20, 30]));
        for y in 5..15 {
            for x in 8..20 {
                img.put_pixel(x, y, Rgb([200, 100, 50]));
            }
        }
        let transformer = PerspectiveTransformer::with_reference(
            40,
            30,
            image_corners(40, 30),
            AspectRatio::new(40.0, 30.0),
            0.0,
        )
        .unwrap();

        let out = transformer.transform(&img, Rgb([0, 0, 0]));
        assert_eq!(out.dimensions(), (40, 30));
        assert_eq!(*out.get_pixel(12, 10), Rgb([200, 100, 50]));
        assert_eq!(*out.get_pixel(30, 25), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_transform_fills_unmapped_pixels() {
        let corners = quad([(50.0, 40.0), (30.0, 160.0), (170.0, 160.0), (150.0, 40.0)]);
        let transformer = PerspectiveTransformer::with_reference(
            200,
            200,
            corners,
            AspectRatio::default(),
            40.0,
        )
        .unwrap();
        let img = RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]));
        let fill = Rgb([7, 8, 9]);

        let out = transformer.transform(&img, fill);
        let (w, h) = transformer.canvas_size();
        assert_eq!(out.dimensions(), (w, h));

        // The frame's top edge is stretched more than its bottom edge, so the
        // bottom corners of the canvas have no source pixel
        assert_eq!(*out.get_pixel(0, h - 1), fill);
        assert_eq!(*out.get_pixel(w - 1, h - 1), fill);
        let center = transformer.map_point(Point::new(100.0, 100.0));
        let px = out.get_pixel(center.x as u32, center.y as u32);
        assert!(px.0.iter().all(|&c| c >= 250), "{:?}", px);
    }

    #[test]
    fn test_transformer_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PerspectiveTransformer>();
    }
}
