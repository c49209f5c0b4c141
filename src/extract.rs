use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::otsu_level;
use imageproc::filter::median_filter;
use imageproc::geometric_transformations::{warp_into, Interpolation};
use imageproc::geometry::convex_hull;
use imageproc::point::Point as PixelPoint;
use nalgebra::Matrix3;
use tracing::debug;

use crate::error::{Result, TrayError};
use crate::geometry::Point;
use crate::perspective::to_projection;

/// Default median blur kernel used on tray photos
pub const DEFAULT_BLUR_KERNEL: u32 = 21;

/// Minimum-area bounding rectangle of a contour.
///
/// `angle` is in degrees in `[-90, 0)`, measured from the +x axis (y pointing
/// down) to the side reported as `width`. An axis-aligned rectangle therefore
/// reports `-90` with `width` equal to its vertical extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect {
    pub center: Point,
    pub width: u32,
    pub height: u32,
    pub angle: f64,
}

impl RotatedRect {
    /// Corner points, starting from the one at `center - w/2 * u - h/2 * v`
    pub fn corners(&self) -> [Point; 4] {
        let (sin, cos) = self.angle.to_radians().sin_cos();
        let (hw, hh) = (self.width as f64 / 2.0, self.height as f64 / 2.0);
        let u = (cos * hw, sin * hw);
        let v = (-sin * hh, cos * hh);
        let c = self.center;
        [
            Point::new(c.x - u.0 - v.0, c.y - u.1 - v.1),
            Point::new(c.x + u.0 - v.0, c.y + u.1 - v.1),
            Point::new(c.x + u.0 + v.0, c.y + u.1 + v.1),
            Point::new(c.x - u.0 + v.0, c.y - u.1 + v.1),
        ]
    }
}

/// How the dominant contour is chosen among the external contours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContourSelection {
    /// Largest enclosed area
    #[default]
    LargestArea,
    /// Most boundary points. Legacy heuristic: it prefers long jagged
    /// outlines over large smooth ones and is kept only for comparison.
    MostPoints,
}

/// Finds the tray as the dominant dark region and cuts it out de-skewed
#[derive(Debug, Clone)]
pub struct RectangleExtractor {
    blur_kernel: u32,
    selection: ContourSelection,
}

impl Default for RectangleExtractor {
    fn default() -> Self {
        Self {
            blur_kernel: DEFAULT_BLUR_KERNEL,
            selection: ContourSelection::default(),
        }
    }
}

impl RectangleExtractor {
    pub fn new(blur_kernel: u32) -> Result<Self> {
        validate_kernel(blur_kernel)?;
        Ok(Self {
            blur_kernel,
            selection: ContourSelection::default(),
        })
    }

    pub fn with_selection(mut self, selection: ContourSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn blur_kernel(&self) -> u32 {
        self.blur_kernel
    }

    /// Grayscale, median blur and inverted Otsu threshold: dark regions become 255.
    pub fn binarize(&self, image: &RgbImage) -> Result<GrayImage> {
        ensure_non_empty(image.width(), image.height())?;
        let gray = imageops::grayscale(image);
        let radius = self.blur_kernel / 2;
        let blurred = median_filter(&gray, radius, radius);
        let level = otsu_level(&blurred);
        debug!(level, kernel = self.blur_kernel, "binarizing");
        Ok(binarize_inverted(&blurred, level))
    }

    /// Minimum-area rectangle around the dominant external contour
    pub fn extract(&self, binary: &GrayImage) -> Result<RotatedRect> {
        ensure_non_empty(binary.width(), binary.height())?;
        let contours = external_contours(binary);
        let external: Vec<&Contour<i32>> = contours.iter().collect();

        let dominant =
            select_contour(&external, self.selection).ok_or(TrayError::NoRectangleFound)?;
        let rect = min_area_rect(&dominant.points).ok_or(TrayError::NoRectangleFound)?;

        debug!(
            contours = external.len(),
            points = dominant.points.len(),
            center_x = rect.center.x,
            center_y = rect.center.y,
            width = rect.width,
            height = rect.height,
            angle = rect.angle,
            "extracted rectangle"
        );
        Ok(rect)
    }

    /// Rotate `source` about the rectangle center and cut out exactly
    /// `width` x `height` pixels with the rectangle axis-aligned.
    pub fn crop(&self, source: &RgbImage, rect: &RotatedRect) -> Result<RgbImage> {
        ensure_non_empty(source.width(), source.height())?;
        if rect.width == 0 || rect.height == 0 {
            return Err(TrayError::malformed(format!(
                "rectangle has zero size: {}x{}",
                rect.width, rect.height
            )));
        }

        let matrix = crop_matrix(rect);
        let projection = to_projection(&matrix)
            .ok_or_else(|| TrayError::malformed("crop rotation is not invertible"))?;

        let mut output = RgbImage::new(rect.width, rect.height);
        warp_into(
            source,
            &projection,
            Interpolation::Bilinear,
            Rgb([0, 0, 0]),
            &mut output,
        );
        Ok(output)
    }

    /// Binarize one image, find the rectangle, and crop it from another.
    ///
    /// `binarize_source` and `crop_source` must share a coordinate frame.
    pub fn extract_and_crop(
        &self,
        binarize_source: &RgbImage,
        crop_source: &RgbImage,
    ) -> Result<RgbImage> {
        let binary = self.binarize(binarize_source)?;
        let rect = self.extract(&binary)?;
        self.crop(crop_source, &rect)
    }
}

pub(crate) fn validate_kernel(kernel: u32) -> Result<()> {
    if kernel == 0 || kernel % 2 == 0 {
        return Err(TrayError::malformed(format!(
            "median blur kernel must be odd and positive, got {}",
            kernel
        )));
    }
    Ok(())
}

fn ensure_non_empty(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(TrayError::malformed(format!(
            "image has zero size: {}x{}",
            width, height
        )));
    }
    Ok(())
}

fn binarize_inverted(gray: &GrayImage, level: u8) -> GrayImage {
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] > level {
            Luma([0])
        } else {
            Luma([255])
        }
    })
}

/// Outer borders of the top-level foreground regions, in `binary` coordinates.
///
/// `find_contours` reports a region touching the left image edge as a hole, so
/// the search runs on a copy with a one-pixel background border.
fn external_contours(binary: &GrayImage) -> Vec<Contour<i32>> {
    let mut padded = GrayImage::new(binary.width() + 2, binary.height() + 2);
    imageops::replace(&mut padded, binary, 1, 1);

    find_contours::<i32>(&padded)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|mut c| {
            for p in &mut c.points {
                p.x -= 1;
                p.y -= 1;
            }
            c
        })
        .collect()
}

/// Shoelace area of a closed contour
fn contour_area(points: &[PixelPoint<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64)
        .sum();
    twice.abs() / 2.0
}

fn select_contour<'a>(
    contours: &[&'a Contour<i32>],
    selection: ContourSelection,
) -> Option<&'a Contour<i32>> {
    let score = |c: &Contour<i32>| match selection {
        ContourSelection::LargestArea => contour_area(&c.points),
        ContourSelection::MostPoints => c.points.len() as f64,
    };

    // First maximum wins on ties
    let mut best: Option<(&Contour<i32>, f64)> = None;
    for &contour in contours {
        let s = score(contour);
        match best {
            Some((_, best_score)) if s <= best_score => {}
            _ => best = Some((contour, s)),
        }
    }
    best.map(|(c, _)| c)
}

/// Rotating-calipers minimum-area rectangle over the convex hull.
fn min_area_rect(points: &[PixelPoint<i32>]) -> Option<RotatedRect> {
    let hull = convex_hull::<i32>(points);
    let hull: Vec<(f64, f64)> = hull.iter().map(|p| (p.x as f64, p.y as f64)).collect();

    match hull.len() {
        0 => return None,
        1 => {
            return Some(RotatedRect {
                center: Point::new(hull[0].0, hull[0].1),
                width: 0,
                height: 0,
                angle: -90.0,
            })
        }
        _ => {}
    }

    // (area, edge angle, width, height, center)
    let mut best: Option<(f64, f64, f64, f64, Point)> = None;
    for i in 0..hull.len() {
        let (x0, y0) = hull[i];
        let (x1, y1) = hull[(i + 1) % hull.len()];
        let (dx, dy) = (x1 - x0, y1 - y0);
        let len = dx.hypot(dy);
        if len == 0.0 {
            continue;
        }
        let u = (dx / len, dy / len);
        let v = (-u.1, u.0);

        let (mut min_u, mut max_u) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_v, mut max_v) = (f64::INFINITY, f64::NEG_INFINITY);
        for &(px, py) in &hull {
            let pu = (px - x0) * u.0 + (py - y0) * u.1;
            let pv = (px - x0) * v.0 + (py - y0) * v.1;
            min_u = min_u.min(pu);
            max_u = max_u.max(pu);
            min_v = min_v.min(pv);
            max_v = max_v.max(pv);
        }

        let (w, h) = (max_u - min_u, max_v - min_v);
        let area = w * h;
        if best.is_some_and(|b| area >= b.0) {
            continue;
        }
        let mid_u = (min_u + max_u) / 2.0;
        let mid_v = (min_v + max_v) / 2.0;
        let center = Point::new(
            x0 + u.0 * mid_u + v.0 * mid_v,
            y0 + u.1 * mid_u + v.1 * mid_v,
        );
        best = Some((area, dy.atan2(dx).to_degrees(), w, h, center));
    }

    let (_, mut angle, mut width, mut height, center) = best?;

    // Each quarter turn swaps which side is called the width
    while angle >= 0.0 {
        angle -= 90.0;
        std::mem::swap(&mut width, &mut height);
    }
    while angle < -90.0 {
        angle += 90.0;
        std::mem::swap(&mut width, &mut height);
    }

    Some(RotatedRect {
        center,
        width: width.round() as u32,
        height: height.round() as u32,
        angle,
    })
}

/// Rotation by `rect.angle` about its center, with the center moved to the
/// middle of a `width` x `height` canvas.
fn crop_matrix(rect: &RotatedRect) -> Matrix3<f64> {
    let (sin, cos) = rect.angle.to_radians().sin_cos();
    let Point { x: cx, y: cy } = rect.center;
    let tx = (1.0 - cos) * cx - sin * cy + rect.width as f64 / 2.0 - cx;
    let ty = sin * cx + (1.0 - cos) * cy + rect.height as f64 / 2.0 - cy;
    #[rustfmt::skip]
    let matrix = Matrix3::new(
        cos, sin, tx,
        -sin, cos, ty,
        0.0, 0.0, 1.0,
    );
    matrix
}
