//! Pocket grid over a normalized tray image and the empty-pocket judge.
//!
//! The grid corners and pocket count come from external calibration; they
//! are expressed in the coordinate frame of the normalized image.

use image::{imageops, GenericImageView, GrayImage, Luma, RgbImage};
use imageproc::filter::median_filter;
use serde::Serialize;

use crate::error::{Result, TrayError};
use crate::extract::validate_kernel;
use crate::geometry::Point;

/// Largest supported number of pockets along one side
pub const MAX_POCKETS_PER_SIDE: u32 = 1024;

/// Square `pocket_count` x `pocket_count` grid between two opposite corners
#[derive(Debug, Clone, PartialEq)]
pub struct PocketGrid {
    upper_left: Point,
    pocket_count: u32,
    interval_x: u32,
    interval_y: u32,
}

impl PocketGrid {
    pub fn new(upper_left: Point, lower_right: Point, pocket_count: u32) -> Result<Self> {
        if pocket_count == 0 {
            return Err(TrayError::malformed("pocket count must be positive"));
        }
        if pocket_count > MAX_POCKETS_PER_SIDE {
            return Err(TrayError::malformed(format!(
                "pocket count {} exceeds {}",
                pocket_count, MAX_POCKETS_PER_SIDE
            )));
        }
        let (interval_x, interval_y) = intervals(upper_left, lower_right, pocket_count);
        if interval_x <= 0.0 || interval_y <= 0.0 {
            return Err(TrayError::malformed(format!(
                "pocket interval must be positive, got {}x{}",
                interval_x, interval_y
            )));
        }
        if interval_x > u32::MAX as f64 || interval_y > u32::MAX as f64 {
            return Err(TrayError::malformed(format!(
                "pocket interval {}x{} is too large",
                interval_x, interval_y
            )));
        }
        Ok(Self {
            upper_left,
            pocket_count,
            interval_x: interval_x as u32,
            interval_y: interval_y as u32,
        })
    }

    pub fn pocket_count(&self) -> u32 {
        self.pocket_count
    }

    /// Cell size (width, height) in pixels
    pub fn interval(&self) -> (u32, u32) {
        (self.interval_x, self.interval_y)
    }

    /// Upper-left corner of every pocket, column by column
    pub fn origins(&self) -> Vec<Point> {
        let n = self.pocket_count as usize;
        let (dx, dy) = (self.interval_x as f64, self.interval_y as f64);
        let mut origins = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                origins.push(Point::new(
                    self.upper_left.x + i as f64 * dx,
                    self.upper_left.y + j as f64 * dy,
                ));
            }
        }
        origins
    }

    /// Pixels of the pocket starting at `origin`, clipped to the image
    pub fn pocket_image(&self, image: &RgbImage, origin: Point) -> Result<RgbImage> {
        let x = origin.x.round_ties_even().max(0.0) as u32;
        let y = origin.y.round_ties_even().max(0.0) as u32;
        let view = imageops::crop_imm(image, x, y, self.interval_x, self.interval_y);
        if view.width() == 0 || view.height() == 0 {
            return Err(TrayError::malformed(format!(
                "pocket at ({}, {}) lies outside the {}x{} image",
                x,
                y,
                image.width(),
                image.height()
            )));
        }
        Ok(view.to_image())
    }
}

/// Rounded per-axis interval between two corners
fn intervals(upper_left: Point, lower_right: Point, pocket_count: u32) -> (f64, f64) {
    let n = pocket_count as f64;
    (
        ((lower_right.x - upper_left.x) / n).round_ties_even(),
        ((lower_right.y - upper_left.y) / n).round_ties_even(),
    )
}

/// Verdict for one pocket
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PocketVerdict {
    /// Position in [`PocketGrid::origins`] order
    pub index: usize,
    pub origin: Point,
    pub occupied: bool,
}

/// Fixed-threshold occupancy test
#[derive(Debug, Clone)]
pub struct PocketJudge {
    blur_kernel: u32,
    threshold: u8,
}

impl PocketJudge {
    pub fn new(blur_kernel: u32, threshold: u8) -> Result<Self> {
        validate_kernel(blur_kernel)?;
        Ok(Self {
            blur_kernel,
            threshold,
        })
    }

    /// Grayscale, median blur, then `value > threshold` becomes 255
    fn binarize(&self, pocket: &RgbImage) -> GrayImage {
        let gray = imageops::grayscale(pocket);
        let radius = self.blur_kernel / 2;
        let blurred = median_filter(&gray, radius, radius);
        GrayImage::from_fn(blurred.width(), blurred.height(), |x, y| {
            if blurred.get_pixel(x, y)[0] > self.threshold {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    /// A pocket is occupied when anything in it survives binarization
    pub fn is_occupied(&self, pocket: &RgbImage) -> bool {
        self.binarize(pocket).pixels().any(|p| p[0] == 255)
    }

    pub fn judge(&self, image: &RgbImage, grid: &PocketGrid) -> Result<Vec<PocketVerdict>> {
        grid.origins()
            .into_iter()
            .enumerate()
            .map(|(index, origin)| {
                let pocket = grid.pocket_image(image, origin)?;
                Ok(PocketVerdict {
                    index,
                    origin,
                    occupied: self.is_occupied(&pocket),
                })
            })
            .collect()
    }

    /// Verdicts for the pockets that look empty
    pub fn empty_pockets(&self, image: &RgbImage, grid: &PocketGrid) -> Result<Vec<PocketVerdict>> {
        let mut verdicts = self.judge(image, grid)?;
        verdicts.retain(|v| !v.occupied);
        Ok(verdicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    #[test]
    fn test_interval_rounding() {
        let grid = PocketGrid::new(Point::new(95.0, 115.0), Point::new(1495.0, 1535.0), 20).unwrap();
        assert_eq!(grid.interval(), (70, 71));
    }

    #[test]
    fn test_origins_are_column_major() {
        let grid = PocketGrid::new(Point::new(10.0, 20.0), Point::new(40.0, 80.0), 3).unwrap();
        let origins = grid.origins();
        assert_eq!(origins.len(), 9);
        assert_eq!(origins[0], Point::new(10.0, 20.0));
        assert_eq!(origins[1], Point::new(10.0, 40.0));
        assert_eq!(origins[2], Point::new(10.0, 60.0));
        assert_eq!(origins[3], Point::new(20.0, 20.0));
        assert_eq!(origins[8], Point::new(30.0, 60.0));
    }

    #[test]
    fn test_invalid_grid() {
        assert!(PocketGrid::new(Point::new(0.0, 0.0), Point::new(10.0, 10.0), 0).is_err());
        let err = PocketGrid::new(Point::new(50.0, 0.0), Point::new(10.0, 10.0), 2).unwrap_err();
        assert!(matches!(err, TrayError::MalformedInput(_)));
    }

    #[test]
    fn test_large_grid_values() {
        let err = PocketGrid::new(Point::new(0.0, 0.0), Point::new(1e7, 1e7), 100_000).unwrap_err();
        assert!(matches!(err, TrayError::MalformedInput(_)));
        assert!(PocketGrid::new(Point::new(0.0, 0.0), Point::new(1e12, 1e12), 2).is_err());

        // Offsets past u32::MAX stay exact
        let grid = PocketGrid::new(Point::new(0.0, 0.0), Point::new(9e9, 9e9), 3).unwrap();
        assert_eq!(grid.interval(), (3_000_000_000, 3_000_000_000));
        assert_eq!(grid.origins()[8], Point::new(6e9, 6e9));
    }

    #[test]
    fn test_pocket_outside_image() {
        let grid = PocketGrid::new(Point::new(0.0, 0.0), Point::new(20.0, 20.0), 2).unwrap();
        let img = RgbImage::new(10, 10);
        assert!(grid.pocket_image(&img, Point::new(0.0, 0.0)).is_ok());
        assert!(grid.pocket_image(&img, Point::new(10.0, 0.0)).is_err());
    }

    #[test]
    fn test_judge_flags_empty_pockets() {
        // 2x2 grid of 20px pockets, something bright in pockets 0 and 3
        let mut img = RgbImage::from_pixel(40, 40, Rgb([20, 20, 20]));
        draw_filled_rect_mut(&mut img, Rect::at(5, 5).of_size(8, 8), Rgb([230, 230, 230]));
        draw_filled_rect_mut(&mut img, Rect::at(25, 25).of_size(8, 8), Rgb([230, 230, 230]));
        // A single hot pixel is removed by the median blur
        img.put_pixel(30, 5, Rgb([255, 255, 255]));

        let grid = PocketGrid::new(Point::new(0.0, 0.0), Point::new(40.0, 40.0), 2).unwrap();
        let judge = PocketJudge::new(3, 128).unwrap();

        let verdicts = judge.judge(&img, &grid).unwrap();
        let occupied: Vec<bool> = verdicts.iter().map(|v| v.occupied).collect();
        assert_eq!(occupied, vec![true, false, false, true]);

        let empty: Vec<usize> = judge
            .empty_pockets(&img, &grid)
            .unwrap()
            .iter()
            .map(|v| v.index)
            .collect();
        assert_eq!(empty, vec![1, 2]);
    }
}
