use image::{imageops, GenericImageView, Rgb, RgbImage};
use tracing::debug;

use crate::error::{Result, TrayError};

/// Default side length of the corner sample windows, in pixels
pub const DEFAULT_CORNER_SAMPLE: u32 = 100;

/// Image corner holding a sample window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corner {
    TopLeft = 0,
    TopRight = 1,
    BottomLeft = 2,
    BottomRight = 3,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomLeft,
        Corner::BottomRight,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// HSV value channel of an 8-bit pixel
fn value(pixel: &Rgb<u8>) -> u8 {
    pixel.0.into_iter().max().unwrap_or(0)
}

/// Rotates a cropped tray so its bright marker ends up in the top-right corner.
#[derive(Debug, Clone)]
pub struct OrientationResolver {
    sample_size: u32,
}

impl Default for OrientationResolver {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_CORNER_SAMPLE,
        }
    }
}

impl OrientationResolver {
    pub fn new(sample_size: u32) -> Result<Self> {
        if sample_size == 0 {
            return Err(TrayError::malformed("corner sample size must be positive"));
        }
        Ok(Self { sample_size })
    }

    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    /// Mean V channel of each corner window, indexed by [`Corner::index`].
    ///
    /// Windows larger than the image are clamped to it.
    pub fn corner_brightness(&self, image: &RgbImage) -> Result<[f64; 4]> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(TrayError::malformed(format!(
                "image has zero size: {}x{}",
                w, h
            )));
        }
        let r = self.sample_size.min(w).min(h);

        Ok(Corner::ALL.map(|corner| {
            let (x0, y0) = match corner {
                Corner::TopLeft => (0, 0),
                Corner::TopRight => (w - r, 0),
                Corner::BottomLeft => (0, h - r),
                Corner::BottomRight => (w - r, h - r),
            };
            let window = imageops::crop_imm(image, x0, y0, r, r);
            let total: u64 = window.pixels().map(|(_, _, p)| value(&p) as u64).sum();
            total as f64 / (r as u64 * r as u64) as f64
        }))
    }

    /// Corner with the highest mean brightness; the first one wins ties.
    pub fn brightest_corner(&self, image: &RgbImage) -> Result<Corner> {
        let brightness = self.corner_brightness(image)?;
        let mut best = Corner::TopLeft;
        for corner in Corner::ALL {
            if brightness[corner.index()] > brightness[best.index()] {
                best = corner;
            }
        }
        debug!(?brightness, ?best, "corner brightness");
        Ok(best)
    }

    /// Undo the rotation implied by the marker sitting in `corner`
    pub fn rotate(image: &RgbImage, corner: Corner) -> RgbImage {
        match corner {
            Corner::TopLeft => imageops::rotate90(image),
            Corner::TopRight => image.clone(),
            Corner::BottomLeft => imageops::rotate180(image),
            Corner::BottomRight => imageops::rotate270(image),
        }
    }

    /// Bring `image` into canonical orientation
    pub fn resolve(&self, image: &RgbImage) -> Result<RgbImage> {
        let corner = self.brightest_corner(image)?;
        Ok(Self::rotate(image, corner))
    }
}
