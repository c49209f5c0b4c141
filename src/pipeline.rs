use image::{Rgb, RgbImage};
use tracing::{debug, instrument};

use crate::config::TrayConfig;
use crate::error::{Result, Stage, TrayError};
use crate::extract::RectangleExtractor;
use crate::geometry::AspectRatio;
use crate::orientation::OrientationResolver;
use crate::perspective::PerspectiveTransformer;

/// Raw photo to canonically oriented tray image.
///
/// Holds the calibrated perspective transform for one camera resolution;
/// everything else is recomputed per image. Safe to share between threads.
#[derive(Debug, Clone)]
pub struct TrayNormalizer {
    transformer: PerspectiveTransformer,
    extractor: RectangleExtractor,
    resolver: OrientationResolver,
    fill: Rgb<u8>,
    camera_size: (u32, u32),
}

impl TrayNormalizer {
    pub fn new(
        transformer: PerspectiveTransformer,
        extractor: RectangleExtractor,
        resolver: OrientationResolver,
        camera_size: (u32, u32),
    ) -> Self {
        Self {
            transformer,
            extractor,
            resolver,
            fill: Rgb([0, 0, 0]),
            camera_size,
        }
    }

    pub fn with_fill(mut self, fill: Rgb<u8>) -> Self {
        self.fill = fill;
        self
    }

    /// Build for images of `width` x `height` from a loaded configuration
    pub fn from_config(config: &TrayConfig, width: u32, height: u32) -> Result<Self> {
        let calibration = &config.calibration;
        let [aw, ah] = calibration.aspect_ratio;
        let transformer = PerspectiveTransformer::with_reference(
            width,
            height,
            calibration.quad(),
            AspectRatio::new(aw, ah),
            calibration.margin_x,
        )?;
        let extractor = RectangleExtractor::new(config.normalize.blur_kernel)?;
        let resolver = OrientationResolver::new(config.normalize.corner_sample)?;

        Ok(Self::new(transformer, extractor, resolver, (width, height))
            .with_fill(Rgb(config.normalize.fill)))
    }

    /// Camera image size the perspective transform was calibrated for
    pub fn camera_size(&self) -> (u32, u32) {
        self.camera_size
    }

    pub fn transformer(&self) -> &PerspectiveTransformer {
        &self.transformer
    }

    /// Rectify, cut out and orient the tray in `image`.
    ///
    /// Errors are tagged with the stage that produced them.
    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    pub fn normalize(&self, image: &RgbImage) -> Result<RgbImage> {
        if image.width() == 0 || image.height() == 0 {
            return Err(TrayError::malformed("image has zero size").at(Stage::Perspective));
        }
        if image.dimensions() != self.camera_size {
            let (w, h) = self.camera_size;
            return Err(TrayError::malformed(format!(
                "image is {}x{}, transform was calibrated for {}x{}",
                image.width(),
                image.height(),
                w,
                h
            ))
            .at(Stage::Perspective));
        }
        let rectified = self.transformer.transform(image, self.fill);

        let binary = self
            .extractor
            .binarize(&rectified)
            .map_err(|e| e.at(Stage::Binarize))?;
        let rect = self
            .extractor
            .extract(&binary)
            .map_err(|e| e.at(Stage::Extract))?;
        let cropped = self
            .extractor
            .crop(&rectified, &rect)
            .map_err(|e| e.at(Stage::Crop))?;
        let oriented = self
            .resolver
            .resolve(&cropped)
            .map_err(|e| e.at(Stage::Orientation))?;

        debug!(
            out_width = oriented.width(),
            out_height = oriented.height(),
            "normalized tray"
        );
        Ok(oriented)
    }
}
