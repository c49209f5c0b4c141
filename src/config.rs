use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::extract::DEFAULT_BLUR_KERNEL;
use crate::geometry::{Point, Quad};
use crate::grid::{PocketGrid, PocketJudge};
use crate::orientation::DEFAULT_CORNER_SAMPLE;
use crate::perspective::DEFAULT_MARGIN_X;

/// Tray inspection settings, normally read from a JSON file next to the images.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrayConfig {
    pub calibration: Calibration,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub grid: Option<GridConfig>,
}

/// One-time camera calibration: where the tray's reference rectangle
/// appears in the raw photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Calibration {
    /// Top-left, bottom-left, bottom-right, top-right as `[x, y]`
    pub corners: [[f64; 2]; 4],
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: [f64; 2],
    #[serde(default = "default_margin_x")]
    pub margin_x: f64,
}

impl Calibration {
    pub fn quad(&self) -> Quad {
        self.corners.map(Point::from)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormalizeConfig {
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: u32,
    #[serde(default = "default_corner_sample")]
    pub corner_sample: u32,
    /// Colour for canvas pixels outside the rectified photo
    #[serde(default)]
    pub fill: [u8; 3],
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            blur_kernel: DEFAULT_BLUR_KERNEL,
            corner_sample: DEFAULT_CORNER_SAMPLE,
            fill: [0, 0, 0],
        }
    }
}

/// Pocket layout in the normalized image
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridConfig {
    pub upper_left: [f64; 2],
    pub lower_right: [f64; 2],
    pub pocket_count: u32,
    #[serde(default = "default_judge_kernel")]
    pub blur_kernel: u32,
    #[serde(default = "default_threshold")]
    pub threshold: u8,
}

impl GridConfig {
    pub fn build(&self) -> crate::Result<(PocketGrid, PocketJudge)> {
        let grid = PocketGrid::new(
            Point::from(self.upper_left),
            Point::from(self.lower_right),
            self.pocket_count,
        )?;
        let judge = PocketJudge::new(self.blur_kernel, self.threshold)?;
        Ok((grid, judge))
    }
}

fn default_aspect_ratio() -> [f64; 2] {
    [4.0, 3.0]
}

fn default_margin_x() -> f64 {
    DEFAULT_MARGIN_X
}

fn default_blur_kernel() -> u32 {
    DEFAULT_BLUR_KERNEL
}

fn default_corner_sample() -> u32 {
    DEFAULT_CORNER_SAMPLE
}

fn default_judge_kernel() -> u32 {
    5
}

fn default_threshold() -> u8 {
    128
}

impl TrayConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse config: {:?}", path))
    }
}
