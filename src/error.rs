use std::fmt;

use thiserror::Error;

/// Pipeline stage, used to tag errors coming out of [`crate::TrayNormalizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Perspective,
    Binarize,
    Extract,
    Crop,
    Orientation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Perspective => "perspective",
            Stage::Binarize => "binarize",
            Stage::Extract => "extract",
            Stage::Crop => "crop",
            Stage::Orientation => "orientation",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum TrayError {
    /// The calibration corners do not define a projective mapping
    #[error("degenerate calibration quadrilateral: {0}")]
    DegenerateCalibration(String),

    /// Binarization left no external contour to work with
    #[error("no rectangle found in binarized image")]
    NoRectangleFound,

    /// Empty images, zero kernels, non-positive grid intervals
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<TrayError>,
    },
}

impl TrayError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    pub(crate) fn at(self, stage: Stage) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// The innermost error, with any stage tagging peeled off
    pub fn root(&self) -> &TrayError {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wrapping_keeps_root() {
        let err = TrayError::NoRectangleFound.at(Stage::Extract);
        assert_eq!(
            err.to_string(),
            "extract stage failed: no rectangle found in binarized image"
        );
        assert!(matches!(err.root(), TrayError::NoRectangleFound));
    }
}
