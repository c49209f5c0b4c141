pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod geometry;
pub mod grid;
pub mod logger;
pub mod orientation;
pub mod perspective;
pub mod pipeline;

pub use cli::Cli;
pub use config::TrayConfig;
pub use error::{Result, Stage, TrayError};
pub use extract::{ContourSelection, RectangleExtractor, RotatedRect};
pub use geometry::{AspectRatio, Point, Quad};
pub use grid::{PocketGrid, PocketJudge, PocketVerdict};
pub use orientation::{Corner, OrientationResolver};
pub use perspective::PerspectiveTransformer;
pub use pipeline::TrayNormalizer;
