use clap::Parser;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "tray-check")]
#[command(version, about = "Normalize tray photos and flag empty pockets")]
pub struct Cli {
    /// Tray configuration (JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Tray photos to process
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Directory for normalized images [default: not saved]
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Log every pipeline stage
    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    /// `<output_dir>/<stem>_normalized.png`, when an output directory is set
    pub fn output_path(&self, input: &Path) -> Option<PathBuf> {
        self.output_dir.as_ref().map(|dir| {
            let stem = input.file_stem().unwrap_or_default().to_string_lossy();
            dir.join(format!("{}_normalized.png", stem))
        })
    }
}
