use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use image::ImageReader;
use serde::Serialize;
use tracing::{error, info, warn};

use tray_check::{logger, Cli, PocketGrid, PocketJudge, TrayConfig, TrayNormalizer};

#[derive(Serialize)]
struct Report<'a> {
    image: &'a Path,
    width: u32,
    height: u32,
    empty_pockets: Option<Vec<usize>>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let config = TrayConfig::from_file(&cli.config)?;
    let grid = config
        .grid
        .as_ref()
        .map(|g| g.build())
        .transpose()
        .context("Invalid pocket grid configuration")?;

    if let Some(dir) = &cli.output_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {:?}", dir))?;
    }

    let mut normalizer: Option<TrayNormalizer> = None;
    let mut failures = 0;

    for input in &cli.inputs {
        if let Err(e) = process(&cli, &config, grid.as_ref(), &mut normalizer, input) {
            // Deterministic failure: log it and move on to the next photo
            error!("{:#}", e);
            failures += 1;
        }
    }

    info!(
        processed = cli.inputs.len() - failures,
        failed = failures,
        "batch finished"
    );
    if failures == cli.inputs.len() {
        bail!("No image could be normalized");
    }
    Ok(())
}

fn process(
    cli: &Cli,
    config: &TrayConfig,
    grid: Option<&(PocketGrid, PocketJudge)>,
    normalizer: &mut Option<TrayNormalizer>,
    input: &Path,
) -> Result<()> {
    let img = ImageReader::open(input)
        .with_context(|| format!("Failed to open input file: {:?}", input))?
        .decode()
        .with_context(|| format!("Failed to decode image: {:?}", input))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    info!("Loaded image: {:?} ({}x{})", input, width, height);

    // The calibration matrix depends on the camera resolution
    let current = match normalizer.take() {
        Some(n) if n.camera_size() == (width, height) => n,
        previous => {
            if previous.is_some() {
                warn!("Image size changed to {}x{}, rebuilding transform", width, height);
            }
            TrayNormalizer::from_config(config, width, height)
                .context("Failed to build perspective transform")?
        }
    };
    let normalizer = normalizer.insert(current);

    let normalized = normalizer
        .normalize(&img)
        .with_context(|| format!("Failed to normalize {:?}", input))?;

    if let Some(output_path) = cli.output_path(input) {
        normalized
            .save(&output_path)
            .with_context(|| format!("Failed to save output: {:?}", output_path))?;
        info!("Saved normalized image: {:?}", output_path);
    }

    let empty_pockets = match grid {
        Some((grid, judge)) => {
            let empty = judge
                .empty_pockets(&normalized, grid)
                .with_context(|| format!("Failed to judge pockets of {:?}", input))?;
            Some(empty.iter().map(|v| v.index).collect())
        }
        None => None,
    };

    let report = Report {
        image: input,
        width: normalized.width(),
        height: normalized.height(),
        empty_pockets,
    };
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
