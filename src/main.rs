// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use clap::{Parser, ValueEnum};
use libstitcher::opencv::core::Vector;
use libstitcher::opencv::imgcodecs;
use libstitcher::prelude::*;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "libstitcher")]
#[command(about = "Stitch an ordered sequence of overlapping photographs into a panorama")]
#[command(version)]
struct Cli {
    /// How each adjacent pair is aligned.
    #[arg(long, value_enum, default_value = "ransac")]
    method: MethodArg,

    /// Model RANSAC tries first before falling back to simpler ones.
    #[arg(long, value_enum, default_value = "projective")]
    model: ModelArg,

    /// Feature detector.
    #[arg(long, value_enum, default_value = "orb")]
    detector: DetectorArg,

    /// Detect features on images scaled down to this width.
    #[arg(long, value_name = "WIDTH")]
    scale: Option<f32>,

    /// Write a JSON record of the run to this file.
    #[arg(long, value_name = "FILE.json")]
    metadata: Option<PathBuf>,

    /// Where the panorama is written.
    output: PathBuf,

    /// Input images, ordered so that neighbours overlap.
    #[arg(required = true, num_args = MIN_IMAGES..)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MethodArg {
    Ransac,
    Direct,
}

impl MethodArg {
    fn to_core(self) -> EstimationMethod {
        match self {
            Self::Ransac => EstimationMethod::Ransac,
            Self::Direct => EstimationMethod::Direct,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModelArg {
    Projective,
    Affine,
    Similarity,
}

impl ModelArg {
    fn to_core(self) -> ModelKind {
        match self {
            Self::Projective => ModelKind::Projective,
            Self::Affine => ModelKind::Affine,
            Self::Similarity => ModelKind::Similarity,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DetectorArg {
    Orb,
    Sift,
    Akaze,
}

impl DetectorArg {
    fn to_core(self) -> DetectorKind {
        match self {
            Self::Orb => DetectorKind::Orb,
            Self::Sift => DetectorKind::Sift,
            Self::Akaze => DetectorKind::Akaze,
        }
    }
}

impl Cli {
    fn params(&self) -> StitchParameters {
        StitchParameters {
            method: self.method.to_core(),
            model: self.model.to_core(),
            feature_scale_width: self.scale,
            ..StitchParameters::with_detector(self.detector.to_core())
        }
    }
}

fn main() -> Result<(), StitcherError> {
    env_logger::init();
    let cli = Cli::parse();
    let params = cli.params();

    let now = std::time::Instant::now();
    let panorama = stitch(&cli.inputs, params)?;
    println!("Stitched {} images in {:?}", cli.inputs.len(), now.elapsed());

    for (i, pair) in panorama.stats.pairs().iter().enumerate() {
        match (pair.inlier_count, pair.model) {
            (Some(inliers), Some(model)) => println!(
                "{:?} -> {:?}: {} matches, {} inliers ({})",
                cli.inputs[i + 1],
                cli.inputs[i],
                pair.match_count,
                inliers,
                model
            ),
            _ => println!(
                "{:?} -> {:?}: {} matches, not aligned",
                cli.inputs[i + 1],
                cli.inputs[i],
                pair.match_count
            ),
        }
    }
    println!(
        "Canvas {}x{}, anchored at {:?}",
        panorama.canvas.width, panorama.canvas.height, cli.inputs[panorama.anchor]
    );

    let output = cli
        .output
        .to_str()
        .ok_or_else(|| StitcherError::InvalidPathEncoding(cli.output.clone()))?;
    if !imgcodecs::imwrite(output, &panorama.image, &Vector::new())? {
        return Err(StitcherError::ProcessingError(format!(
            "Could not write {output}"
        )));
    }

    if let Some(path) = &cli.metadata {
        let meta = StitchMetadata::new(&cli.inputs, params.detector.name(), &params, &panorama);
        std::fs::write(path, meta.to_json()?)?;
    }
    Ok(())
}
