// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use libstitcher::opencv::highgui;
use libstitcher::prelude::*;
use std::path;

/// Returns paths to all jpg,jpeg,tif and png files in a single directory (non-recursive),
/// sorted by file name so that neighbouring shots end up next to each other.
pub fn collect_image_files(
    path: &std::path::Path,
) -> Result<Vec<std::path::PathBuf>, StitcherError> {
    let mut files: Vec<_> = std::fs::read_dir(path)?
        .flatten()
        .map(|f| f.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_uppercase())
                .is_some_and(|e| e == "JPG" || e == "JPEG" || e == "TIF" || e == "PNG")
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Stitches the images found under "panorama/images" twice, once with RANSAC at
/// full resolution and once with the direct estimator on features found at width 400,
/// then displays both until ESC is pressed.
fn main() -> Result<(), StitcherError> {
    env_logger::init();
    let files = collect_image_files(&path::PathBuf::from("panorama/images"))?;

    let ransac_params = StitchParameters::default();
    let now = std::time::Instant::now();
    let ransac = stitch(&files, ransac_params)?;
    let ransac_duration = now.elapsed();
    println!(
        "Calculated stitch(ransac) in {:?}, failed pairs:{}",
        ransac_duration,
        ransac.stats.failed_pairs().count()
    );
    let detector_name = ransac_params.detector.name();
    let metadata = StitchMetadata::new(&files, detector_name, &ransac_params, &ransac);
    println!("{}", metadata.to_json()?);

    let now = std::time::Instant::now();
    let direct = stitch(
        &files,
        StitchParameters {
            method: EstimationMethod::Direct,
            feature_scale_width: Some(400.0),
            ..Default::default()
        },
    )?;
    let direct_duration = now.elapsed();
    println!(
        "Calculated stitch(direct, width=400) in {:?}, failed pairs:{}",
        direct_duration,
        direct.stats.failed_pairs().count()
    );

    while highgui::wait_key(33)? != 27 {
        highgui::imshow(
            format!("RANSAC (full resolution) [{:?}]", ransac_duration).as_str(),
            &ransac.image,
        )?;
        highgui::imshow(
            format!("Direct (width 400) [{:?}]", direct_duration).as_str(),
            &direct.image,
        )?;
    }
    Ok(())
}
