// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Warping images into the canvas and binary compositing.

use super::StitcherError;
use crate::canvas::CanvasSpec;
use crate::transform::Transform;
use crate::utils::UnsafeMatSyncWrapper;
use opencv::core::{self, CV_8UC1, Mat, Scalar};
use opencv::imgproc;
use opencv::prelude::*;
use rayon::prelude::*;

/// A warped image and the mask of canvas pixels it covers.
struct Warped {
    image: Mat,
    mask: Mat,
}

fn warp_into_canvas(
    image: &Mat,
    t: &Transform,
    canvas: &CanvasSpec,
) -> Result<Warped, StitcherError> {
    let m = canvas.offset().compose(t).normalized().to_mat()?;
    let mut warped_image = Mat::default();
    // the mask decides coverage, edge pixels must not blend in the border colour
    imgproc::warp_perspective(
        image,
        &mut warped_image,
        &m,
        canvas.size(),
        imgproc::INTER_LINEAR,
        core::BORDER_REPLICATE,
        Scalar::default(),
    )?;

    let coverage = Mat::new_size_with_default(image.size()?, CV_8UC1, Scalar::all(255.0))?;
    let mut mask = Mat::default();
    imgproc::warp_perspective(
        &coverage,
        &mut mask,
        &m,
        canvas.size(),
        imgproc::INTER_NEAREST,
        core::BORDER_CONSTANT,
        Scalar::all(0.0),
    )?;
    Ok(Warped {
        image: warped_image,
        mask,
    })
}

/// Warps every image into `canvas` with its global transform and composites them.
///
/// Warping runs in parallel, the masked copies are applied in input order so that
/// in overlapping regions the image with the higher index wins. Canvas pixels no
/// image covers stay black. Images whose transform is not finite or not invertible
/// are left out with a warning.
///
/// All images must share one OpenCV type, which is also the type of the result.
pub fn compose(
    images: &[Mat],
    transforms: &[Transform],
    canvas: &CanvasSpec,
) -> Result<Mat, StitcherError> {
    if images.is_empty() || images.len() != transforms.len() {
        return Err(StitcherError::InvalidParams(format!(
            "{} images for {} transforms",
            images.len(),
            transforms.len()
        )));
    }
    let typ = images[0].typ();
    if images.iter().any(|img| img.typ() != typ) {
        return Err(StitcherError::InvalidParams(
            "All images must have the same type".to_string(),
        ));
    }

    let images_wr = UnsafeMatSyncWrapper(images);
    let images_wrmv = &images_wr;
    let warped = transforms
        .par_iter()
        .enumerate()
        .map(move |(index, t)| -> Result<Option<Warped>, StitcherError> {
            if !t.is_finite() || t.try_inverse().is_none() {
                log::warn!("image {index} has a degenerate transform and is left out");
                return Ok(None);
            }
            warp_into_canvas(&images_wrmv.0[index], t, canvas).map(Some)
        })
        .collect::<Result<Vec<Option<Warped>>, StitcherError>>()?;

    let mut result = Mat::new_size_with_default(canvas.size(), typ, Scalar::default())?;
    for w in warped.into_iter().flatten() {
        w.image.copy_to_masked(&mut result, &w.mask)?;
    }
    Ok(result)
}
