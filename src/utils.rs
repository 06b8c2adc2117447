// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use super::StitcherError;
use crate::transform::Transform;
use opencv::core::{AlgorithmHint, Mat, MatTraitConst};
use opencv::{imgcodecs, imgproc};

/// Extension trait for more ergonomic Mat conversions
pub trait MatExt {
    /// Convert matrix to specified type with scaling
    ///
    /// # Arguments
    /// * `rtype` - OpenCV type constant (e.g., CV_32F, CV_64F)
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, StitcherError>;
}

impl MatExt for Mat {
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, StitcherError> {
        let mut dst = Mat::default();
        self.convert_to(&mut dst, rtype, alpha, beta)?;
        Ok(dst)
    }
}

/// A q&d hack allowing borrowed `opencv::Mat` slices to be `Sync`.
/// Only use this on `Mat` objects nobody mutates while the wrapper is alive.
pub(crate) struct UnsafeMatSyncWrapper<'a>(pub(crate) &'a [Mat]);
unsafe impl Sync for UnsafeMatSyncWrapper<'_> {}

/// Safe wrapper around OpenCV's `imread` with proper error handling
///
/// OpenCV wants a `&str` path, so paths that are not valid Unicode are
/// reported as `StitcherError::InvalidPathEncoding` instead of being mangled.
///
/// # Errors
/// Returns `StitcherError::OpenCvError` if the file is missing, unreadable or
/// in an unsupported format. OpenCV signals a missing file with an empty `Mat`,
/// that case is reported as `StitcherError::ProcessingError`.
///
/// # Example
/// ```no_run
/// # use libstitcher::{utils::imread, prelude::*, opencv::imgcodecs };
/// # fn a() -> Result<(),StitcherError> {
/// let img = imread("left.jpg", imgcodecs::IMREAD_COLOR)?;
/// # Ok(()) }
/// ```
#[inline(always)]
pub fn imread<P: AsRef<std::path::Path>>(path: P, flags: i32) -> Result<Mat, StitcherError> {
    let path_str = path
        .as_ref()
        .to_str()
        .ok_or_else(|| StitcherError::InvalidPathEncoding(path.as_ref().to_path_buf()))?;
    let img = imgcodecs::imread(path_str, flags)?;
    if img.empty() {
        return Err(StitcherError::ProcessingError(format!(
            "Could not read image {path_str}"
        )));
    }
    Ok(img)
}

/// Returns a single channel copy of `img`, converting BGR or BGRA input.
pub fn to_grey(img: &Mat) -> Result<Mat, StitcherError> {
    let code = match img.channels() {
        1 => return Ok(img.clone()),
        3 => imgproc::COLOR_BGR2GRAY,
        4 => imgproc::COLOR_BGRA2GRAY,
        c => {
            return Err(StitcherError::InvalidParams(format!(
                "Unsupported number of channels: {c}"
            )));
        }
    };
    let mut img_grey = Mat::default();
    imgproc::cvt_color(
        img,
        &mut img_grey,
        code,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    Ok(img_grey)
}

/// Scales an image so that its smaller dimension equals `scale_down`.
/// Returns the scaled image together with the (x, y) full-to-small scale factors.
pub(crate) fn scale_image(
    img: &Mat,
    scale_down: f32,
) -> Result<(Mat, (f64, f64)), StitcherError> {
    let size = img.size()?;
    let width = size.width;
    let height = size.height;

    let scaling_factor = if width < height {
        scale_down as f64 / width as f64
    } else {
        scale_down as f64 / height as f64
    };

    let new_width = ((width as f64 * scaling_factor).round() as i32).max(1);
    let new_height = ((height as f64 * scaling_factor).round() as i32).max(1);

    let mut resized = Mat::default();
    imgproc::resize(
        img,
        &mut resized,
        opencv::core::Size::new(new_width, new_height),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;

    Ok((
        resized,
        (
            new_width as f64 / width as f64,
            new_height as f64 / height as f64,
        ),
    ))
}

/// Lifts a transform estimated between two scaled-down images back to full resolution.
///
/// `h_small` maps the scaled `src` image onto the scaled `dst` image; `src_scale` and
/// `dst_scale` are the full-to-small factors returned by `scale_image()`.
pub(crate) fn adjust_transform_for_scale(
    h_small: &Transform,
    src_scale: (f64, f64),
    dst_scale: (f64, f64),
) -> Transform {
    let to_small = Transform::scale(src_scale.0, src_scale.1);
    let to_full = Transform::scale(1.0 / dst_scale.0, 1.0 / dst_scale.1);
    to_full.compose(h_small).compose(&to_small)
}
