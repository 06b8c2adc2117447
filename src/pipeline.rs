// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! The end-to-end stitching driver.

use super::{EstimationMethod, MIN_IMAGES, StitchParameters, StitcherError};
use crate::canvas::{CanvasSpec, size_canvas};
use crate::chain::build_chain;
use crate::compositor::compose;
use crate::detector::{FeatureDetector, KeypointSet};
use crate::direct::estimate_direct_with_model;
use crate::matcher::match_descriptors;
use crate::ransac::estimate_robust_with_fallback;
use crate::transform::{ModelKind, Transform};
use crate::utils::{self, UnsafeMatSyncWrapper};
use opencv::core::{Mat, Point2d, Size};
use opencv::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Outcome of aligning image `n` onto image `n-1`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairStats {
    /// Correspondences that survived matching
    pub match_count: usize,
    /// Correspondences supporting `transform`, `None` when the pair could not be aligned
    pub inlier_count: Option<usize>,
    /// The model that produced `transform`, `None` for the identity fallback
    pub model: Option<ModelKind>,
    /// Local transform mapping image `n` onto image `n-1`
    pub transform: Transform,
}

impl PairStats {
    fn failed(match_count: usize) -> Self {
        Self {
            match_count,
            inlier_count: None,
            model: None,
            transform: Transform::identity(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.inlier_count.is_none()
    }
}

/// One [`PairStats`] per adjacent image pair, in image order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pairs: Vec<PairStats>,
}

impl PipelineStats {
    /// Entry `k` describes images `k` and `k + 1`.
    #[inline]
    pub fn pairs(&self) -> &[PairStats] {
        &self.pairs
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pairs that fell back to the identity, with their index.
    pub fn failed_pairs(&self) -> impl Iterator<Item = (usize, &PairStats)> {
        self.pairs.iter().enumerate().filter(|(_, p)| p.is_failed())
    }

    pub fn total_matches(&self) -> usize {
        self.pairs.iter().map(|p| p.match_count).sum()
    }
}

impl From<Vec<PairStats>> for PipelineStats {
    fn from(pairs: Vec<PairStats>) -> Self {
        Self { pairs }
    }
}

/// A finished stitch.
#[derive(Debug, Clone)]
pub struct Panorama {
    /// The composited raster, same type as the input images
    pub image: Mat,
    pub canvas: CanvasSpec,
    /// Global transform of every input image, mapping it into the canvas' global frame
    pub transforms: Vec<Transform>,
    /// Index of the image the global frame is anchored at
    pub anchor: usize,
    pub stats: PipelineStats,
}

/// Estimates the local transform mapping `src` (points in image `n`) onto `dst`
/// (the matching points in image `n-1`).
///
/// Never fails on bad data: when no model can be fitted the pair gets the identity
/// and a warning is logged.
pub fn estimate_local(
    src: &[Point2d],
    dst: &[Point2d],
    params: &StitchParameters,
) -> Result<PairStats, StitcherError> {
    let match_count = src.len();
    let (transform, model, inlier_count) = match params.method {
        EstimationMethod::Ransac => {
            let est = estimate_robust_with_fallback(src, dst, params.model, &params.ransac)?;
            (est.transform, est.model, est.inlier_count)
        }
        EstimationMethod::Direct => match estimate_direct_with_model(src, dst) {
            (t, Some(model)) => (Some(t), Some(model), match_count),
            (_, None) => (None, None, 0),
        },
    };
    match transform {
        Some(transform) => Ok(PairStats {
            match_count,
            inlier_count: Some(inlier_count),
            model,
            transform,
        }),
        None => {
            log::warn!(
                "no transform could be estimated from {match_count} matches, using identity"
            );
            Ok(PairStats::failed(match_count))
        }
    }
}

/// Matches `current` against `previous` and estimates the local transform of the pair.
pub fn estimate_pair(
    previous: &KeypointSet,
    current: &KeypointSet,
    params: &StitchParameters,
) -> Result<PairStats, StitcherError> {
    let matches = match_descriptors(
        current.descriptors(),
        previous.descriptors(),
        &params.matching,
    )?;
    let (src, dst): (Vec<Point2d>, Vec<Point2d>) = matches
        .iter()
        .map(|m| {
            let a = current.keypoints()[m.a].location;
            let b = previous.keypoints()[m.b].location;
            (
                Point2d::new(a.x as f64, a.y as f64),
                Point2d::new(b.x as f64, b.y as f64),
            )
        })
        .unzip();
    estimate_local(&src, &dst, params)
}

/// Stitches `images`, in order, using `detector` for feature extraction.
///
/// Feature detection and pairwise estimation run in parallel; the chain is then
/// folded in index order, the canvas sized and the images composited.
///
/// # Errors
/// Only caller errors are fatal: fewer than two images, empty images, invalid
/// parameters, or a `feature_scale_width` not smaller than an image. Pairs that
/// cannot be aligned are placed without relative motion and show up in
/// [`PipelineStats::failed_pairs()`].
pub fn stitch_images_with<D>(
    images: &[Mat],
    detector: &D,
    params: &StitchParameters,
) -> Result<Panorama, StitcherError>
where
    D: FeatureDetector + Sync,
{
    if images.len() < MIN_IMAGES {
        return Err(StitcherError::NotEnoughImages {
            found: images.len(),
            required: MIN_IMAGES,
        });
    }
    params.validate()?;
    let sizes = images
        .iter()
        .map(|img| {
            if img.empty() {
                Err(StitcherError::InvalidParams("Empty input image".to_string()))
            } else {
                Ok(img.size()?)
            }
        })
        .collect::<Result<Vec<Size>, StitcherError>>()?;
    if let Some(width) = params.feature_scale_width {
        if let Some(s) = sizes.iter().find(|s| width >= s.width.min(s.height) as f32) {
            return Err(StitcherError::InvalidParams(format!(
                "feature_scale_width was larger (or equal) to the image: \
                 size:{}x{}, feature_scale_width:{}",
                s.width, s.height, width
            )));
        }
    }
    log::info!(
        "stitching {} images with {} ({}, {})",
        images.len(),
        detector.name(),
        params.method,
        params.model
    );

    let images_wr = UnsafeMatSyncWrapper(images);
    let images_wrmv = &images_wr;
    // keypoints in (possibly scaled) detection coordinates and the full-to-small factors
    let features = (0..images.len())
        .into_par_iter()
        .map(move |index| -> Result<(KeypointSet, (f64, f64)), StitcherError> {
            let grey = utils::to_grey(&images_wrmv.0[index])?;
            let (grey, scale) = match params.feature_scale_width {
                Some(width) => utils::scale_image(&grey, width)?,
                None => (grey, (1.0, 1.0)),
            };
            let keypoints = detector.detect_and_extract(&grey)?;
            log::debug!("image {index}: {} keypoints", keypoints.len());
            Ok((keypoints, scale))
        })
        .collect::<Result<Vec<(KeypointSet, (f64, f64))>, StitcherError>>()?;

    let pairs = (1..features.len())
        .into_par_iter()
        .map(|index| -> Result<PairStats, StitcherError> {
            let (previous, previous_scale) = &features[index - 1];
            let (current, current_scale) = &features[index];
            let mut stats = estimate_pair(previous, current, params)?;
            // a failed pair keeps its exact identity, there is no motion to lift
            if !stats.is_failed() {
                stats.transform = utils::adjust_transform_for_scale(
                    &stats.transform,
                    *current_scale,
                    *previous_scale,
                )
                .normalized();
            }
            log::debug!(
                "pair {}-{}: {} matches, {:?} inliers, {:?}",
                index - 1,
                index,
                stats.match_count,
                stats.inlier_count,
                stats.model
            );
            Ok(stats)
        })
        .collect::<Result<Vec<PairStats>, StitcherError>>()?;
    drop(features);

    let stats = PipelineStats::from(pairs);
    if stats.failed_pairs().next().is_some() {
        log::warn!(
            "{} of {} pairs could not be aligned",
            stats.failed_pairs().count(),
            stats.len()
        );
    }

    let local: Vec<Transform> = std::iter::once(Transform::identity())
        .chain(stats.pairs().iter().map(|p| p.transform))
        .collect();
    let chain = build_chain(&local, &sizes)?;
    let canvas = size_canvas(&chain.transforms, &sizes, &params.canvas)?;
    let image = compose(images, &chain.transforms, &canvas)?;

    Ok(Panorama {
        image,
        canvas,
        transforms: chain.transforms,
        anchor: chain.anchor,
        stats,
    })
}
