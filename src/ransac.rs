// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Robust transform estimation by random sample consensus.

use super::{RansacParameters, StitcherError};
use crate::direct::{check_linear_health, fit_model};
use crate::transform::{ModelKind, Transform};
use opencv::core::Point2d;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;

/// Outcome of a single-model RANSAC run.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RobustEstimate {
    /// `None` when no consensus could be found
    pub transform: Option<Transform>,
    pub inlier_count: usize,
}

impl RobustEstimate {
    fn none() -> Self {
        Self {
            transform: None,
            inlier_count: 0,
        }
    }
}

/// Outcome of [`estimate_robust_with_fallback()`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FallbackEstimate {
    pub transform: Option<Transform>,
    /// The model that produced `transform`
    pub model: Option<ModelKind>,
    pub inlier_count: usize,
}

/// Fits `model` mapping `src` onto `dst` with RANSAC.
///
/// Each trial fits the model to a random minimal sample and counts the
/// correspondences that reproject within `params.reproj_threshold` pixels. The
/// trial with the most inliers wins and is refined by a least-squares fit over its
/// inliers. The search ends after `params.max_trials` trials, or earlier once
/// `params.confidence` is reached. Degenerate samples (coincident or collinear
/// points, ill-conditioned fits) are skipped but still count as trials.
///
/// Too few points, or no usable sample at all, give `transform: None` and zero
/// inliers. Only point sets of different length are an error.
pub fn estimate_robust(
    src: &[Point2d],
    dst: &[Point2d],
    model: ModelKind,
    params: &RansacParameters,
) -> Result<RobustEstimate, StitcherError> {
    if src.len() != dst.len() {
        return Err(StitcherError::InvalidParams(format!(
            "point sets differ in length: {} vs {}",
            src.len(),
            dst.len()
        )));
    }
    let sample_size = model.min_points();
    let n = src.len();
    if n < sample_size {
        log::debug!("{model}: {n} points, {sample_size} required");
        return Ok(RobustEstimate::none());
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<(Transform, usize)> = None;
    let mut needed = params.max_trials;
    let mut trials = 0_usize;
    let mut skipped = 0_usize;
    let mut sample_src = Vec::with_capacity(sample_size);
    let mut sample_dst = Vec::with_capacity(sample_size);

    while trials < needed {
        trials += 1;
        sample_src.clear();
        sample_dst.clear();
        for i in sample(&mut rng, n, sample_size).iter() {
            sample_src.push(src[i]);
            sample_dst.push(dst[i]);
        }
        if is_degenerate_sample(&sample_src) || is_degenerate_sample(&sample_dst) {
            skipped += 1;
            continue;
        }
        let candidate = match fit_model(model, &sample_src, &sample_dst)
            .and_then(|t| check_linear_health(&t).map(|_| t))
        {
            Ok(t) => t,
            Err(StitcherError::NumericalDegeneracy(_)) => {
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        let inliers = count_inliers(&candidate, src, dst, params.reproj_threshold);
        if best.as_ref().is_none_or(|(_, b)| inliers > *b) {
            best = Some((candidate, inliers));
            needed = required_trials(
                inliers as f64 / n as f64,
                sample_size,
                params.confidence,
                params.max_trials,
            );
        }
    }

    let Some((candidate, inliers)) = best.filter(|(_, inliers)| *inliers >= sample_size) else {
        log::debug!("{model}: no consensus after {trials} trials ({skipped} degenerate)");
        return Ok(RobustEstimate::none());
    };

    // least-squares refinement over the consensus set
    let (inlier_src, inlier_dst): (Vec<Point2d>, Vec<Point2d>) = src
        .iter()
        .zip(dst.iter())
        .filter(|(p, q)| is_inlier(&candidate, p, q, params.reproj_threshold))
        .map(|(p, q)| (*p, *q))
        .unzip();
    let (transform, inlier_count) = match fit_model(model, &inlier_src, &inlier_dst)
        .and_then(|t| check_linear_health(&t).map(|_| t))
    {
        Ok(refined) => {
            let refined_inliers = count_inliers(&refined, src, dst, params.reproj_threshold);
            if refined_inliers >= inliers {
                (refined, refined_inliers)
            } else {
                (candidate, inliers)
            }
        }
        Err(StitcherError::NumericalDegeneracy(_)) => (candidate, inliers),
        Err(e) => return Err(e),
    };
    log::debug!(
        "{model}: {inlier_count}/{n} inliers after {trials} trials ({skipped} degenerate)"
    );
    Ok(RobustEstimate {
        transform: Some(transform),
        inlier_count,
    })
}

/// Runs [`estimate_robust()`] starting at `model` and moving down
/// projective → affine → similarity until one of them produces a transform.
///
/// When every model fails the result has no transform and zero inliers. The caller
/// decides what to substitute.
///
/// ```
/// # use libstitcher::{prelude::*, opencv::core::Point2d};
/// // three correspondences are not enough for a homography, but an affine fit works
/// let src = [Point2d::new(0.0, 0.0), Point2d::new(40.0, 0.0), Point2d::new(0.0, 30.0)];
/// let dst: Vec<_> = src.iter().map(|p| Point2d::new(p.x + 2.0, p.y + 1.0)).collect();
/// let params = RansacParameters::default();
/// assert!(estimate_robust(&src, &dst, ModelKind::Projective, &params)?.transform.is_none());
/// let est = estimate_robust_with_fallback(&src, &dst, ModelKind::Projective, &params)?;
/// assert_eq!(est.model, Some(ModelKind::Affine));
/// assert_eq!(est.inlier_count, 3);
/// # Ok::<(), StitcherError>(())
/// ```
pub fn estimate_robust_with_fallback(
    src: &[Point2d],
    dst: &[Point2d],
    model: ModelKind,
    params: &RansacParameters,
) -> Result<FallbackEstimate, StitcherError> {
    let mut current = Some(model);
    while let Some(m) = current {
        let estimate = estimate_robust(src, dst, m, params)?;
        if let Some(transform) = estimate.transform {
            if m != model {
                log::info!("{model} estimation failed, fell back to {m}");
            }
            return Ok(FallbackEstimate {
                transform: Some(transform),
                model: Some(m),
                inlier_count: estimate.inlier_count,
            });
        }
        current = m.fallback();
    }
    Ok(FallbackEstimate {
        transform: None,
        model: None,
        inlier_count: 0,
    })
}

/// Standard RANSAC trial count for reaching `confidence` given the inlier ratio.
pub(crate) fn required_trials(
    inlier_ratio: f64,
    sample_size: usize,
    confidence: f64,
    max_trials: usize,
) -> usize {
    let p_good = inlier_ratio.powi(sample_size as i32);
    if p_good >= 1.0 {
        return 1;
    }
    if p_good <= 0.0 {
        return max_trials;
    }
    let n = (1.0 - confidence).ln() / (1.0 - p_good).ln();
    if !n.is_finite() {
        return max_trials;
    }
    (n.ceil() as usize).clamp(1, max_trials)
}

#[inline]
fn is_inlier(t: &Transform, p: &Point2d, q: &Point2d, threshold: f64) -> bool {
    let r = t.apply(*p);
    let err = ((r.x - q.x).powi(2) + (r.y - q.y).powi(2)).sqrt();
    // NaN compares false
    err < threshold
}

fn count_inliers(t: &Transform, src: &[Point2d], dst: &[Point2d], threshold: f64) -> usize {
    src.iter()
        .zip(dst.iter())
        .filter(|(p, q)| is_inlier(t, p, q, threshold))
        .count()
}

/// Coincident points, or any three collinear points, cannot support a fit.
fn is_degenerate_sample(points: &[Point2d]) -> bool {
    for (i, a) in points.iter().enumerate() {
        for (j, b) in points.iter().enumerate().skip(i + 1) {
            if (b.x - a.x).powi(2) + (b.y - a.y).powi(2) < 1e-12 {
                return true;
            }
            for c in points.iter().skip(j + 1) {
                let (abx, aby) = (b.x - a.x, b.y - a.y);
                let (acx, acy) = (c.x - a.x, c.y - a.y);
                let cross = abx * acy - aby * acx;
                let scale = (abx * abx + aby * aby).max(acx * acx + acy * acy);
                if cross.abs() <= 1e-9 * scale {
                    return true;
                }
            }
        }
    }
    false
}
