// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Non-robust least-squares transform fitting.
//!
//! The `fit_*` functions are shared with the RANSAC estimator, which calls them on
//! minimal samples and again on the final inlier set.

use super::StitcherError;
use crate::transform::{ModelKind, Transform};
use opencv::core::{self, Mat, Point2d};
use opencv::prelude::*;

/// Smallest accepted `|det|` of the 2x2 linear part of a fitted transform.
pub const MIN_LINEAR_DETERMINANT: f64 = 1e-6;
/// Largest accepted condition number of the 2x2 linear part of a fitted transform.
pub const MAX_LINEAR_CONDITION: f64 = 1e6;

/// Rejects transforms that are not finite, not invertible, or whose linear part is
/// near singular or badly conditioned.
pub fn check_linear_health(t: &Transform) -> Result<(), StitcherError> {
    if !t.is_finite() {
        return Err(StitcherError::NumericalDegeneracy(
            "non-finite transform".to_string(),
        ));
    }
    let det = t.linear_determinant();
    if !det.is_finite() || det.abs() < MIN_LINEAR_DETERMINANT {
        return Err(StitcherError::NumericalDegeneracy(format!(
            "determinant of linear part is {det:e}"
        )));
    }
    let cond = t.linear_condition_number();
    if !cond.is_finite() || cond > MAX_LINEAR_CONDITION {
        return Err(StitcherError::NumericalDegeneracy(format!(
            "condition number of linear part is {cond:e}"
        )));
    }
    if t.try_inverse().is_none() {
        return Err(StitcherError::NumericalDegeneracy(
            "transform is not invertible".to_string(),
        ));
    }
    Ok(())
}

/// Fits `src -> dst` and falls back from affine to similarity to identity.
///
/// The affine fit needs three points and is discarded when its linear part fails
/// [`check_linear_health()`]. The similarity fit needs two. Solver failures never
/// escape, they only move the fit down the fallback order.
///
/// ```
/// # use libstitcher::{prelude::*, opencv::core::Point2d};
/// let src = [Point2d::new(0.0, 0.0), Point2d::new(10.0, 0.0), Point2d::new(0.0, 10.0)];
/// let dst: Vec<_> = src.iter().map(|p| Point2d::new(p.x + 4.0, p.y - 2.0)).collect();
/// let t = estimate_direct(&src, &dst);
/// assert!(t.approx_eq(&Transform::translation(4.0, -2.0), 1e-9));
/// ```
pub fn estimate_direct(src: &[Point2d], dst: &[Point2d]) -> Transform {
    estimate_direct_with_model(src, dst).0
}

/// Like [`estimate_direct()`] but also reports which model produced the transform,
/// `None` meaning the identity fallback.
pub fn estimate_direct_with_model(
    src: &[Point2d],
    dst: &[Point2d],
) -> (Transform, Option<ModelKind>) {
    let n = src.len().min(dst.len());
    let (src, dst) = (&src[..n], &dst[..n]);

    for model in [ModelKind::Affine, ModelKind::Similarity] {
        if n < model.min_points() {
            continue;
        }
        match fit_model(model, src, dst).and_then(|t| check_linear_health(&t).map(|_| t)) {
            Ok(t) => return (t, Some(model)),
            Err(e) => log::debug!("direct {model} fit rejected: {e}"),
        }
    }
    log::debug!("direct fit fell back to identity ({n} points)");
    (Transform::identity(), None)
}

/// Least-squares fit of `model` mapping `src` onto `dst`.
pub(crate) fn fit_model(
    model: ModelKind,
    src: &[Point2d],
    dst: &[Point2d],
) -> Result<Transform, StitcherError> {
    if src.len() != dst.len() {
        return Err(StitcherError::InvalidParams(format!(
            "point sets differ in length: {} vs {}",
            src.len(),
            dst.len()
        )));
    }
    if src.len() < model.min_points() {
        return Err(StitcherError::InsufficientCorrespondences {
            model,
            found: src.len(),
            required: model.min_points(),
        });
    }
    // fit in normalised coordinates, then undo the normalisation
    let src_norm = normalization(src)?;
    let dst_norm = normalization(dst)?;
    let ns: Vec<Point2d> = src.iter().map(|p| src_norm.apply(*p)).collect();
    let nd: Vec<Point2d> = dst.iter().map(|p| dst_norm.apply(*p)).collect();

    let t = match model {
        ModelKind::Projective => fit_projective(&ns, &nd)?,
        ModelKind::Affine => fit_affine(&ns, &nd)?,
        ModelKind::Similarity => fit_similarity(&ns, &nd)?,
    };
    let dst_denorm = dst_norm.try_inverse().ok_or_else(|| {
        StitcherError::NumericalDegeneracy("normalisation is not invertible".to_string())
    })?;
    let t = dst_denorm.compose(&t).compose(&src_norm).normalized();
    if !t.is_finite() {
        return Err(StitcherError::NumericalDegeneracy(format!(
            "{model} fit is not finite"
        )));
    }
    Ok(t)
}

/// Similarity transform that moves the centroid to the origin and the mean
/// distance to the origin to `sqrt(2)`.
fn normalization(points: &[Point2d]) -> Result<Transform, StitcherError> {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if !mean_dist.is_finite() || mean_dist < 1e-12 {
        return Err(StitcherError::NumericalDegeneracy(
            "points are coincident".to_string(),
        ));
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Ok(Transform::from_matrix([
        [s, 0.0, -s * cx],
        [0.0, s, -s * cy],
        [0.0, 0.0, 1.0],
    ]))
}

/// Solves the normal equations of `rows * x = rhs`, reporting a singular system
/// as `NumericalDegeneracy`.
fn solve_least_squares<const N: usize>(
    rows: &[[f64; N]],
    rhs: &[f64],
) -> Result<[f64; N], StitcherError> {
    let a = Mat::from_slice_2d(rows)?;
    let b = Mat::from_slice_2d(&rhs.iter().map(|v| [*v]).collect::<Vec<[f64; 1]>>())?;
    let mut x = Mat::default();
    if !core::solve(&a, &b, &mut x, core::DECOMP_LU | core::DECOMP_NORMAL)? {
        return Err(StitcherError::NumericalDegeneracy(
            "singular linear system".to_string(),
        ));
    }
    let mut out = [0.0; N];
    for (i, v) in out.iter_mut().enumerate() {
        *v = *x.at_2d::<f64>(i as i32, 0)?;
    }
    if !out.iter().all(|v| v.is_finite()) {
        return Err(StitcherError::NumericalDegeneracy(
            "non-finite solution".to_string(),
        ));
    }
    Ok(out)
}

/// DLT with `h33 = 1`.
fn fit_projective(src: &[Point2d], dst: &[Point2d]) -> Result<Transform, StitcherError> {
    let mut rows = Vec::with_capacity(src.len() * 2);
    let mut rhs = Vec::with_capacity(src.len() * 2);
    for (p, q) in src.iter().zip(dst.iter()) {
        rows.push([p.x, p.y, 1.0, 0.0, 0.0, 0.0, -q.x * p.x, -q.x * p.y]);
        rhs.push(q.x);
        rows.push([0.0, 0.0, 0.0, p.x, p.y, 1.0, -q.y * p.x, -q.y * p.y]);
        rhs.push(q.y);
    }
    Ok(Transform::projective(solve_least_squares(&rows, &rhs)?))
}

fn fit_affine(src: &[Point2d], dst: &[Point2d]) -> Result<Transform, StitcherError> {
    let mut rows = Vec::with_capacity(src.len() * 2);
    let mut rhs = Vec::with_capacity(src.len() * 2);
    for (p, q) in src.iter().zip(dst.iter()) {
        rows.push([p.x, p.y, 1.0, 0.0, 0.0, 0.0]);
        rhs.push(q.x);
        rows.push([0.0, 0.0, 0.0, p.x, p.y, 1.0]);
        rhs.push(q.y);
    }
    Ok(Transform::affine(solve_least_squares(&rows, &rhs)?))
}

/// `u = a*x - b*y + tx`, `v = b*x + a*y + ty`
fn fit_similarity(src: &[Point2d], dst: &[Point2d]) -> Result<Transform, StitcherError> {
    let mut rows = Vec::with_capacity(src.len() * 2);
    let mut rhs = Vec::with_capacity(src.len() * 2);
    for (p, q) in src.iter().zip(dst.iter()) {
        rows.push([p.x, -p.y, 1.0, 0.0]);
        rhs.push(q.x);
        rows.push([p.y, p.x, 0.0, 1.0]);
        rhs.push(q.y);
    }
    let [a, b, tx, ty] = solve_least_squares(&rows, &rhs)?;
    Ok(Transform::affine([a, -b, tx, b, a, ty]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize, step: f64) -> Vec<Point2d> {
        (0..n * n)
            .map(|i| Point2d::new((i % n) as f64 * step + 3.0, (i / n) as f64 * step + 7.0))
            .collect()
    }

    fn map(t: &Transform, pts: &[Point2d]) -> Vec<Point2d> {
        pts.iter().map(|p| t.apply(*p)).collect()
    }

    #[test]
    fn recovers_affine_exactly() {
        let truth = Transform::affine([1.05, 0.1, 12.0, -0.08, 0.97, -30.0]);
        let src = grid(5, 40.0);
        let dst = map(&truth, &src);
        let (t, model) = estimate_direct_with_model(&src, &dst);
        assert_eq!(model, Some(ModelKind::Affine));
        assert!(t.approx_eq(&truth, 1e-8), "{t}");
    }

    #[test]
    fn repeated_fits_are_identical() {
        let truth = Transform::similarity(0.2, 1.3, -5.0, 8.0);
        let src = grid(4, 25.0);
        let dst = map(&truth, &src);
        let first = estimate_direct(&src, &dst);
        let second = estimate_direct(&src, &dst);
        assert_eq!(first, second);
    }

    #[test]
    fn near_singular_affine_falls_back_to_similarity() {
        let squash = Transform::affine([1.0, 0.0, 0.0, 0.0, 1e-9, 0.0]);
        let src = grid(3, 50.0);
        let dst = map(&squash, &src);
        let affine = fit_model(ModelKind::Affine, &src, &dst).unwrap();
        assert!(affine.linear_determinant().abs() < 1e-6);
        assert!(check_linear_health(&affine).is_err());

        let (t, model) = estimate_direct_with_model(&src, &dst);
        assert_eq!(model, Some(ModelKind::Similarity));
        assert!(check_linear_health(&t).is_ok());
    }

    #[test]
    fn too_few_points() {
        let src = [Point2d::new(0.0, 0.0), Point2d::new(10.0, 0.0)];
        let dst = [Point2d::new(5.0, 5.0), Point2d::new(5.0, 15.0)];
        let (t, model) = estimate_direct_with_model(&src, &dst);
        assert_eq!(model, Some(ModelKind::Similarity));
        let p = t.apply(Point2d::new(10.0, 0.0));
        assert!((p.x - 5.0).abs() < 1e-9 && (p.y - 15.0).abs() < 1e-9);

        let (t, model) = estimate_direct_with_model(&src[..1], &dst[..1]);
        assert_eq!(model, None);
        assert_eq!(t, Transform::identity());
        assert_eq!(estimate_direct(&[], &[]), Transform::identity());
    }

    #[test]
    fn collapsed_target_gives_identity() {
        let src = grid(3, 10.0);
        let dst = vec![Point2d::new(4.0, 4.0); src.len()];
        let (t, model) = estimate_direct_with_model(&src, &dst);
        assert_eq!(model, None);
        assert_eq!(t, Transform::identity());
    }

    #[test]
    fn projective_fit_recovers_homography() {
        let truth = Transform::projective([0.9, 0.05, 20.0, -0.03, 1.1, -4.0, 2e-4, -1e-4]);
        let src = grid(4, 60.0);
        let dst = map(&truth, &src);
        let t = fit_model(ModelKind::Projective, &src, &dst).unwrap();
        assert!(t.approx_eq(&truth, 1e-7), "{t}");
    }

    #[test]
    fn insufficient_points_are_reported() {
        let src = grid(1, 1.0);
        assert!(matches!(
            fit_model(ModelKind::Affine, &src, &src),
            Err(StitcherError::InsufficientCorrespondences { required: 3, found: 1, .. })
        ));
    }
}
