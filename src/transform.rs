// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! The 3x3 homogeneous [`Transform`] value type and the [`ModelKind`] tag used to
//! select which family of transform an estimator fits.

use super::StitcherError;
use crate::utils::MatExt;
use opencv::core::{Mat, Point2d};
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The transform families an estimator can fit, ordered from most to least
/// degrees of freedom.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Full 8 DOF homography
    Projective,
    /// 6 DOF, no perspective terms
    Affine,
    /// Rotation, uniform scale and translation (4 DOF)
    Similarity,
}

impl ModelKind {
    /// Number of correspondences needed for a minimal fit.
    pub fn min_points(&self) -> usize {
        match self {
            ModelKind::Projective => 4,
            ModelKind::Affine => 3,
            ModelKind::Similarity => 2,
        }
    }

    /// The next simpler model to try when this one cannot be estimated.
    pub fn fallback(&self) -> Option<ModelKind> {
        match self {
            ModelKind::Projective => Some(ModelKind::Affine),
            ModelKind::Affine => Some(ModelKind::Similarity),
            ModelKind::Similarity => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Projective => "projective",
            ModelKind::Affine => "affine",
            ModelKind::Similarity => "similarity",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = StitcherError;

    /// ```
    /// # use libstitcher::prelude::*;
    /// assert_eq!("homography".parse::<ModelKind>().unwrap(), ModelKind::Projective);
    /// assert_eq!("Affine".parse::<ModelKind>().unwrap(), ModelKind::Affine);
    /// assert!("perspective-ish".parse::<ModelKind>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "projective" | "homography" => Ok(ModelKind::Projective),
            "affine" => Ok(ModelKind::Affine),
            "similarity" => Ok(ModelKind::Similarity),
            other => Err(StitcherError::InvalidParams(format!(
                "Unknown model kind: {other}"
            ))),
        }
    }
}

/// A 2D projective map stored as a row-major 3x3 homogeneous matrix.
///
/// Transforms are plain values: composing or inverting produces a new `Transform`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transform {
    m: [[f64; 3]; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub const fn identity() -> Self {
        Self {
            m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    pub const fn from_matrix(m: [[f64; 3]; 3]) -> Self {
        Self { m }
    }

    pub fn translation(tx: f64, ty: f64) -> Self {
        Self::from_matrix([[1.0, 0.0, tx], [0.0, 1.0, ty], [0.0, 0.0, 1.0]])
    }

    pub fn scale(sx: f64, sy: f64) -> Self {
        Self::from_matrix([[sx, 0.0, 0.0], [0.0, sy, 0.0], [0.0, 0.0, 1.0]])
    }

    /// Rotation by `angle` radians and uniform `scale`, followed by a translation.
    pub fn similarity(angle: f64, scale: f64, tx: f64, ty: f64) -> Self {
        let a = scale * angle.cos();
        let b = scale * angle.sin();
        Self::from_matrix([[a, -b, tx], [b, a, ty], [0.0, 0.0, 1.0]])
    }

    /// Affine transform from `[a, b, tx, c, d, ty]`.
    pub fn affine(p: [f64; 6]) -> Self {
        Self::from_matrix([[p[0], p[1], p[2]], [p[3], p[4], p[5]], [0.0, 0.0, 1.0]])
    }

    /// Homography from the first eight row-major entries, the last one being 1.
    pub fn projective(p: [f64; 8]) -> Self {
        Self::from_matrix([[p[0], p[1], p[2]], [p[3], p[4], p[5]], [p[6], p[7], 1.0]])
    }

    #[inline]
    pub fn matrix(&self) -> &[[f64; 3]; 3] {
        &self.m
    }

    /// `self ∘ other`: `other` is applied first.
    pub fn compose(&self, other: &Transform) -> Transform {
        let a = &self.m;
        let b = &other.m;
        let mut m = [[0.0; 3]; 3];
        for (r, row) in m.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = a[r][0] * b[0][c] + a[r][1] * b[1][c] + a[r][2] * b[2][c];
            }
        }
        Transform { m }
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.m;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Inverse via the adjugate, `None` if the matrix is singular or not finite.
    pub fn try_inverse(&self) -> Option<Transform> {
        let det = self.determinant();
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        let m = &self.m;
        let inv_det = 1.0 / det;
        let inv = [
            [
                (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
                (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
                (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
            ],
            [
                (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
                (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
                (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
            ],
            [
                (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
                (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
                (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
            ],
        ];
        Some(Transform { m: inv }.normalized())
    }

    /// Scales the matrix so the bottom-right entry is 1, when that entry is usable.
    pub fn normalized(&self) -> Transform {
        let w = self.m[2][2];
        if !w.is_finite() || w.abs() < f64::EPSILON {
            return *self;
        }
        let mut m = self.m;
        m.iter_mut().flatten().for_each(|v| *v /= w);
        Transform { m }
    }

    /// Maps a point. Points sent to infinity come back as NaN.
    pub fn apply(&self, p: Point2d) -> Point2d {
        let m = &self.m;
        let w = m[2][0] * p.x + m[2][1] * p.y + m[2][2];
        if w.abs() < f64::EPSILON {
            return Point2d::new(f64::NAN, f64::NAN);
        }
        Point2d::new(
            (m[0][0] * p.x + m[0][1] * p.y + m[0][2]) / w,
            (m[1][0] * p.x + m[1][1] * p.y + m[1][2]) / w,
        )
    }

    pub fn translation_components(&self) -> (f64, f64) {
        (self.m[0][2], self.m[1][2])
    }

    /// Determinant of the upper-left 2x2 linear part.
    pub fn linear_determinant(&self) -> f64 {
        self.m[0][0] * self.m[1][1] - self.m[0][1] * self.m[1][0]
    }

    /// Ratio of the largest to the smallest singular value of the 2x2 linear part.
    pub fn linear_condition_number(&self) -> f64 {
        let (a, b, c, d) = (self.m[0][0], self.m[0][1], self.m[1][0], self.m[1][1]);
        let s = a * a + b * b + c * c + d * d;
        let det = (a * d - b * c).abs();
        let disc = (s * s - 4.0 * det * det).max(0.0).sqrt();
        let s_max = ((s + disc) * 0.5).sqrt();
        let s_min_sq = (s - disc) * 0.5;
        if s_min_sq <= 0.0 {
            return f64::INFINITY;
        }
        s_max / s_min_sq.sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.m.iter().flatten().all(|v| v.is_finite())
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        self.approx_eq(&Transform::identity(), tolerance)
    }

    /// Element-wise comparison after normalisation.
    pub fn approx_eq(&self, other: &Transform, tolerance: f64) -> bool {
        let a = self.normalized();
        let b = other.normalized();
        a.m.iter()
            .flatten()
            .zip(b.m.iter().flatten())
            .all(|(x, y)| (x - y).abs() <= tolerance)
    }

    /// Returns the transform as a 3x3 `CV_64F` `Mat`, ready for `warp_perspective()`.
    pub fn to_mat(&self) -> Result<Mat, StitcherError> {
        Ok(Mat::from_slice_2d(&self.m[..])?)
    }

    /// Reads a 3x3 (or 2x3 affine) `Mat` of any float depth.
    pub fn from_mat(mat: &Mat) -> Result<Self, StitcherError> {
        let rows = mat.rows();
        if mat.cols() != 3 || !(rows == 2 || rows == 3) {
            return Err(StitcherError::InvalidParams(format!(
                "Expected a 3x3 or 2x3 matrix, got {}x{}",
                rows,
                mat.cols()
            )));
        }
        let mat = mat.convert(opencv::core::CV_64F, 1.0, 0.0)?;
        let mut m = Transform::identity().m;
        for (r, row) in m.iter_mut().enumerate().take(rows as usize) {
            for (c, v) in row.iter_mut().enumerate() {
                *v = *mat.at_2d::<f64>(r as i32, c as i32)?;
            }
        }
        Ok(Transform { m })
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.m;
        write!(
            f,
            "[[{:.4}, {:.4}, {:.2}], [{:.4}, {:.4}, {:.2}], [{:.6}, {:.6}, {:.4}]]",
            m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const EPS: f64 = 1e-9;

    fn close(a: Point2d, x: f64, y: f64) -> bool {
        (a.x - x).abs() < EPS && (a.y - y).abs() < EPS
    }

    #[test]
    fn compose_applies_right_operand_first() {
        let t = Transform::translation(5.0, 3.0);
        let s = Transform::scale(2.0, 2.0);
        // scale then translate
        let p = t.compose(&s).apply(Point2d::new(1.0, 1.0));
        assert!(close(p, 7.0, 5.0));
        // translate then scale
        let p = s.compose(&t).apply(Point2d::new(1.0, 1.0));
        assert!(close(p, 12.0, 8.0));
    }

    #[test]
    fn inverse_round_trips() {
        let transforms = [
            Transform::translation(-4.0, 9.5),
            Transform::similarity(0.3, 1.7, 10.0, -2.0),
            Transform::affine([1.1, 0.2, 5.0, -0.1, 0.9, -3.0]),
            Transform::projective([1.0, 0.1, 3.0, -0.05, 0.95, 1.0, 1e-4, -2e-4]),
        ];
        for t in transforms {
            let inv = t.try_inverse().unwrap();
            assert!(inv.compose(&t).is_identity(1e-9), "{t}");
            let p = inv.apply(t.apply(Point2d::new(12.0, -7.0)));
            assert!(close(p, 12.0, -7.0));
        }
    }

    #[test]
    fn singular_matrix_has_no_inverse() {
        let t = Transform::affine([1.0, 2.0, 0.0, 2.0, 4.0, 0.0]);
        assert!(t.try_inverse().is_none());
    }

    #[test]
    fn similarity_rotates_and_scales() {
        let t = Transform::similarity(PI / 2.0, 2.0, 1.0, 0.0);
        let p = t.apply(Point2d::new(1.0, 0.0));
        assert!(close(p, 1.0, 2.0));
        assert!((t.linear_determinant() - 4.0).abs() < EPS);
        assert!((t.linear_condition_number() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn condition_number_of_anisotropic_scale() {
        let t = Transform::scale(100.0, 0.5);
        assert!((t.linear_condition_number() - 200.0).abs() < 1e-6);
        assert!(Transform::scale(1.0, 0.0).linear_condition_number().is_infinite());
    }

    #[test]
    fn points_at_infinity_are_nan() {
        let t = Transform::projective([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, -0.125, 0.0]);
        let p = t.apply(Point2d::new(8.0, 5.0));
        assert!(p.x.is_nan() && p.y.is_nan());
    }

    #[test]
    fn model_kind_fallback_order() {
        assert_eq!(ModelKind::Projective.fallback(), Some(ModelKind::Affine));
        assert_eq!(ModelKind::Affine.fallback(), Some(ModelKind::Similarity));
        assert_eq!(ModelKind::Similarity.fallback(), None);
        assert_eq!(ModelKind::Projective.min_points(), 4);
        assert_eq!(ModelKind::Affine.min_points(), 3);
        assert_eq!(ModelKind::Similarity.min_points(), 2);
    }

    #[test]
    fn mat_round_trip() {
        let t = Transform::affine([1.5, 0.25, -3.0, 0.1, 0.8, 7.0]);
        let mat = t.to_mat().unwrap();
        assert_eq!(mat.rows(), 3);
        assert_eq!(mat.cols(), 3);
        assert_eq!(Transform::from_mat(&mat).unwrap(), t);
    }

    #[test]
    fn serializes_as_plain_matrix() {
        let json = serde_json::to_string(&Transform::translation(2.0, 3.0)).unwrap();
        assert_eq!(json, "[[1.0,0.0,2.0],[0.0,1.0,3.0],[0.0,0.0,1.0]]");
    }
}
