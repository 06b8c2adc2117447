// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Sizing of the shared output frame.

use super::{CanvasParameters, StitcherError};
use crate::transform::Transform;
use opencv::core::{Point2d, Size};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Axis aligned bounds of a warped image in the global frame.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Extent {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Extent {
    pub fn is_finite(&self) -> bool {
        self.x_min.is_finite()
            && self.x_max.is_finite()
            && self.y_min.is_finite()
            && self.y_max.is_finite()
    }

    pub fn x_mid(&self) -> f64 {
        0.5 * (self.x_min + self.x_max)
    }
}

/// Projects the four corners of a `size` image through `t`.
/// Corners sent to infinity make the extent non-finite.
pub fn project_extent(t: &Transform, size: Size) -> Extent {
    let (w, h) = (size.width as f64, size.height as f64);
    let corners = [
        Point2d::new(0.0, 0.0),
        Point2d::new(w, 0.0),
        Point2d::new(w, h),
        Point2d::new(0.0, h),
    ]
    .map(|p| t.apply(p));
    if corners.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Extent {
            x_min: f64::NAN,
            x_max: f64::NAN,
            y_min: f64::NAN,
            y_max: f64::NAN,
        };
    }
    corners.iter().fold(
        Extent {
            x_min: f64::INFINITY,
            x_max: f64::NEG_INFINITY,
            y_min: f64::INFINITY,
            y_max: f64::NEG_INFINITY,
        },
        |e, p| Extent {
            x_min: e.x_min.min(p.x),
            x_max: e.x_max.max(p.x),
            y_min: e.y_min.min(p.y),
            y_max: e.y_max.max(p.y),
        },
    )
}

/// The resolved output frame: global coordinates `[x_min, x_max] x [y_min, y_max]`
/// rendered at `width` x `height` pixels.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasSpec {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub width: i32,
    pub height: i32,
}

impl CanvasSpec {
    #[inline]
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Maps global coordinates to canvas pixel coordinates.
    pub fn offset(&self) -> Transform {
        Transform::translation(-self.x_min, -self.y_min)
    }
}

/// Computes the canvas covering every image under its global transform.
///
/// The union of the projected extents is clamped to a window of
/// `params.guard_factor` times the largest input width/height, centred on the
/// (lower) median of the projected image centres. Non-finite extents (images sent to
/// infinity) only contribute through that window. The pixel size is the rounded
/// extent, never smaller than 1x1 and never larger than the window.
pub fn size_canvas(
    transforms: &[Transform],
    sizes: &[Size],
    params: &CanvasParameters,
) -> Result<CanvasSpec, StitcherError> {
    if transforms.len() != sizes.len() || sizes.is_empty() {
        return Err(StitcherError::InvalidParams(format!(
            "{} transforms for {} images",
            transforms.len(),
            sizes.len()
        )));
    }
    let max_w = sizes.iter().map(|s| s.width).max().unwrap_or(1).max(1) as f64;
    let max_h = sizes.iter().map(|s| s.height).max().unwrap_or(1).max(1) as f64;
    let limit_w = (params.guard_factor * max_w).floor().max(1.0);
    let limit_h = (params.guard_factor * max_h).floor().max(1.0);

    let extents: Vec<Extent> = transforms
        .iter()
        .zip(sizes.iter())
        .map(|(t, s)| project_extent(t, *s))
        .collect();

    let centres: Vec<Point2d> = transforms
        .iter()
        .zip(sizes.iter())
        .map(|(t, s)| t.apply(Point2d::new(s.width as f64 * 0.5, s.height as f64 * 0.5)))
        .filter(|p| p.x.is_finite() && p.y.is_finite())
        .collect();
    let (cx, cy) = if centres.is_empty() {
        (max_w * 0.5, max_h * 0.5)
    } else {
        (
            median(centres.iter().map(|p| p.x)),
            median(centres.iter().map(|p| p.y)),
        )
    };
    let guard = Extent {
        x_min: cx - 0.5 * limit_w,
        x_max: cx + 0.5 * limit_w,
        y_min: cy - 0.5 * limit_h,
        y_max: cy + 0.5 * limit_h,
    };

    let union = extents
        .iter()
        .filter(|e| e.is_finite())
        .fold(None, |acc: Option<Extent>, e| {
            Some(match acc {
                None => *e,
                Some(a) => Extent {
                    x_min: a.x_min.min(e.x_min),
                    x_max: a.x_max.max(e.x_max),
                    y_min: a.y_min.min(e.y_min),
                    y_max: a.y_max.max(e.y_max),
                },
            })
        });
    if extents.iter().any(|e| !e.is_finite()) {
        log::warn!("some images project to infinity, canvas limited to the guard band");
    }

    let clamped = match union {
        Some(u) => Extent {
            x_min: u.x_min.max(guard.x_min),
            x_max: u.x_max.min(guard.x_max),
            y_min: u.y_min.max(guard.y_min),
            y_max: u.y_max.min(guard.y_max),
        },
        None => guard,
    };
    if clamped != union.unwrap_or(guard) {
        log::warn!(
            "canvas clamped to {}x{} guard band ({:.0}x{:.0} px)",
            params.guard_factor,
            params.guard_factor,
            limit_w,
            limit_h
        );
    }

    let width = pixels(clamped.x_max - clamped.x_min, limit_w);
    let height = pixels(clamped.y_max - clamped.y_min, limit_h);
    let x_min = if clamped.x_min.is_finite() && clamped.x_max > clamped.x_min {
        clamped.x_min
    } else {
        cx - 0.5
    };
    let y_min = if clamped.y_min.is_finite() && clamped.y_max > clamped.y_min {
        clamped.y_min
    } else {
        cy - 0.5
    };

    let canvas = CanvasSpec {
        x_min,
        x_max: x_min + width as f64,
        y_min,
        y_max: y_min + height as f64,
        width,
        height,
    };
    log::info!(
        "canvas {}x{} at ({:.1}, {:.1})",
        canvas.width,
        canvas.height,
        canvas.x_min,
        canvas.y_min
    );
    Ok(canvas)
}

/// Rounded span in pixels, clamped to `[1, limit]`.
fn pixels(span: f64, limit: f64) -> i32 {
    if !span.is_finite() || span <= 0.0 {
        return 1;
    }
    span.round().clamp(1.0, limit) as i32
}

/// Lower median of a non-empty sequence.
fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut v: Vec<OrderedFloat<f64>> = values.map(OrderedFloat).collect();
    v.sort();
    v[(v.len() - 1) / 2].0
}
