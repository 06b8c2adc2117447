// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Folding pairwise transforms into one global frame.

use super::StitcherError;
use crate::canvas::project_extent;
use crate::transform::Transform;
use opencv::core::Size;
use ordered_float::OrderedFloat;

/// Global transforms of every image, re-anchored at `anchor`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformChain {
    /// One transform per image, mapping image pixels into the global frame
    pub transforms: Vec<Transform>,
    /// Index of the image whose transform is the identity
    pub anchor: usize,
}

/// Composes local transforms into global ones: `global[0] = local[0]` and
/// `global[n] = global[n-1] ∘ local[n]`.
///
/// `local[n]` maps image `n` onto image `n-1`, `local[0]` is normally the identity.
pub fn compose_chain(local: &[Transform]) -> Vec<Transform> {
    local
        .iter()
        .scan(Transform::identity(), |global, t| {
            *global = global.compose(t).normalized();
            Some(*global)
        })
        .collect()
}

/// Index of the image with the median horizontal position.
///
/// Images are ranked by the midpoint of their projected horizontal extent; for an
/// even count the lower median is chosen. Images projected to infinity are not ranked.
pub fn median_anchor(global: &[Transform], sizes: &[Size]) -> usize {
    let mut order: Vec<(OrderedFloat<f64>, usize)> = global
        .iter()
        .zip(sizes.iter())
        .enumerate()
        .map(|(i, (t, s))| (i, project_extent(t, *s)))
        .filter(|(_, e)| e.is_finite())
        .map(|(i, e)| (OrderedFloat(e.x_mid()), i))
        .collect();
    if order.is_empty() {
        return 0;
    }
    order.sort();
    order[(order.len() - 1) / 2].1
}

/// Re-expresses every transform relative to `anchor`: `anchor⁻¹ ∘ global[n]`.
///
/// Returns `None` when the anchor transform is not invertible.
pub fn recenter(global: &[Transform], anchor: usize) -> Option<Vec<Transform>> {
    let inverse = global.get(anchor)?.try_inverse()?;
    Some(
        global
            .iter()
            .map(|t| inverse.compose(t).normalized())
            .collect(),
    )
}

/// Builds the global chain from per-image local transforms and re-centres it on
/// the median image.
///
/// A failed pair is expected to carry the identity as its local transform, so it
/// simply contributes no relative motion.
pub fn build_chain(local: &[Transform], sizes: &[Size]) -> Result<TransformChain, StitcherError> {
    if local.len() != sizes.len() {
        return Err(StitcherError::InvalidParams(format!(
            "{} local transforms for {} images",
            local.len(),
            sizes.len()
        )));
    }
    let global = compose_chain(local);
    let anchor = median_anchor(&global, sizes);
    match recenter(&global, anchor) {
        Some(transforms) => {
            log::info!("chain of {} images anchored at image {}", transforms.len(), anchor);
            Ok(TransformChain { transforms, anchor })
        }
        None => {
            log::warn!("transform of image {anchor} is not invertible, chain is not re-centred");
            Ok(TransformChain {
                transforms: global,
                anchor: 0,
            })
        }
    }
}
