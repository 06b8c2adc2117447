// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! This library assembles an ordered sequence of overlapping photographs into a
//! single panorama, based on OpenCV <https://crates.io/crates/opencv> and
//! Rayon <https://crates.io/crates/rayon>.
//!
//! Copyright (c) 2021, 2025 Eadf <lacklustr@protonmail.com>.
//! License: MIT/Apache 2.0
//!
//! The pipeline runs strictly forward:
//! 1. features are detected in every image ([`detector`]) and matched against the
//!    previous image ([`matcher`]),
//! 2. every adjacent pair gets a local transform, either robustly with model
//!    fallback ([`ransac`]) or by a direct least-squares fit ([`direct`]),
//! 3. the local transforms are folded into one global frame and re-centred on
//!    the median image ([`chain`]),
//! 4. a guarded canvas is sized around the warped images ([`canvas`]), and
//! 5. the images are warped and composited, later images winning overlaps ([`compositor`]).
//!
//! Per-pair failures never abort a run: a pair that cannot be aligned contributes
//! the identity transform and is reported in [`pipeline::PipelineStats`].

pub mod canvas;
pub mod chain;
pub mod compositor;
pub mod detector;
pub mod direct;
pub mod matcher;
pub mod metadata;
pub mod pipeline;
pub mod ransac;
pub mod transform;
pub mod utils;

pub use opencv;
use detector::{BuiltinDetector, DetectorKind};
use opencv::core::Mat;
use opencv::imgcodecs;
use pipeline::Panorama;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use transform::ModelKind;

/// Smallest number of images a panorama can be assembled from.
pub const MIN_IMAGES: usize = 2;

#[derive(Error, Debug)]
pub enum StitcherError {
    #[error(transparent)]
    OpenCvError(#[from] opencv::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error("Not enough images: {found} given, at least {required} needed")]
    NotEnoughImages { found: usize, required: usize },
    #[error("Invalid path encoding {0}")]
    InvalidPathEncoding(PathBuf),
    #[error("Invalid parameter(s) {0}")]
    InvalidParams(String),
    #[error("{model} fit needs {required} correspondences, found {found}")]
    InsufficientCorrespondences {
        model: ModelKind,
        found: usize,
        required: usize,
    },
    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(String),
    #[error("Internal error {0}")]
    ProcessingError(String),
}

/// Parameters for descriptor matching.
#[derive(Debug, Clone, Copy)]
pub struct MatchParameters {
    /// Lowe's ratio test threshold: a match is dropped when its best distance
    /// exceeds `ratio` times the second best distance.
    /// Common values range from 0.6 to 0.8.
    pub ratio: f32,

    /// Absolute distance limit, in the units of the descriptor norm.
    /// The default of 60 suits binary (Hamming) descriptors such as ORB and AKAZE;
    /// [`MatchParameters::for_detector()`] picks `None` for float descriptors such as SIFT.
    pub max_distance: Option<f32>,

    /// Ratio of best matches to keep after sorting by distance.
    /// 1.0 keeps every match that passed the filters.
    pub keep_ratio: f32,
}

impl Default for MatchParameters {
    fn default() -> Self {
        Self {
            ratio: 0.7,
            max_distance: Some(60.0),
            keep_ratio: 1.0,
        }
    }
}

impl MatchParameters {
    /// The defaults, with a distance limit in the units of `detector`'s descriptor norm.
    pub fn for_detector(detector: DetectorKind) -> Self {
        match detector {
            DetectorKind::Orb | DetectorKind::Akaze => Self::default(),
            DetectorKind::Sift => Self {
                max_distance: None,
                ..Self::default()
            },
        }
    }
}

/// Parameters for the RANSAC search in [`ransac::estimate_robust()`].
#[derive(Debug, Clone, Copy)]
pub struct RansacParameters {
    /// Maximum reprojection error, in pixels, for a correspondence to count as inlier.
    /// A lower value makes RANSAC stricter, a higher value is more lenient.
    pub reproj_threshold: f64,

    /// Upper bound on the number of random samples tried.
    pub max_trials: usize,

    /// Probability of having drawn at least one outlier free sample at which the
    /// search stops early.
    pub confidence: f64,

    /// Seed of the sampling RNG, equal seeds give equal results.
    pub seed: u64,
}

impl Default for RansacParameters {
    fn default() -> Self {
        Self {
            reproj_threshold: 3.0,
            max_trials: 5000,
            confidence: 0.999,
            seed: 0x5eed,
        }
    }
}

/// Parameters for [`canvas::size_canvas()`].
#[derive(Debug, Clone, Copy)]
pub struct CanvasParameters {
    /// The canvas never grows beyond `guard_factor` times the largest input
    /// width (height) in each axis.
    pub guard_factor: f64,
}

impl Default for CanvasParameters {
    fn default() -> Self {
        Self { guard_factor: 3.0 }
    }
}

/// How the transform of each adjacent image pair is estimated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimationMethod {
    /// RANSAC with projective → affine → similarity fallback
    Ransac,
    /// Least-squares fit over every correspondence with affine → similarity fallback
    Direct,
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EstimationMethod::Ransac => "ransac",
            EstimationMethod::Direct => "direct",
        })
    }
}

impl FromStr for EstimationMethod {
    type Err = StitcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ransac" => Ok(EstimationMethod::Ransac),
            "direct" => Ok(EstimationMethod::Direct),
            other => Err(StitcherError::InvalidParams(format!(
                "Unknown estimation method: {other}"
            ))),
        }
    }
}

/// Everything [`stitch()`] and [`stitch_images()`] can be told.
#[derive(Debug, Clone, Copy)]
pub struct StitchParameters {
    pub method: EstimationMethod,

    /// Model tried first by [`EstimationMethod::Ransac`].
    pub model: ModelKind,

    pub detector: DetectorKind,

    /// Controls the performance/accuracy trade-off of feature detection:
    /// - `Some(width)`: detect and match on images scaled so their smaller side is `width` pixels
    /// - `None`: detect at full resolution
    ///
    /// Must be smaller than the smaller side of every input image when specified.
    pub feature_scale_width: Option<f32>,

    pub matching: MatchParameters,
    pub ransac: RansacParameters,
    pub canvas: CanvasParameters,
}

impl Default for StitchParameters {
    fn default() -> Self {
        Self {
            method: EstimationMethod::Ransac,
            model: ModelKind::Projective,
            detector: DetectorKind::Orb,
            feature_scale_width: None,
            matching: MatchParameters::default(),
            ransac: RansacParameters::default(),
            canvas: CanvasParameters::default(),
        }
    }
}

impl StitchParameters {
    /// The defaults, with matching tuned for `detector`.
    pub fn with_detector(detector: DetectorKind) -> Self {
        Self {
            detector,
            matching: MatchParameters::for_detector(detector),
            ..Self::default()
        }
    }

    /// Rejects values no run could work with.
    pub fn validate(&self) -> Result<(), StitcherError> {
        let m = &self.matching;
        if !(m.ratio > 0.0 && m.ratio <= 1.0) {
            return Err(StitcherError::InvalidParams(format!(
                "match ratio must be in (0, 1], got {}",
                m.ratio
            )));
        }
        if !(m.keep_ratio > 0.0 && m.keep_ratio <= 1.0) {
            return Err(StitcherError::InvalidParams(format!(
                "keep ratio must be in (0, 1], got {}",
                m.keep_ratio
            )));
        }
        if m.max_distance.is_some_and(|d| !d.is_finite() || d < 0.0) {
            return Err(StitcherError::InvalidParams(format!(
                "max match distance must be finite and positive, got {:?}",
                m.max_distance
            )));
        }
        if self.detector == DetectorKind::Sift && m.max_distance.is_some_and(|d| d < 100.0) {
            log::warn!(
                "max match distance {:?} is in Hamming units, SIFT descriptors will rarely match",
                m.max_distance
            );
        }
        let r = &self.ransac;
        if !r.reproj_threshold.is_finite() || r.reproj_threshold <= 0.0 {
            return Err(StitcherError::InvalidParams(format!(
                "reprojection threshold must be positive, got {}",
                r.reproj_threshold
            )));
        }
        if r.max_trials == 0 {
            return Err(StitcherError::InvalidParams(
                "max_trials must be at least 1".to_string(),
            ));
        }
        if !(r.confidence > 0.0 && r.confidence < 1.0) {
            return Err(StitcherError::InvalidParams(format!(
                "confidence must be in (0, 1), got {}",
                r.confidence
            )));
        }
        if !self.canvas.guard_factor.is_finite() || self.canvas.guard_factor < 1.0 {
            return Err(StitcherError::InvalidParams(format!(
                "canvas guard factor must be at least 1, got {}",
                self.canvas.guard_factor
            )));
        }
        if let Some(w) = self.feature_scale_width {
            if !w.is_finite() || w <= 10.0 {
                return Err(StitcherError::InvalidParams(format!(
                    "feature_scale_width was too small: {w}"
                )));
            }
        }
        Ok(())
    }
}

/// Loads the images in `files` and stitches them, in the given order, into one panorama.
///
/// # Parameters
/// - `files`: An iterator of paths to image files (any type implementing `AsRef<Path>`),
///   ordered so that neighbours overlap
/// - `params`: see [`StitchParameters`]
///
/// # Returns
/// - `Ok(Panorama)`: the composited raster together with the global transforms,
///   the canvas and the per-pair statistics
/// - `Err(StitcherError)` on failure cases:
///   - fewer than two files
///   - invalid parameters
///   - image loading failures
///
/// Pairs that cannot be aligned do not fail the run, they are placed without
/// relative motion and reported in [`pipeline::PipelineStats::failed_pairs()`].
///
/// ```rust,no_run
/// # use libstitcher::prelude::*;
/// # fn f() -> Result<(),StitcherError> {
/// let panorama = stitch(
///     vec!["1.jpg", "2.jpg", "3.jpg"],
///     StitchParameters {
///         method: EstimationMethod::Ransac,
///         model: ModelKind::Projective,
///         feature_scale_width: Some(600.0),
///         ..Default::default()
///     },
/// )?;
/// println!("{} failed pairs", panorama.stats.failed_pairs().count());
/// # Ok(())}
/// ```
pub fn stitch<I, P>(files: I, params: StitchParameters) -> Result<Panorama, StitcherError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<std::path::Path>,
{
    let files: Vec<PathBuf> = files.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
    if files.len() < MIN_IMAGES {
        return Err(StitcherError::NotEnoughImages {
            found: files.len(),
            required: MIN_IMAGES,
        });
    }
    params.validate()?;
    let images = files
        .par_iter()
        .map(|f| utils::imread(f, imgcodecs::IMREAD_COLOR))
        .collect::<Result<Vec<Mat>, StitcherError>>()?;
    stitch_images(&images, &params)
}

/// Stitches already loaded images with the [`BuiltinDetector`] named by `params.detector`.
pub fn stitch_images(images: &[Mat], params: &StitchParameters) -> Result<Panorama, StitcherError> {
    let detector = BuiltinDetector::new(params.detector);
    pipeline::stitch_images_with(images, &detector, params)
}

pub mod prelude {
    pub use super::{
        CanvasParameters, EstimationMethod, MIN_IMAGES, MatchParameters, RansacParameters,
        StitchParameters, StitcherError,
        canvas::{CanvasSpec, size_canvas},
        chain::{TransformChain, build_chain},
        compositor::compose,
        detector::{BuiltinDetector, DetectorKind, FeatureDetector, KeypointSet},
        direct::estimate_direct,
        matcher::{Correspondence, match_descriptors},
        metadata::StitchMetadata,
        pipeline::{Panorama, PipelineStats, stitch_images_with},
        ransac::{estimate_robust, estimate_robust_with_fallback},
        stitch, stitch_images,
        transform::{ModelKind, Transform},
    };
}
