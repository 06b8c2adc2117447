// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Keypoint detection and descriptor extraction.
//!
//! The stitching pipeline only needs the [`FeatureDetector`] capability, so any
//! detector whose descriptors support a distance metric can be plugged in.
//! [`BuiltinDetector`] wraps the OpenCV `features2d` detectors.

use super::StitcherError;
use opencv::core::{KeyPoint, Mat, Point2f, Vector};
use opencv::features2d::{AKAZE, ORB, ORB_ScoreType, SIFT};
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single detected feature location.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Keypoint {
    pub location: Point2f,
    /// Detector response, larger is stronger.
    pub strength: f32,
}

/// Keypoints of one image together with their descriptors, one descriptor row per keypoint.
#[derive(Debug, Clone)]
pub struct KeypointSet {
    keypoints: Vec<Keypoint>,
    descriptors: Mat,
}

// `Mat` is not `Sync`, but a `KeypointSet` is never mutated after construction,
// so sharing references between rayon workers is fine.
unsafe impl Sync for KeypointSet {}

impl KeypointSet {
    /// Fails with `InvalidParams` unless there is exactly one descriptor row per keypoint.
    pub fn new(keypoints: Vec<Keypoint>, descriptors: Mat) -> Result<Self, StitcherError> {
        let rows = if descriptors.empty() {
            0
        } else {
            descriptors.rows() as usize
        };
        if rows != keypoints.len() {
            return Err(StitcherError::InvalidParams(format!(
                "{} keypoints but {} descriptor rows",
                keypoints.len(),
                rows
            )));
        }
        Ok(Self {
            keypoints,
            descriptors,
        })
    }

    pub fn empty() -> Self {
        Self {
            keypoints: Vec::new(),
            descriptors: Mat::default(),
        }
    }

    pub(crate) fn from_opencv(
        keypoints: &Vector<KeyPoint>,
        descriptors: Mat,
    ) -> Result<Self, StitcherError> {
        let keypoints = keypoints
            .iter()
            .map(|kp| Keypoint {
                location: kp.pt(),
                strength: kp.response(),
            })
            .collect();
        Self::new(keypoints, descriptors)
    }

    #[inline]
    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    #[inline]
    pub fn descriptors(&self) -> &Mat {
        &self.descriptors
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Something that can find keypoints in a grey image and describe them.
pub trait FeatureDetector {
    /// Name recorded in the stitch metadata.
    fn name(&self) -> &str;

    fn detect(&self, grey: &Mat) -> Result<Vector<KeyPoint>, StitcherError>;

    /// Computes descriptors for `keypoints`. The detector may drop keypoints it
    /// cannot describe, so `keypoints` is updated in place.
    fn extract(&self, grey: &Mat, keypoints: &mut Vector<KeyPoint>)
    -> Result<Mat, StitcherError>;

    fn detect_and_extract(&self, grey: &Mat) -> Result<KeypointSet, StitcherError> {
        let mut keypoints = self.detect(grey)?;
        if keypoints.is_empty() {
            return Ok(KeypointSet::empty());
        }
        let descriptors = self.extract(grey, &mut keypoints)?;
        KeypointSet::from_opencv(&keypoints, descriptors)
    }
}

/// The detector families shipped with OpenCV's `features2d` module.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Binary descriptors, matched with the Hamming norm
    Orb,
    /// Float descriptors, matched with the L2 norm
    Sift,
    /// Binary descriptors, matched with the Hamming norm
    Akaze,
}

impl DetectorKind {
    pub fn name(&self) -> &'static str {
        match self {
            DetectorKind::Orb => "orb",
            DetectorKind::Sift => "sift",
            DetectorKind::Akaze => "akaze",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DetectorKind {
    type Err = StitcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orb" => Ok(DetectorKind::Orb),
            "sift" => Ok(DetectorKind::Sift),
            "akaze" => Ok(DetectorKind::Akaze),
            other => Err(StitcherError::InvalidParams(format!(
                "Unknown detector: {other}"
            ))),
        }
    }
}

/// Creates the OpenCV detector for `$self.kind` and binds it to `$detector` for `$body`.
macro_rules! with_feature2d {
    ($self:expr, $detector:ident => $body:expr) => {
        match $self.kind {
            DetectorKind::Orb => {
                let mut $detector = ORB::create(
                    $self.max_features,
                    1.2,
                    8,
                    31,
                    0,
                    2,
                    ORB_ScoreType::HARRIS_SCORE,
                    31,
                    20,
                )?;
                $body
            }
            DetectorKind::Sift => {
                let mut $detector = SIFT::create_def()?;
                $body
            }
            DetectorKind::Akaze => {
                let mut $detector = AKAZE::create_def()?;
                $body
            }
        }
    };
}

/// An OpenCV detector created on demand for every call.
#[derive(Debug, Copy, Clone)]
pub struct BuiltinDetector {
    pub kind: DetectorKind,
    /// Upper bound on the number of features, only used by ORB.
    pub max_features: i32,
}

impl BuiltinDetector {
    pub fn new(kind: DetectorKind) -> Self {
        Self {
            kind,
            max_features: 2000,
        }
    }
}

impl Default for BuiltinDetector {
    fn default() -> Self {
        Self::new(DetectorKind::Orb)
    }
}

impl FeatureDetector for BuiltinDetector {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn detect(&self, grey: &Mat) -> Result<Vector<KeyPoint>, StitcherError> {
        with_feature2d!(self, detector => {
            let mut kp = Vector::<KeyPoint>::new();
            detector.detect(grey, &mut kp, &Mat::default())?;
            Ok(kp)
        })
    }

    fn extract(
        &self,
        grey: &Mat,
        keypoints: &mut Vector<KeyPoint>,
    ) -> Result<Mat, StitcherError> {
        with_feature2d!(self, detector => {
            let mut des = Mat::default();
            detector.compute(grey, keypoints, &mut des)?;
            Ok(des)
        })
    }

    /// Detects and describes in one OpenCV call.
    fn detect_and_extract(&self, grey: &Mat) -> Result<KeypointSet, StitcherError> {
        with_feature2d!(self, detector => {
            let mut kp = Vector::<KeyPoint>::new();
            let mut des = Mat::default();
            detector.detect_and_compute(grey, &Mat::default(), &mut kp, &mut des, false)?;
            KeypointSet::from_opencv(&kp, des)
        })
    }
}
