// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! A record of how a panorama was produced, so a run can be reproduced or audited.

use super::{EstimationMethod, StitchParameters, StitcherError};
use crate::canvas::CanvasSpec;
use crate::pipeline::{Panorama, PairStats};
use crate::transform::{ModelKind, Transform};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchMetadata {
    /// Input files in stitching order
    pub files: Vec<String>,
    pub detector: String,
    pub method: EstimationMethod,
    pub model: ModelKind,
    pub ransac_seed: u64,
    pub anchor: usize,
    pub canvas: CanvasSpec,
    /// Global transform of every image
    pub transforms: Vec<Transform>,
    /// Entry `k` describes images `k` and `k + 1`
    pub pairs: Vec<PairStats>,
}

impl StitchMetadata {
    pub fn new<P: AsRef<Path>>(
        files: &[P],
        detector: &str,
        params: &StitchParameters,
        panorama: &Panorama,
    ) -> Self {
        Self {
            files: files
                .iter()
                .map(|f| f.as_ref().to_string_lossy().into_owned())
                .collect(),
            detector: detector.to_string(),
            method: params.method,
            model: params.model,
            ransac_seed: params.ransac.seed,
            anchor: panorama.anchor,
            canvas: panorama.canvas,
            transforms: panorama.transforms.clone(),
            pairs: panorama.stats.pairs().to_vec(),
        }
    }

    pub fn to_json(&self) -> Result<String, StitcherError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, StitcherError> {
        Ok(serde_json::from_str(json)?)
    }
}
