//! Open-set acceptance: decide whether a classifier prediction is trusted
//! or reported as [`UNKNOWN_LABEL`].

use crate::classifier::{IdentityClassifier, Prediction};
use crate::reduction::{Projection, ReductionError};
use crate::types::{ReducedVector, UNKNOWN_LABEL};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_THRESHOLD: f32 = 3.0;

/// How the acceptance distance is measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionMode {
    /// Distance to the projection of the classifier's support vector 0.
    ///
    /// A single arbitrary anchor with no class structure. Kept as the
    /// default because existing thresholds were tuned against it.
    #[default]
    LegacyAnchor,
    /// Distance to the nearest per-class support-vector centroid.
    NearestCentroid,
}

impl fmt::Display for RejectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectionMode::LegacyAnchor => "legacy-anchor",
            RejectionMode::NearestCentroid => "nearest-centroid",
        })
    }
}

impl FromStr for RejectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy-anchor" => Ok(RejectionMode::LegacyAnchor),
            "nearest-centroid" => Ok(RejectionMode::NearestCentroid),
            other => Err(format!(
                "unknown rejection mode {other:?} (expected legacy-anchor or nearest-centroid)"
            )),
        }
    }
}

#[derive(Error, Debug)]
pub enum AcceptanceError {
    #[error("classifier has no support vectors to anchor on")]
    NoAnchor,
    #[error("anchor projection: {0}")]
    Projection(#[from] ReductionError),
    #[error("anchor has {expected} dims, reduced vector has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Acceptance distance of `reduced` under `mode`.
///
/// Legacy mode projects support vector 0 through `projection` on every
/// call, so an artifact pair with inconsistent dimensions fails here.
pub fn acceptance_distance<C: IdentityClassifier + ?Sized>(
    mode: RejectionMode,
    reduced: &ReducedVector,
    classifier: &C,
    projection: &Projection,
) -> Result<f32, AcceptanceError> {
    match mode {
        RejectionMode::LegacyAnchor => {
            let sv = classifier.support_vector(0).ok_or(AcceptanceError::NoAnchor)?;
            let anchor = projection.project(&sv)?;
            checked_distance(reduced, &anchor.values)
        }
        RejectionMode::NearestCentroid => {
            let centroids = classifier.class_centroids();
            if centroids.is_empty() {
                return Err(AcceptanceError::NoAnchor);
            }
            centroids
                .iter()
                .map(|c| checked_distance(reduced, c))
                .try_fold(f32::INFINITY, |best, d| d.map(|d| best.min(d)))
        }
    }
}

fn checked_distance(reduced: &ReducedVector, anchor: &[f32]) -> Result<f32, AcceptanceError> {
    if anchor.len() != reduced.len() {
        return Err(AcceptanceError::DimensionMismatch {
            expected: anchor.len(),
            actual: reduced.len(),
        });
    }
    Ok(reduced.euclidean_distance(anchor))
}

/// Strict acceptance: equality rejects, NaN rejects.
pub fn is_accepted(distance: f32, threshold: f32) -> bool {
    distance < threshold
}

/// Label and confidence to report for `prediction` at `distance`.
pub fn decide(prediction: &Prediction, distance: f32, threshold: f32) -> (String, f32) {
    if is_accepted(distance, threshold) {
        (prediction.label.clone(), prediction.confidence())
    } else {
        (UNKNOWN_LABEL.to_string(), 0.0)
    }
}
