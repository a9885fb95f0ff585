//! Precomputed linear projection (PCA) from descriptor space to the
//! classifier's input space.

use crate::types::ReducedVector;
use ndarray::{Array1, Array2, ArrayView1};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReductionError {
    #[error("projection expects {expected}-dim input, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("malformed projection artifact: {0}")]
    Malformed(String),
    #[error("failed to read projection artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse projection artifact: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk PCA parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectionArtifact {
    pub mean: Vec<f32>,
    /// One row per output component, each `mean.len()` long.
    pub components: Vec<Vec<f32>>,
    #[serde(default)]
    pub explained_variance: Option<Vec<f32>>,
    #[serde(default)]
    pub whiten: bool,
}

/// Fitted projection: `(x - mean) · componentsᵀ`, optionally whitened.
#[derive(Debug, Clone)]
pub struct Projection {
    mean: Array1<f32>,
    components: Array2<f32>,
    /// Per-component divisor when whitening.
    whitening: Option<Array1<f32>>,
}

impl Projection {
    pub fn load(path: &Path) -> Result<Self, ReductionError> {
        let text = std::fs::read_to_string(path)?;
        let artifact: ProjectionArtifact = serde_json::from_str(&text)?;
        let projection = Self::from_artifact(artifact)?;
        tracing::info!(
            path = %path.display(),
            input_dim = projection.input_dim(),
            output_dim = projection.output_dim(),
            whiten = projection.whitening.is_some(),
            "loaded projection"
        );
        Ok(projection)
    }

    pub fn from_artifact(artifact: ProjectionArtifact) -> Result<Self, ReductionError> {
        let input_dim = artifact.mean.len();
        let output_dim = artifact.components.len();
        if input_dim == 0 || output_dim == 0 {
            return Err(ReductionError::Malformed("empty mean or components".into()));
        }
        if let Some(bad) = artifact.components.iter().position(|row| row.len() != input_dim) {
            return Err(ReductionError::Malformed(format!(
                "component {bad} has {} values, expected {input_dim}",
                artifact.components[bad].len()
            )));
        }

        let whitening = if artifact.whiten {
            let variance = artifact.explained_variance.ok_or_else(|| {
                ReductionError::Malformed("whiten requires explained_variance".into())
            })?;
            if variance.len() != output_dim {
                return Err(ReductionError::Malformed(format!(
                    "explained_variance has {} values, expected {output_dim}",
                    variance.len()
                )));
            }
            if variance.iter().any(|&v| v <= 0.0 || !v.is_finite()) {
                return Err(ReductionError::Malformed("explained_variance must be positive".into()));
            }
            Some(variance.iter().map(|v| v.sqrt()).collect())
        } else {
            None
        };

        let flat: Vec<f32> = artifact.components.into_iter().flatten().collect();
        let components = Array2::from_shape_vec((output_dim, input_dim), flat)
            .map_err(|e| ReductionError::Malformed(e.to_string()))?;

        Ok(Self {
            mean: Array1::from(artifact.mean),
            components,
            whitening,
        })
    }

    /// Projection that passes vectors through unchanged.
    pub fn identity(dim: usize) -> Self {
        Self {
            mean: Array1::zeros(dim),
            components: Array2::eye(dim),
            whitening: None,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.mean.len()
    }

    pub fn output_dim(&self) -> usize {
        self.components.nrows()
    }

    /// Project one vector. Fails unless `values.len() == input_dim()`.
    pub fn project(&self, values: &[f32]) -> Result<ReducedVector, ReductionError> {
        if values.len() != self.input_dim() {
            return Err(ReductionError::DimensionMismatch {
                expected: self.input_dim(),
                actual: values.len(),
            });
        }
        let centred = &ArrayView1::from(values) - &self.mean;
        let mut out = self.components.dot(&centred);
        if let Some(scale) = &self.whitening {
            out /= scale;
        }
        Ok(ReducedVector { values: out.to_vec() })
    }
}
