use crate::config::ModelsConfig;
use anyhow::{bail, Context, Result};
use facetag_core::types::DESCRIPTOR_DIM;
use facetag_core::{
    FrameIdentifier, IdentityClassifier, OnnxDescriptorEncoder, OnnxLandmarkExtractor, PipelineConfig,
    Projection, RejectionMode, SvmClassifier,
};
use serde::Serialize;

pub type Identifier = FrameIdentifier<OnnxLandmarkExtractor, OnnxDescriptorEncoder, SvmClassifier>;

/// Every artifact the pipeline needs, loaded once at startup.
pub struct Artifacts {
    pub extractor: OnnxLandmarkExtractor,
    pub encoder: OnnxDescriptorEncoder,
    pub projection: Projection,
    pub classifier: SvmClassifier,
}

impl Artifacts {
    /// Load all five artifacts, failing on the first one that cannot be read.
    pub fn load(models: &ModelsConfig) -> Result<Self> {
        let extractor = OnnxLandmarkExtractor::load(&models.detector_path(), &models.landmarks_path())
            .with_context(|| {
                format!(
                    "loading face detector {} / landmark model {}",
                    models.detector_path().display(),
                    models.landmarks_path().display()
                )
            })?;
        let encoder = OnnxDescriptorEncoder::load(&models.embedding_path())
            .with_context(|| format!("loading embedding model {}", models.embedding_path().display()))?;
        let projection = Projection::load(&models.projection_path())
            .with_context(|| format!("loading projection {}", models.projection_path().display()))?;
        let classifier = SvmClassifier::load(&models.classifier_path())
            .with_context(|| format!("loading classifier {}", models.classifier_path().display()))?;

        Ok(Self {
            extractor,
            encoder,
            projection,
            classifier,
        })
    }

    pub fn summary(&self, rejection: RejectionMode) -> ArtifactSummary {
        summarize(&self.projection, &self.classifier, rejection)
    }

    pub fn into_identifier(self, config: PipelineConfig) -> Identifier {
        FrameIdentifier::new(self.extractor, self.encoder, self.projection, self.classifier, config)
    }
}

/// Dimensions of the artifact chain and any disagreement between them.
pub fn summarize(projection: &Projection, classifier: &SvmClassifier, rejection: RejectionMode) -> ArtifactSummary {
    let mut problems = Vec::new();
    if projection.input_dim() != DESCRIPTOR_DIM {
        problems.push(format!(
            "projection expects {}-dim input, descriptors are {DESCRIPTOR_DIM}-dim",
            projection.input_dim()
        ));
    }
    if projection.output_dim() != classifier.input_dim() {
        problems.push(format!(
            "projection yields {} dims, classifier expects {}",
            projection.output_dim(),
            classifier.input_dim()
        ));
    }
    // The legacy anchor is a support vector pushed through the projection again.
    if rejection == RejectionMode::LegacyAnchor && projection.input_dim() != classifier.input_dim() {
        problems.push(format!(
            "legacy anchor projects a {}-dim support vector through a {}-dim projection",
            classifier.input_dim(),
            projection.input_dim()
        ));
    }

    ArtifactSummary {
        classes: classifier.classes().to_vec(),
        descriptor_dim: DESCRIPTOR_DIM,
        projection_input_dim: projection.input_dim(),
        projection_output_dim: projection.output_dim(),
        classifier_input_dim: classifier.input_dim(),
        rejection,
        problems,
    }
}

#[derive(Debug, Serialize)]
pub struct ArtifactSummary {
    pub classes: Vec<String>,
    pub descriptor_dim: usize,
    pub projection_input_dim: usize,
    pub projection_output_dim: usize,
    pub classifier_input_dim: usize,
    pub rejection: RejectionMode,
    pub problems: Vec<String>,
}

impl ArtifactSummary {
    pub fn ensure_consistent(&self) -> Result<()> {
        if !self.problems.is_empty() {
            bail!("inconsistent artifacts: {}", self.problems.join("; "));
        }
        Ok(())
    }
}
