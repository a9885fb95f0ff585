//! facetag-core: face identification engine.
//!
//! SCRFD face detection and 68-point landmark regression feed a 128-d
//! descriptor network (all via ONNX Runtime), followed by a PCA projection
//! and a probabilistic SVM with open-set rejection.

pub mod acceptance;
pub mod alignment;
pub mod classifier;
pub mod detector;
pub mod encoder;
pub mod landmarks;
pub mod pipeline;
pub mod reduction;
pub mod types;

use std::path::PathBuf;

pub use acceptance::{RejectionMode, DEFAULT_THRESHOLD};
pub use classifier::{IdentityClassifier, Prediction, SvmClassifier};
pub use encoder::{DescriptorEncoder, OnnxDescriptorEncoder};
pub use landmarks::{LandmarkExtractor, OnnxLandmarkExtractor};
pub use pipeline::{FaceErrorPolicy, FaceOutcome, FrameIdentifier, PipelineConfig, PipelineError};
pub use reduction::Projection;
pub use types::{BoundingBox, Descriptor, FaceBox, IdentificationResult, LandmarkSet, ReducedVector, UNKNOWN_LABEL};

/// Model directory from `FACETAG_MODEL_DIR`, else `./models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var_os("FACETAG_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("models"))
}
