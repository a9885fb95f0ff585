//! Per-frame identification: grayscale, downscale, landmarks, descriptors,
//! projection, classification, acceptance and on-screen geometry.

use crate::acceptance::{self, AcceptanceError, RejectionMode, DEFAULT_THRESHOLD};
use crate::classifier::{ClassifierError, IdentityClassifier};
use crate::encoder::{expand_to_rgb, DescriptorEncoder, EncoderError};
use crate::landmarks::{LandmarkError, LandmarkExtractor};
use crate::reduction::{Projection, ReductionError};
use crate::types::{FaceBox, IdentificationResult, LandmarkSet, ReducedVector};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DOWNSCALE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("landmarks: {0}")]
    Landmarks(#[from] LandmarkError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
    #[error("projection: {0}")]
    Reduction(#[from] ReductionError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("acceptance: {0}")]
    Acceptance(#[from] AcceptanceError),
}

/// What to do when one face in a frame fails to classify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaceErrorPolicy {
    /// Record the failure for that face and keep going.
    #[default]
    SkipFace,
    /// Abandon the rest of the frame and return the error.
    AbortFrame,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub threshold: f32,
    pub rejection: RejectionMode,
    /// Scale applied to the frame before detection, in (0, 1].
    pub downscale: f32,
    pub face_errors: FaceErrorPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            rejection: RejectionMode::default(),
            downscale: DEFAULT_DOWNSCALE,
            face_errors: FaceErrorPolicy::default(),
        }
    }
}

/// Outcome for one detected face. A frame yields exactly one per landmark set.
pub type FaceOutcome = Result<IdentificationResult, PipelineError>;

/// Scale a landmark-derived rectangle back to original-frame pixels.
///
/// Top-left is point 0; width spans jaw edge to jaw edge (0 → 16); height
/// spans brow to chin (24 → 8). Extents are not validated.
pub fn face_box(landmarks: &LandmarkSet, downscale: f32) -> FaceBox {
    let inv = 1.0 / downscale;
    let up = |v: i32| (v as f32 * inv).round() as i32;

    let (x0, y0) = landmarks.point(LandmarkSet::JAW_LEFT);
    let (x16, _) = landmarks.point(LandmarkSet::JAW_RIGHT);
    let (_, y8) = landmarks.point(LandmarkSet::CHIN);
    let (_, y24) = landmarks.point(LandmarkSet::BROW);

    FaceBox {
        x: up(x0),
        y: up(y0),
        width: up(x16 - x0),
        height: up(y8 - y24),
    }
}

/// Classify one reduced vector and apply the acceptance rule.
pub fn classify_face<C: IdentityClassifier + ?Sized>(
    classifier: &C,
    projection: &Projection,
    reduced: &ReducedVector,
    landmarks: &LandmarkSet,
    config: &PipelineConfig,
) -> Result<IdentificationResult, PipelineError> {
    let prediction = classifier.predict(reduced)?;
    let distance = acceptance::acceptance_distance(config.rejection, reduced, classifier, projection)?;
    let (label, confidence) = acceptance::decide(&prediction, distance, config.threshold);

    tracing::debug!(
        raw_label = %prediction.label,
        %label,
        confidence,
        distance,
        "classified face"
    );

    Ok(IdentificationResult {
        face_box: face_box(landmarks, config.downscale),
        label,
        confidence,
        distance,
    })
}

/// Luma with BT.601 weights (0.299, 0.587, 0.114), rounded.
/// `imageops::grayscale` uses Rec.709 weights instead.
pub fn to_gray(frame: &RgbImage) -> GrayImage {
    GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let [r, g, b] = frame.get_pixel(x, y).0;
        let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000;
        Luma([luma as u8])
    })
}

/// Resize `gray` by `factor`, keeping at least one pixel per side.
pub fn downscale(gray: &GrayImage, factor: f32) -> GrayImage {
    let w = ((gray.width() as f32 * factor).round() as u32).max(1);
    let h = ((gray.height() as f32 * factor).round() as u32).max(1);
    imageops::resize(gray, w, h, FilterType::Triangle)
}

/// Stateless per-frame identifier. Frames are processed independently.
pub struct FrameIdentifier<L, E, C> {
    extractor: L,
    encoder: E,
    projection: Projection,
    classifier: C,
    config: PipelineConfig,
}

impl<L, E, C> FrameIdentifier<L, E, C>
where
    L: LandmarkExtractor,
    E: DescriptorEncoder,
    C: IdentityClassifier,
{
    pub fn new(extractor: L, encoder: E, projection: Projection, classifier: C, config: PipelineConfig) -> Self {
        Self {
            extractor,
            encoder,
            projection,
            classifier,
            config,
        }
    }

    /// Identify every face in a colour frame.
    ///
    /// Landmark extraction failures abort the frame. Per-face failures
    /// follow [`PipelineConfig::face_errors`].
    pub fn identify_frame(&mut self, frame: &RgbImage) -> Result<Vec<FaceOutcome>, PipelineError> {
        let gray = to_gray(frame);
        let small = downscale(&gray, self.config.downscale);

        let landmark_sets = self.extractor.extract(&small)?;
        if landmark_sets.is_empty() {
            return Ok(Vec::new());
        }

        let color = expand_to_rgb(&small);
        let mut outcomes = Vec::with_capacity(landmark_sets.len());
        for (index, landmarks) in landmark_sets.iter().enumerate() {
            match self.identify_face(&color, landmarks) {
                Ok(result) => outcomes.push(Ok(result)),
                Err(err) => match self.config.face_errors {
                    FaceErrorPolicy::AbortFrame => return Err(err),
                    FaceErrorPolicy::SkipFace => {
                        tracing::warn!(face = index, error = %err, "skipping face");
                        outcomes.push(Err(err));
                    }
                },
            }
        }
        Ok(outcomes)
    }

    fn identify_face(&mut self, color: &RgbImage, landmarks: &LandmarkSet) -> Result<IdentificationResult, PipelineError> {
        let descriptor = self.encoder.encode(color, landmarks)?;
        let reduced = self.projection.project(&descriptor.values)?;
        classify_face(&self.classifier, &self.projection, &reduced, landmarks, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Kernel, Prediction, SvmArtifact, SvmClassifier};
    use crate::types::{Descriptor, LANDMARK_COUNT, UNKNOWN_LABEL};
    use std::cell::Cell;
    use std::rc::Rc;

    /// Landmarks with jaw/brow/chin points derived from an offset.
    fn landmarks_at(ox: i32, oy: i32) -> LandmarkSet {
        let mut pts = [(ox + 5, oy + 5); LANDMARK_COUNT];
        pts[LandmarkSet::JAW_LEFT] = (ox, oy);
        pts[LandmarkSet::JAW_RIGHT] = (ox + 40, oy + 2);
        pts[LandmarkSet::CHIN] = (ox + 20, oy + 45);
        pts[LandmarkSet::BROW] = (ox + 25, oy - 10);
        LandmarkSet::new(pts)
    }

    struct FixedExtractor {
        sets: Vec<LandmarkSet>,
        seen_sizes: Rc<Cell<(u32, u32)>>,
    }

    impl LandmarkExtractor for FixedExtractor {
        fn extract(&mut self, gray: &GrayImage) -> Result<Vec<LandmarkSet>, LandmarkError> {
            self.seen_sizes.set(gray.dimensions());
            Ok(self.sets.clone())
        }
    }

    /// Descriptor = landmark point 0, scaled into the classifier's space.
    struct PointEncoder;

    impl DescriptorEncoder for PointEncoder {
        fn encode(&mut self, _: &RgbImage, landmarks: &LandmarkSet) -> Result<Descriptor, EncoderError> {
            let (x, y) = landmarks.point(0);
            Ok(Descriptor { values: vec![x as f32 / 100.0, y as f32 / 100.0] })
        }
    }

    struct CountingClassifier {
        calls: Rc<Cell<usize>>,
        prediction: Prediction,
        anchor: Vec<f32>,
        fail_on_call: Option<usize>,
    }

    impl IdentityClassifier for CountingClassifier {
        fn classes(&self) -> &[String] {
            &[]
        }
        fn predict(&self, input: &ReducedVector) -> Result<Prediction, ClassifierError> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            if self.fail_on_call == Some(call) {
                return Err(ClassifierError::DimensionMismatch { expected: 99, actual: input.len() });
            }
            Ok(self.prediction.clone())
        }
        fn support_vector(&self, index: usize) -> Option<Vec<f32>> {
            (index == 0).then(|| self.anchor.clone())
        }
        fn class_centroids(&self) -> Vec<Vec<f32>> {
            vec![self.anchor.clone()]
        }
    }

    struct Harness {
        identifier: FrameIdentifier<FixedExtractor, PointEncoder, CountingClassifier>,
        calls: Rc<Cell<usize>>,
        seen: Rc<Cell<(u32, u32)>>,
    }

    fn harness(sets: Vec<LandmarkSet>, config: PipelineConfig, fail_on_call: Option<usize>) -> Harness {
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::new(Cell::new((0, 0)));
        let identifier = FrameIdentifier::new(
            FixedExtractor { sets, seen_sizes: seen.clone() },
            PointEncoder,
            Projection::identity(2),
            CountingClassifier {
                calls: calls.clone(),
                prediction: Prediction { label: "J".into(), probabilities: vec![0.25, 0.6, 0.15] },
                anchor: vec![0.0, 0.0],
                fail_on_call,
            },
            config,
        );
        Harness { identifier, calls, seen }
    }

    fn frame() -> RgbImage {
        RgbImage::new(640, 480)
    }

    #[test]
    fn test_face_box_doubles_landmark_extents() {
        let b = face_box(&landmarks_at(100, 60), 0.5);
        assert_eq!(b, FaceBox { x: 200, y: 120, width: 80, height: 110 });
    }

    #[test]
    fn test_face_box_keeps_negative_extents() {
        let mut pts = [(0, 0); LANDMARK_COUNT];
        pts[LandmarkSet::JAW_LEFT] = (50, 50);
        pts[LandmarkSet::JAW_RIGHT] = (40, 50);
        pts[LandmarkSet::CHIN] = (45, 30);
        pts[LandmarkSet::BROW] = (45, 35);
        let b = face_box(&LandmarkSet::new(pts), 0.5);
        assert_eq!((b.width, b.height), (-20, -10));
    }

    #[test]
    fn test_zero_faces_means_zero_results_and_no_classification() {
        let mut h = harness(Vec::new(), PipelineConfig::default(), None);
        let outcomes = h.identifier.identify_frame(&frame()).unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(h.calls.get(), 0);
    }

    #[test]
    fn test_detection_runs_on_downscaled_gray() {
        let mut h = harness(Vec::new(), PipelineConfig::default(), None);
        h.identifier.identify_frame(&frame()).unwrap();
        assert_eq!(h.seen.get(), (320, 240));
    }

    #[test]
    fn test_n_faces_n_classifications_n_results() {
        let sets = vec![landmarks_at(10, 20), landmarks_at(100, 30), landmarks_at(200, 40)];
        let mut h = harness(sets.clone(), PipelineConfig::default(), None);
        let outcomes = h.identifier.identify_frame(&frame()).unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(h.calls.get(), 3);
        for (outcome, set) in outcomes.iter().zip(&sets) {
            let result = outcome.as_ref().unwrap();
            let (x0, y0) = set.point(0);
            assert_eq!((result.face_box.x, result.face_box.y), (2 * x0, 2 * y0));
            assert_eq!(result.face_box.width, 2 * (set.point(16).0 - x0));
            assert_eq!(result.face_box.height, 2 * (set.point(8).1 - set.point(24).1));
        }
    }

    #[test]
    fn test_accepted_face_reports_raw_label_and_max_probability() {
        let mut h = harness(vec![landmarks_at(30, 40)], PipelineConfig::default(), None);
        let outcomes = h.identifier.identify_frame(&frame()).unwrap();
        let result = outcomes[0].as_ref().unwrap();
        assert_eq!(result.label, "J");
        assert_eq!(result.confidence, 0.6);
        assert!((result.distance - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rejected_face_is_unknown_with_zero_confidence() {
        let config = PipelineConfig { threshold: 0.5, ..PipelineConfig::default() };
        let mut h = harness(vec![landmarks_at(30, 40)], config, None);
        let outcomes = h.identifier.identify_frame(&frame()).unwrap();
        let result = outcomes[0].as_ref().unwrap();
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_skip_face_policy_keeps_remaining_faces() {
        let sets = vec![landmarks_at(10, 20), landmarks_at(100, 30), landmarks_at(200, 40)];
        let mut h = harness(sets, PipelineConfig::default(), Some(1));
        let outcomes = h.identifier.identify_frame(&frame()).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(PipelineError::Classifier(_))));
        assert!(outcomes[2].is_ok());
        assert_eq!(h.calls.get(), 3);
    }

    #[test]
    fn test_abort_frame_policy_stops_at_first_failure() {
        let sets = vec![landmarks_at(10, 20), landmarks_at(100, 30), landmarks_at(200, 40)];
        let config = PipelineConfig { face_errors: FaceErrorPolicy::AbortFrame, ..PipelineConfig::default() };
        let mut h = harness(sets, config, Some(1));
        let err = h.identifier.identify_frame(&frame()).unwrap_err();
        assert!(matches!(err, PipelineError::Classifier(ClassifierError::DimensionMismatch { .. })));
        assert_eq!(h.calls.get(), 2);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let svm = SvmClassifier::from_artifact(SvmArtifact {
            classes: vec!["A".into(), "B".into(), "C".into()],
            kernel: Kernel::Rbf { gamma: 0.5 },
            support_vectors: vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![-1.0, 2.0]],
            n_support: vec![1, 1, 1],
            dual_coef: vec![vec![1.0, -1.0, -1.0], vec![1.0, 1.0, -1.0]],
            intercept: vec![0.1, -0.2, 0.05],
            prob_a: vec![-1.5, -1.0, -2.0],
            prob_b: vec![0.1, 0.0, -0.1],
        })
        .unwrap();
        let projection = Projection::identity(2);
        let reduced = ReducedVector { values: vec![0.4, 0.7] };
        let landmarks = landmarks_at(5, 5);

        for rejection in [RejectionMode::LegacyAnchor, RejectionMode::NearestCentroid] {
            let config = PipelineConfig { rejection, ..PipelineConfig::default() };
            let first = classify_face(&svm, &projection, &reduced, &landmarks, &config).unwrap();
            let second = classify_face(&svm, &projection, &reduced, &landmarks, &config).unwrap();
            assert_eq!(first.label, second.label);
            assert_eq!(first.confidence.to_bits(), second.confidence.to_bits());
            assert_eq!(first.distance.to_bits(), second.distance.to_bits());
        }
    }

    #[test]
    fn test_gray_uses_bt601_weights() {
        let mut frame = RgbImage::new(4, 1);
        frame.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        frame.put_pixel(1, 0, image::Rgb([0, 255, 0]));
        frame.put_pixel(2, 0, image::Rgb([0, 0, 255]));
        frame.put_pixel(3, 0, image::Rgb([255, 255, 255]));
        let gray = to_gray(&frame);
        let values: Vec<u8> = gray.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values, vec![76, 150, 29, 255]);
    }

    #[test]
    fn test_downscale_rounds_and_clamps() {
        assert_eq!(downscale(&GrayImage::new(641, 481), 0.5).dimensions(), (321, 241));
        assert_eq!(downscale(&GrayImage::new(1, 1), 0.5).dimensions(), (1, 1));
    }
}
