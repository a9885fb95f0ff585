//! 68-point landmark extraction.
//!
//! [`OnnxLandmarkExtractor`] pairs the SCRFD detector with a 68-point
//! regression model run on a square crop around each detection.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::{BoundingBox, LandmarkSet, LANDMARK_COUNT};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: usize = 112;
/// Crop side relative to the larger side of the detection box.
const LANDMARK_CROP_SCALE: f32 = 1.2;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Grayscale image to ordered landmark sets, one per detected face.
pub trait LandmarkExtractor {
    fn extract(&mut self, gray: &GrayImage) -> Result<Vec<LandmarkSet>, LandmarkError>;
}

/// Square region of the source image fed to the landmark model.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CropWindow {
    x0: f32,
    y0: f32,
    side: f32,
}

impl CropWindow {
    fn around(face: &BoundingBox) -> Self {
        let side = face.width.max(face.height) * LANDMARK_CROP_SCALE;
        let cx = face.x + face.width / 2.0;
        let cy = face.y + face.height / 2.0;
        Self {
            x0: cx - side / 2.0,
            y0: cy - side / 2.0,
            side,
        }
    }
}

/// 68-point landmark regressor (normalized crop-space outputs).
pub struct LandmarkPredictor {
    session: Session,
}

impl LandmarkPredictor {
    pub fn load(model_path: &Path) -> Result<Self, LandmarkError> {
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded landmark model"
        );

        Ok(Self { session })
    }

    /// Predict the landmarks of one detected face.
    pub fn predict(&mut self, gray: &GrayImage, face: &BoundingBox) -> Result<LandmarkSet, LandmarkError> {
        let crop = CropWindow::around(face);
        let input = crop_tensor(gray, &crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Some exports also emit pose or visibility heads; take the 136-value one.
        for (_, value) in outputs.iter() {
            let Ok((_, raw)) = value.try_extract_tensor::<f32>() else {
                continue;
            };
            if raw.len() == LANDMARK_COUNT * 2 {
                return decode_landmarks(raw, &crop);
            }
        }

        Err(LandmarkError::InferenceFailed(format!(
            "no output with {} values",
            LANDMARK_COUNT * 2
        )))
    }
}

/// Sample the crop window into a 3-channel NCHW tensor in [0, 1].
/// Pixels outside the source image are black.
fn crop_tensor(gray: &GrayImage, crop: &CropWindow) -> Array4<f32> {
    let size = LANDMARK_INPUT_SIZE;
    let step = crop.side / size as f32;
    let (w, h) = (gray.width() as i64, gray.height() as i64);

    let sample = |x: i64, y: i64| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            gray.get_pixel(x as u32, y as u32).0[0] as f32
        } else {
            0.0
        }
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for oy in 0..size {
        let sy = crop.y0 + (oy as f32 + 0.5) * step - 0.5;
        let y0 = sy.floor();
        let fy = sy - y0;
        for ox in 0..size {
            let sx = crop.x0 + (ox as f32 + 0.5) * step - 0.5;
            let x0 = sx.floor();
            let fx = sx - x0;
            let (xi, yi) = (x0 as i64, y0 as i64);

            let v = sample(xi, yi) * (1.0 - fx) * (1.0 - fy)
                + sample(xi + 1, yi) * fx * (1.0 - fy)
                + sample(xi, yi + 1) * (1.0 - fx) * fy
                + sample(xi + 1, yi + 1) * fx * fy;
            let v = v / 255.0;
            for c in 0..3 {
                tensor[[0, c, oy, ox]] = v;
            }
        }
    }
    tensor
}

/// Map normalized `[x0, y0, x1, y1, ...]` outputs back to image pixels.
fn decode_landmarks(raw: &[f32], crop: &CropWindow) -> Result<LandmarkSet, LandmarkError> {
    let points: Vec<(i32, i32)> = raw
        .chunks_exact(2)
        .map(|p| {
            (
                (crop.x0 + p[0] * crop.side).round() as i32,
                (crop.y0 + p[1] * crop.side).round() as i32,
            )
        })
        .collect();

    LandmarkSet::from_slice(&points).ok_or_else(|| {
        LandmarkError::InferenceFailed(format!("expected {LANDMARK_COUNT} points, got {}", points.len()))
    })
}

/// Detector + landmark predictor.
pub struct OnnxLandmarkExtractor {
    detector: FaceDetector,
    predictor: LandmarkPredictor,
}

impl OnnxLandmarkExtractor {
    pub fn new(detector: FaceDetector, predictor: LandmarkPredictor) -> Self {
        Self { detector, predictor }
    }

    pub fn load(detector_path: &Path, landmark_path: &Path) -> Result<Self, LandmarkError> {
        Ok(Self::new(
            FaceDetector::load(detector_path)?,
            LandmarkPredictor::load(landmark_path)?,
        ))
    }
}

impl LandmarkExtractor for OnnxLandmarkExtractor {
    fn extract(&mut self, gray: &GrayImage) -> Result<Vec<LandmarkSet>, LandmarkError> {
        let faces = self.detector.detect(gray)?;
        tracing::debug!(faces = faces.len(), "detected faces");

        faces
            .iter()
            .map(|face| self.predictor.predict(gray, face))
            .collect()
    }
}
