//! Face descriptor extraction via ONNX Runtime.
//!
//! Produces 128-dimensional descriptors from a colour face chip aligned on
//! five anchors derived from the 68-point landmarks. Descriptors are left
//! unnormalized; the projection artifact is fitted on raw descriptors.

use crate::alignment;
use crate::types::{Descriptor, LandmarkSet, DESCRIPTOR_DIM};
use image::buffer::ConvertBuffer;
use image::{GrayImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDING_CHIP_SIZE: u32 = 150;
const EMBEDDING_MEAN: f32 = 127.5;
const EMBEDDING_STD: f32 = 128.0;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Colour image + landmark set to descriptor.
///
/// Takes an [`RgbImage`]: grayscale input must go through
/// [`expand_to_rgb`] first.
pub trait DescriptorEncoder {
    fn encode(&mut self, image: &RgbImage, landmarks: &LandmarkSet) -> Result<Descriptor, EncoderError>;
}

/// Replicate a single channel into three.
pub fn expand_to_rgb(gray: &GrayImage) -> RgbImage {
    gray.convert()
}

pub struct OnnxDescriptorEncoder {
    session: Session,
}

impl OnnxDescriptorEncoder {
    pub fn load(model_path: &Path) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session })
    }

    fn preprocess(chip: &RgbImage) -> Array4<f32> {
        let size = chip.width() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, px) in chip.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - EMBEDDING_MEAN) / EMBEDDING_STD;
            }
        }
        tensor
    }
}

impl DescriptorEncoder for OnnxDescriptorEncoder {
    fn encode(&mut self, image: &RgbImage, landmarks: &LandmarkSet) -> Result<Descriptor, EncoderError> {
        let chip = alignment::align_face(image, &landmarks.alignment_points(), EMBEDDING_CHIP_SIZE);
        let input = Self::preprocess(&chip);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        if raw.len() != DESCRIPTOR_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        Ok(Descriptor { values: raw.to_vec() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_expand_to_rgb_replicates_channel() {
        let mut gray = GrayImage::new(3, 2);
        gray.put_pixel(2, 1, image::Luma([77]));
        let rgb = expand_to_rgb(&gray);
        assert_eq!(rgb.dimensions(), (3, 2));
        assert_eq!(rgb.get_pixel(2, 1).0, [77, 77, 77]);
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_preprocess_normalization_and_layout() {
        let mut chip = RgbImage::from_pixel(EMBEDDING_CHIP_SIZE, EMBEDDING_CHIP_SIZE, Rgb([128, 128, 128]));
        chip.put_pixel(3, 1, Rgb([255, 0, 128]));
        let t = OnnxDescriptorEncoder::preprocess(&chip);
        let n = EMBEDDING_CHIP_SIZE as usize;
        assert_eq!(t.shape(), &[1, 3, n, n]);
        assert!((t[[0, 0, 1, 3]] - (255.0 - EMBEDDING_MEAN) / EMBEDDING_STD).abs() < 1e-6);
        assert!((t[[0, 1, 1, 3]] - (0.0 - EMBEDDING_MEAN) / EMBEDDING_STD).abs() < 1e-6);
        assert!((t[[0, 2, 0, 0]] - 0.5 / EMBEDDING_STD).abs() < 1e-6);
    }
}
