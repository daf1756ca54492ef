//! Face descriptor extraction.
//!
//! [`Embedder`] is the backend contract. [`ArcFaceEmbedder`] extracts
//! 512-dimensional descriptors from normalized 112×112 crops using the
//! w600k_r50 ArcFace model via ONNX Runtime.

use crate::types::{Descriptor, Image, CANONICAL_SIZE};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// ArcFace normalizes symmetrically to [-1, 1]; SCRFD divides by 128.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_DESCRIPTOR_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pluggable descriptor backend.
pub trait Embedder: Send {
    /// Length D of every descriptor this backend produces.
    fn dimension(&self) -> usize;

    /// Compute the descriptor of a normalized face crop.
    ///
    /// The crop must already have the canonical geometry.
    fn calculate_descriptor(&mut self, image: &Image) -> Result<Descriptor, EmbedderError>;
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn calculate_descriptor(&mut self, image: &Image) -> Result<Descriptor, EmbedderError> {
        (**self).calculate_descriptor(image)
    }
}

/// ArcFace-based descriptor extractor.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Canonical crop to a 1×3×112×112 tensor; a gray crop feeds all three planes.
    fn preprocess(image: &Image) -> Array4<f32> {
        let size = CANONICAL_SIZE;
        let gray = image.channels() == 1;
        Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            if x >= image.width() || y >= image.height() {
                return 0.0;
            }
            let pixel = image.at(x, y, if gray { 0 } else { c }) as f32;
            (pixel - ARCFACE_MEAN) / ARCFACE_STD
        })
    }
}

impl Embedder for ArcFaceEmbedder {
    fn dimension(&self) -> usize {
        ARCFACE_DESCRIPTOR_DIM
    }

    fn calculate_descriptor(&mut self, image: &Image) -> Result<Descriptor, EmbedderError> {
        let input = Self::preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        let descriptor = l2_normalize(raw_data.to_vec(), ARCFACE_DESCRIPTOR_DIM)?;
        tracing::debug!(dim = descriptor.len(), "ArcFace descriptor extracted");
        Ok(descriptor)
    }
}

/// Check the raw output length and scale it to unit length.
fn l2_normalize(raw: Vec<f32>, expected_dim: usize) -> Result<Descriptor, EmbedderError> {
    if raw.len() != expected_dim {
        return Err(EmbedderError::InferenceFailed(format!(
            "expected {expected_dim}-dim descriptor, got {}",
            raw.len()
        )));
    }

    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    let values = if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    };
    Ok(Descriptor::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crop(value: u8, channels: usize) -> Image {
        let data = vec![value; CANONICAL_SIZE * CANONICAL_SIZE * channels];
        match channels {
            1 => Image::from_gray(CANONICAL_SIZE, CANONICAL_SIZE, data).unwrap(),
            _ => Image::from_rgb(CANONICAL_SIZE, CANONICAL_SIZE, data).unwrap(),
        }
    }

    #[test]
    fn test_preprocess_output_shape() {
        let tensor = ArcFaceEmbedder::preprocess(&crop(128, 1));
        assert_eq!(tensor.shape(), &[1, 3, CANONICAL_SIZE, CANONICAL_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let tensor = ArcFaceEmbedder::preprocess(&crop(128, 3));
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        let val = tensor[[0, 2, 5, 7]];
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_preprocess_gray_channels_identical() {
        let tensor = ArcFaceEmbedder::preprocess(&crop(100, 1));
        for y in 0..CANONICAL_SIZE {
            for x in 0..CANONICAL_SIZE {
                let r = tensor[[0, 0, y, x]];
                assert_eq!(r, tensor[[0, 1, y, x]]);
                assert_eq!(r, tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let d = l2_normalize(vec![3.0, 4.0], 2).unwrap();
        assert_eq!(d.values, vec![0.6, 0.8]);
    }

    #[test]
    fn test_l2_normalize_rejects_wrong_length() {
        let err = l2_normalize(vec![1.0; 128], ARCFACE_DESCRIPTOR_DIM).unwrap_err();
        assert!(matches!(err, EmbedderError::InferenceFailed(_)));
    }

    #[test]
    fn test_missing_model_is_reported() {
        let err = ArcFaceEmbedder::load("/nonexistent/w600k_r50.onnx").err();
        assert!(matches!(err, Some(EmbedderError::ModelNotFound(_))));
    }
}
