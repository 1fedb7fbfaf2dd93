//! Face embedding extraction from saved captures.
//!
//! [`OnnxExtractor`] finds the most confident face in an image, crops it with
//! a margin, and runs an embedding model on the square crop. Embeddings are
//! L2-normalized before they leave this module.

use crate::detector::{DetectorError, OnnxPresenceDetector, PresenceDetector};
use crate::types::{normalize, BoundingBox, Embedding};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 112;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;
/// Fraction of the face box added on each side before cropping.
const CROP_MARGIN: f32 = 0.2;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a saved image into a face embedding.
pub trait EmbeddingExtractor: Send {
    /// Extract an embedding for the most prominent face.
    ///
    /// `Ok(None)` means the image contains no face.
    fn extract(&mut self, image_path: &Path) -> Result<Option<Embedding>, ExtractorError>;
}

/// ONNX Runtime embedding extractor.
pub struct OnnxExtractor {
    detector: OnnxPresenceDetector,
    session: Session,
    dim: usize,
}

impl OnnxExtractor {
    /// Load the embedding model. `dim` is the expected embedding length.
    pub fn load(
        model_path: &Path,
        detector: OnnxPresenceDetector,
        dim: usize,
    ) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            dim,
            "loaded face embedder"
        );

        Ok(Self { detector, session, dim })
    }

    /// Extract from an in-memory image.
    pub fn extract_image(&mut self, image: &RgbImage) -> Result<Option<Embedding>, ExtractorError> {
        let faces = self.detector.detect(image)?;
        let Some(face) = faces.first() else {
            return Ok(None);
        };

        let crop = crop_face(image, face);
        let input = Self::preprocess(&crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.dim {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.dim,
                raw.len()
            )));
        }

        Ok(Some(Embedding::new(normalize(raw))))
    }

    /// Square RGB crop → NCHW float tensor.
    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = EMBEDDER_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }

        tensor
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image_path: &Path) -> Result<Option<Embedding>, ExtractorError> {
        let image = image::open(image_path)?.to_rgb8();
        self.extract_image(&image)
    }
}

/// Crop a square region around `face`, widened by [`CROP_MARGIN`] and clamped
/// to the image, resized to the embedder input size.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    let (iw, ih) = (image.width() as f32, image.height() as f32);
    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x0 = (cx - side / 2.0).clamp(0.0, (iw - 1.0).max(0.0));
    let y0 = (cy - side / 2.0).clamp(0.0, (ih - 1.0).max(0.0));
    let w = side.min(iw - x0).max(1.0);
    let h = side.min(ih - y0).max(1.0);

    let region = image::imageops::crop_imm(image, x0 as u32, y0 as u32, w as u32, h as u32).to_image();
    image::imageops::resize(&region, EMBEDDER_INPUT_SIZE, EMBEDDER_INPUT_SIZE, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_face_output_size() {
        let image = RgbImage::from_pixel(640, 480, image::Rgb([10, 20, 30]));
        let face = BoundingBox { x: 200.0, y: 100.0, width: 120.0, height: 150.0, confidence: 0.9 };
        let crop = crop_face(&image, &face);
        assert_eq!(crop.dimensions(), (EMBEDDER_INPUT_SIZE, EMBEDDER_INPUT_SIZE));
    }

    #[test]
    fn test_crop_face_at_edge_is_clamped() {
        let image = RgbImage::from_pixel(100, 100, image::Rgb([0, 0, 0]));
        let face = BoundingBox { x: 90.0, y: 90.0, width: 40.0, height: 40.0, confidence: 0.9 };
        let crop = crop_face(&image, &face);
        assert_eq!(crop.dimensions(), (EMBEDDER_INPUT_SIZE, EMBEDDER_INPUT_SIZE));
    }

    #[test]
    fn test_preprocess_normalization() {
        let crop = RgbImage::from_pixel(
            EMBEDDER_INPUT_SIZE,
            EMBEDDER_INPUT_SIZE,
            image::Rgb([128, 128, 128]),
        );
        let tensor = OnnxExtractor::preprocess(&crop);
        let expected = (128.0 - EMBEDDER_MEAN) / EMBEDDER_STD;
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }
}
