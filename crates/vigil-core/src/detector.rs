//! Face-presence detection.
//!
//! [`OnnxPresenceDetector`] runs a single-shot box/score face detector
//! (UltraFace-style: `scores[1, N, 2]`, `boxes[1, N, 4]` with normalized
//! corner coordinates) and applies NMS to its output.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_WIDTH: u32 = 320;
const DETECTOR_INPUT_HEIGHT: u32 = 240;
const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_NMS_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can tell whether, and where, faces appear in a frame.
pub trait PresenceDetector: Send {
    /// Detect faces, returning boxes sorted by descending confidence.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// ONNX Runtime face detector.
pub struct OnnxPresenceDetector {
    session: Session,
    confidence_threshold: f32,
}

impl OnnxPresenceDetector {
    /// Load the detector model from the given path.
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            confidence_threshold,
            "loaded face detector"
        );

        Ok(Self {
            session,
            confidence_threshold,
        })
    }

    fn preprocess(frame: &RgbImage) -> Array4<f32> {
        let resized = image::imageops::resize(
            frame,
            DETECTOR_INPUT_WIDTH,
            DETECTOR_INPUT_HEIGHT,
            FilterType::Triangle,
        );
        let (w, h) = (DETECTOR_INPUT_WIDTH as usize, DETECTOR_INPUT_HEIGHT as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
            }
        }

        tensor
    }
}

impl PresenceDetector for OnnxPresenceDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let input = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let detections = decode(
            scores,
            boxes,
            frame.width() as f32,
            frame.height() as f32,
            self.confidence_threshold,
        );
        Ok(nms(detections, DETECTOR_NMS_THRESHOLD))
    }
}

/// Decode `[background, face]` score pairs and normalized `[x1, y1, x2, y2]`
/// boxes into frame-space boxes above `threshold`.
fn decode(scores: &[f32], boxes: &[f32], width: f32, height: f32, threshold: f32) -> Vec<BoundingBox> {
    let anchors = (scores.len() / 2).min(boxes.len() / 4);
    let mut detections = Vec::new();

    for i in 0..anchors {
        let score = scores[i * 2 + 1];
        if score < threshold {
            continue;
        }
        let x1 = boxes[i * 4].clamp(0.0, 1.0) * width;
        let y1 = boxes[i * 4 + 1].clamp(0.0, 1.0) * height;
        let x2 = boxes[i * 4 + 2].clamp(0.0, 1.0) * width;
        let y2 = boxes[i * 4 + 3].clamp(0.0, 1.0) * height;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }

    detections
}

/// Non-Maximum Suppression: keep the most confident of each overlapping cluster.
pub fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.iou(&det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}
