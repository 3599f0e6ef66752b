//! [`FaceAnalyzer`] backed by SCRFD detection and ArcFace embeddings.

mod arcface;
mod scrfd;

use crate::analyzer::FaceAnalyzer;
use crate::frame::Frame;
use crate::types::{Embedding, FaceRegion, Landmarks, Point};
use std::path::Path;
use thiserror::Error;

pub use arcface::ArcFace;
pub use scrfd::{Detection, Scrfd};

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const EMBEDDER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct OnnxAnalyzer {
    detector: Scrfd,
    embedder: ArcFace,
    /// Detections from the last `detect` call, used to find keypoints for
    /// the regions handed back by the caller.
    last: Vec<Detection>,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, OnnxError> {
        Ok(Self {
            detector: Scrfd::load(&model_dir.join(DETECTOR_MODEL))?,
            embedder: ArcFace::load(&model_dir.join(EMBEDDER_MODEL))?,
            last: Vec::new(),
        })
    }

    fn keypoints_for(&mut self, frame: &Frame, face: &FaceRegion) -> Option<[Point; 5]> {
        if self.last.is_empty() {
            self.detect(frame);
        }
        let c = face.center();
        self.last
            .iter()
            .filter(|d| d.region.center().distance(&c) <= face.width.max(face.height) / 2.0)
            .min_by(|a, b| {
                let da = a.region.center().distance(&c);
                let db = b.region.center().distance(&c);
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .and_then(|d| d.keypoints)
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect(&mut self, frame: &Frame) -> Vec<FaceRegion> {
        match self.detector.detect(frame) {
            Ok(found) => {
                self.last = found;
                self.last.iter().map(|d| d.region).collect()
            }
            Err(e) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "face detection failed");
                self.last.clear();
                Vec::new()
            }
        }
    }

    fn landmarks(&mut self, frame: &Frame, face: &FaceRegion) -> Option<Landmarks> {
        let [left_eye, right_eye, nose_tip, mouth_left, mouth_right] = self.keypoints_for(frame, face)?;
        Some(Landmarks {
            left_eye,
            right_eye,
            nose_bridge: left_eye.midpoint(&right_eye),
            nose_tip,
            mouth_left,
            mouth_right,
        })
    }

    fn encode(&mut self, frame: &Frame, face: &FaceRegion) -> Option<Embedding> {
        let keypoints = self.keypoints_for(frame, face)?;
        match self.embedder.embed(frame, &keypoints) {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!(error = %e, "embedding extraction failed");
                None
            }
        }
    }
}
