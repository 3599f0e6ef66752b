//! Face analysis seam: detection, landmarks and embeddings.

use crate::frame::Frame;
use crate::types::{Embedding, FaceRegion, Landmarks};
use parking_lot::Mutex;
use std::sync::Arc;

/// Feature-extraction backend.
///
/// Implementations must tolerate degenerate input (empty or corrupt frames,
/// regions outside the frame) by returning empty results rather than errors.
pub trait FaceAnalyzer: Send {
    /// Detect faces, sorted by descending confidence.
    fn detect(&mut self, frame: &Frame) -> Vec<FaceRegion>;

    /// Landmarks for a detected face, if the backend provides them.
    fn landmarks(&mut self, frame: &Frame, face: &FaceRegion) -> Option<Landmarks>;

    /// Embedding for a detected face.
    fn encode(&mut self, frame: &Frame, face: &FaceRegion) -> Option<Embedding>;
}

impl<T: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<T> {
    fn detect(&mut self, frame: &Frame) -> Vec<FaceRegion> {
        (**self).detect(frame)
    }

    fn landmarks(&mut self, frame: &Frame, face: &FaceRegion) -> Option<Landmarks> {
        (**self).landmarks(frame, face)
    }

    fn encode(&mut self, frame: &Frame, face: &FaceRegion) -> Option<Embedding> {
        (**self).encode(frame, face)
    }
}

/// Analyzer shared between the capture thread and enrollment requests.
pub type SharedAnalyzer = Arc<Mutex<Box<dyn FaceAnalyzer>>>;

pub fn shared(analyzer: impl FaceAnalyzer + 'static) -> SharedAnalyzer {
    Arc::new(Mutex::new(Box::new(analyzer)))
}
