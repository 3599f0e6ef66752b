//! rollcall-core: face matching, gallery management and enrollment capture.
//!
//! Detection and embedding sit behind the [`FaceAnalyzer`] trait; the `onnx`
//! feature provides an implementation using SCRFD and ArcFace on ONNX Runtime.

pub mod analyzer;
pub mod annotate;
pub mod engine;
pub mod frame;
pub mod gallery;
pub mod pose;
pub mod sampler;
pub mod types;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use analyzer::{FaceAnalyzer, SharedAnalyzer};
pub use annotate::{AnnotatedFrame, Annotator, Overlay};
pub use engine::{EngineError, RecognitionConfig, RecognitionEngine};
pub use frame::Frame;
pub use gallery::{Gallery, IdentityStore, StoreError};
pub use pose::Pose;
pub use sampler::{CaptureSampler, Sample, SamplerConfig};
pub use types::{DetectionEvent, Embedding, FaceRegion, Identity, Landmarks, Point, Role};
