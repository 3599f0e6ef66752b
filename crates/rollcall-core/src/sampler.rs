//! Pose-diverse sample collection for guided enrollment.
//!
//! The sampler accepts a sample only if its head pose is at least
//! `angle_threshold` degrees away from every sample accepted so far, so the
//! enrolled set covers distinct views of the face rather than many copies
//! of the same one.

use crate::analyzer::FaceAnalyzer;
use crate::frame::Frame;
use crate::pose::{estimate_pose, estimate_pose_from_position, Pose};
use crate::types::Embedding;
use image::RgbImage;
use thiserror::Error;

pub const DEFAULT_TARGET_COUNT: usize = 5;
pub const DEFAULT_ANGLE_THRESHOLD: f32 = 15.0;
pub const DEFAULT_CROP_MARGIN: u32 = 50;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub target_count: usize,
    /// Minimum pose distance, in degrees, to every accepted sample.
    pub angle_threshold: f32,
    /// Pixels added around the detected face when cropping.
    pub crop_margin: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            target_count: DEFAULT_TARGET_COUNT,
            angle_threshold: DEFAULT_ANGLE_THRESHOLD,
            crop_margin: DEFAULT_CROP_MARGIN,
        }
    }
}

/// Input offered to the sampler.
pub enum Sample {
    /// A raw frame; the sampler detects the face and estimates pose itself.
    Frame(Frame),
    /// Detection already done by the caller.
    Descriptor { pose: Pose, embedding: Embedding },
}

/// What was kept for an accepted sample.
#[derive(Clone)]
pub enum Capture {
    Face(RgbImage),
    Embedding(Embedding),
}

#[derive(Clone)]
pub struct CapturedSample {
    pub pose: Pose,
    pub capture: Capture,
}

/// Why a sample was not accepted. The display text is the user guidance.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("capture complete: {captured}/{target}")]
    Complete { captured: usize, target: usize },
    #[error("invalid frame")]
    InvalidFrame,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}); make sure only one person is in frame")]
    MultipleFacesDetected(usize),
    #[error("turn your head to capture a different angle ({captured}/{target})")]
    TooSimilar {
        captured: usize,
        target: usize,
        nearest: f32,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error("capture incomplete: {captured}/{target} samples")]
    CaptureIncomplete { captured: usize, target: usize },
}

/// Result of one `accept` call.
#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub accepted: bool,
    pub message: String,
    pub rejection: Option<Rejection>,
}

impl AcceptOutcome {
    fn accepted(captured: usize, target: usize) -> Self {
        Self {
            accepted: true,
            message: format!("captured {captured}/{target}, try a different angle"),
            rejection: None,
        }
    }

    fn rejected(rejection: Rejection) -> Self {
        Self {
            accepted: false,
            message: rejection.to_string(),
            rejection: Some(rejection),
        }
    }
}

pub struct CaptureSampler {
    config: SamplerConfig,
    accepted: Vec<CapturedSample>,
}

impl CaptureSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            accepted: Vec::new(),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    pub fn target_count(&self) -> usize {
        self.config.target_count
    }

    pub fn is_complete(&self) -> bool {
        self.accepted.len() >= self.config.target_count
    }

    pub fn poses(&self) -> impl Iterator<Item = &Pose> {
        self.accepted.iter().map(|s| &s.pose)
    }

    pub fn accept(&mut self, sample: Sample, analyzer: &mut dyn FaceAnalyzer) -> AcceptOutcome {
        match sample {
            Sample::Frame(frame) => self.accept_frame(&frame, analyzer),
            Sample::Descriptor { pose, embedding } => self.accept_descriptor(pose, embedding),
        }
    }

    /// Detect the single face in `frame`, estimate its pose and keep a crop.
    pub fn accept_frame(&mut self, frame: &Frame, analyzer: &mut dyn FaceAnalyzer) -> AcceptOutcome {
        if let Some(done) = self.complete_rejection() {
            return done;
        }
        if frame.is_empty() {
            return AcceptOutcome::rejected(Rejection::InvalidFrame);
        }

        let faces = analyzer.detect(frame);
        let face = match faces.as_slice() {
            [] => return AcceptOutcome::rejected(Rejection::NoFaceDetected),
            [face] => face,
            many => return AcceptOutcome::rejected(Rejection::MultipleFacesDetected(many.len())),
        };

        let pose = match analyzer.landmarks(frame, face) {
            Some(landmarks) => estimate_pose(&landmarks),
            None => estimate_pose_from_position(face, frame.width()),
        };

        if let Some(rejection) = self.too_similar(&pose) {
            return AcceptOutcome::rejected(rejection);
        }

        let Some(crop) = frame.crop(face, self.config.crop_margin) else {
            return AcceptOutcome::rejected(Rejection::NoFaceDetected);
        };

        self.push(pose, Capture::Face(crop))
    }

    /// Accept a caller-computed pose and embedding without local detection.
    pub fn accept_descriptor(&mut self, pose: Pose, embedding: Embedding) -> AcceptOutcome {
        if let Some(done) = self.complete_rejection() {
            return done;
        }
        if embedding.is_empty() {
            return AcceptOutcome::rejected(Rejection::NoFaceDetected);
        }
        if let Some(rejection) = self.too_similar(&pose) {
            return AcceptOutcome::rejected(rejection);
        }
        self.push(pose, Capture::Embedding(embedding))
    }

    /// The accepted set, once `target_count` samples have been collected.
    pub fn finalize(&self) -> Result<Vec<CapturedSample>, SamplerError> {
        if !self.is_complete() {
            return Err(SamplerError::CaptureIncomplete {
                captured: self.accepted.len(),
                target: self.config.target_count,
            });
        }
        Ok(self.accepted.clone())
    }

    pub fn reset(&mut self) {
        self.accepted.clear();
    }

    fn complete_rejection(&self) -> Option<AcceptOutcome> {
        self.is_complete().then(|| {
            AcceptOutcome::rejected(Rejection::Complete {
                captured: self.accepted.len(),
                target: self.config.target_count,
            })
        })
    }

    fn too_similar(&self, pose: &Pose) -> Option<Rejection> {
        let nearest = self
            .accepted
            .iter()
            .map(|s| s.pose.distance(pose))
            .fold(f32::INFINITY, f32::min);

        (nearest < self.config.angle_threshold).then(|| Rejection::TooSimilar {
            captured: self.accepted.len(),
            target: self.config.target_count,
            nearest,
        })
    }

    fn push(&mut self, pose: Pose, capture: Capture) -> AcceptOutcome {
        self.accepted.push(CapturedSample { pose, capture });
        tracing::debug!(
            yaw = pose.yaw,
            pitch = pose.pitch,
            roll = pose.roll,
            captured = self.accepted.len(),
            target = self.config.target_count,
            "enrollment sample accepted"
        );
        AcceptOutcome::accepted(self.accepted.len(), self.config.target_count)
    }
}
