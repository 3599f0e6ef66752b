//! Scripted analyzer for tests.
//!
//! A scene is selected by the red channel of the frame's top-left pixel, so
//! it survives downscaling of uniformly filled frames. Face geometry is given
//! in normalized [0, 1] coordinates and mapped onto whatever frame size the
//! analyzer is handed.

use crate::analyzer::FaceAnalyzer;
use crate::frame::Frame;
use crate::types::{Embedding, FaceRegion, Landmarks, Point};
use image::{Rgb, RgbImage};
use std::collections::HashMap;

/// One scripted face, normalized to frame size.
#[derive(Debug, Clone)]
pub struct FakeFace {
    pub region: (f32, f32, f32, f32),
    pub landmarks: Option<[(f32, f32); 4]>,
    pub embedding: Option<Vec<f32>>,
}

impl FakeFace {
    pub fn at(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            region: (x, y, w, h),
            landmarks: None,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, values: Vec<f32>) -> Self {
        self.embedding = Some(values);
        self
    }

    /// Landmarks as [left_eye, right_eye, nose_bridge, nose_tip].
    pub fn with_landmarks(mut self, points: [(f32, f32); 4]) -> Self {
        self.landmarks = Some(points);
        self
    }
}

#[derive(Default)]
pub struct ScriptedAnalyzer {
    scenes: HashMap<u8, Vec<FakeFace>>,
    pub detect_calls: usize,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scene(mut self, key: u8, faces: Vec<FakeFace>) -> Self {
        self.scenes.insert(key, faces);
        self
    }

    fn faces_for(&self, frame: &Frame) -> &[FakeFace] {
        if frame.is_empty() {
            return &[];
        }
        let key = frame.image.get_pixel(0, 0)[0];
        self.scenes.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn region_of(face: &FakeFace, frame: &Frame) -> FaceRegion {
        let (w, h) = (frame.width() as f32, frame.height() as f32);
        let (x, y, fw, fh) = face.region;
        FaceRegion::new(x * w, y * h, fw * w, fh * h)
    }

    fn lookup(&self, frame: &Frame, face: &FaceRegion) -> Option<&FakeFace> {
        let c = face.center();
        self.faces_for(frame).iter().min_by(|a, b| {
            let da = Self::region_of(a, frame).center().distance(&c);
            let db = Self::region_of(b, frame).center().distance(&c);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

impl FaceAnalyzer for ScriptedAnalyzer {
    fn detect(&mut self, frame: &Frame) -> Vec<FaceRegion> {
        self.detect_calls += 1;
        self.faces_for(frame)
            .iter()
            .map(|f| Self::region_of(f, frame))
            .collect()
    }

    fn landmarks(&mut self, frame: &Frame, face: &FaceRegion) -> Option<Landmarks> {
        let (w, h) = (frame.width() as f32, frame.height() as f32);
        let pts = self.lookup(frame, face)?.landmarks?;
        let p = |i: usize| Point::new(pts[i].0 * w, pts[i].1 * h);
        Some(Landmarks {
            left_eye: p(0),
            right_eye: p(1),
            nose_bridge: p(2),
            nose_tip: p(3),
            mouth_left: p(0),
            mouth_right: p(1),
        })
    }

    fn encode(&mut self, frame: &Frame, face: &FaceRegion) -> Option<Embedding> {
        self.lookup(frame, face)?
            .embedding
            .clone()
            .map(Embedding::new)
    }
}

/// Uniform frame whose scene key is `key`.
pub fn scene_frame(key: u8, width: u32, height: u32) -> Frame {
    Frame::new(RgbImage::from_pixel(width, height, Rgb([key, 0, 0])), 0)
}
