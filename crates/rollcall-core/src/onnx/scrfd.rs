//! SCRFD face detector.
//!
//! Three-stride anchor decoding with two anchors per cell, followed by NMS.

use super::OnnxError;
use crate::frame::Frame;
use crate::types::{FaceRegion, Point};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: usize = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const CONFIDENCE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Detected face with its five keypoints
/// (left eye, right eye, nose, left mouth, right mouth).
#[derive(Debug, Clone)]
pub struct Detection {
    pub region: FaceRegion,
    pub keypoints: Option<[Point; 5]>,
}

/// Maps letterboxed model coordinates back onto the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (INPUT_SIZE as f32 - new_w) / 2.0,
            pad_y: (INPUT_SIZE as f32 - new_h) / 2.0,
        }
    }

    fn unmap(&self, x: f32, y: f32) -> Point {
        Point::new((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// (score, bbox, kps) output indices for one stride.
type StrideOutputs = (usize, usize, usize);

pub struct Scrfd {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl Scrfd {
    pub fn load(path: &Path) -> Result<Self, OnnxError> {
        if !path.exists() {
            return Err(OnnxError::ModelNotFound(path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(OnnxError::Inference(format!(
                "detector needs 9 outputs (score/bbox/kps per stride), got {}",
                names.len()
            )));
        }
        let outputs = output_layout(&names);
        tracing::info!(path = %path.display(), ?outputs, "loaded SCRFD detector");

        Ok(Self { session, outputs })
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, OnnxError> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut found = Vec::new();
        for (pos, &stride) in STRIDES.iter().enumerate() {
            let (si, bi, ki) = self.outputs[pos];
            let (_, scores) = outputs[si]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Inference(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bi]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Inference(format!("boxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[ki]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Inference(format!("keypoints stride {stride}: {e}")))?;
            found.extend(decode(scores, boxes, kps, stride, &letterbox));
        }

        Ok(nms(found, NMS_THRESHOLD))
    }
}

/// Resize into the 640x640 letterbox and normalize to NCHW.
fn preprocess(frame: &Frame) -> (Array4<f32>, Letterbox) {
    let (w, h) = (frame.width() as usize, frame.height() as usize);
    let letterbox = Letterbox::fit(w, h);
    let new_w = ((w as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((h as f32 * letterbox.scale).round() as u32).max(1);
    let resized = imageops::resize(&frame.image, new_w, new_h, FilterType::Triangle);

    let (ox, oy) = (letterbox.pad_x.floor() as usize, letterbox.pad_y.floor() as usize);
    // Padding is zero after normalization.
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + ox, y as usize + oy);
        if tx >= INPUT_SIZE || ty >= INPUT_SIZE {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (px[c] as f32 - MEAN) / STD;
        }
    }
    (tensor, letterbox)
}

/// Map output tensors to strides by name (`score_8`, `bbox_16`, ...), or
/// positionally when the export uses numeric names.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let by_name: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match by_name {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

fn decode(scores: &[f32], boxes: &[f32], kps: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<Detection> {
    let grid_w = INPUT_SIZE / stride;
    let anchors = grid_w * (INPUT_SIZE / stride) * ANCHORS_PER_CELL;
    let s = stride as f32;
    let mut out = Vec::new();

    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(b) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let tl = letterbox.unmap(ax - b[0] * s, ay - b[1] * s);
        let br = letterbox.unmap(ax + b[2] * s, ay + b[3] * s);
        let mut region = FaceRegion::new(tl.x, tl.y, br.x - tl.x, br.y - tl.y);
        region.confidence = score;

        let keypoints = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        out.push(Detection { region, keypoints });
    }
    out
}

/// Greedy NMS; the result is sorted by descending confidence.
fn nms(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.region
            .confidence
            .partial_cmp(&a.region.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(&k.region, &det.region) <= threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let w = (a.right().min(b.right()) - a.x.max(b.x)).max(0.0);
    let h = (a.bottom().min(b.bottom()) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
