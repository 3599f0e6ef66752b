//! ArcFace embedder with five-point similarity alignment.

use super::OnnxError;
use crate::frame::Frame;
use crate::types::{Embedding, Point};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 112;
const MEAN: f32 = 127.5;
const STD: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;
const MODEL_VERSION: &str = "w600k_r50";

/// Canonical keypoint positions in the 112x112 aligned crop.
const REFERENCE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub struct ArcFace {
    session: Session,
}

impl ArcFace {
    pub fn load(path: &Path) -> Result<Self, OnnxError> {
        if !path.exists() {
            return Err(OnnxError::ModelNotFound(path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(path)?;
        tracing::info!(path = %path.display(), "loaded ArcFace embedder");
        Ok(Self { session })
    }

    /// L2-normalized embedding of the face described by `keypoints`.
    pub fn embed(&mut self, frame: &Frame, keypoints: &[Point; 5]) -> Result<Embedding, OnnxError> {
        let aligned = align(&frame.image, keypoints);
        let input = to_tensor(&aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::Inference(format!("embedding: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(OnnxError::Inference(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|v| v / norm).collect()
        } else {
            raw.to_vec()
        };
        Ok(Embedding {
            values,
            model_version: Some(MODEL_VERSION.to_string()),
        })
    }
}

/// Similarity transform `(a, b, tx, ty)` mapping `src` onto `dst` in the
/// least-squares sense: `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`.
fn similarity(src: &[Point; 5], dst: &[(f32, f32); 5]) -> (f32, f32, f32, f32) {
    let n = src.len() as f32;
    let (sx, sy) = src.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.x / n, acc.1 + p.y / n));
    let (dx, dy) = dst.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0 / n, acc.1 + p.1 / n));

    let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
    for (p, q) in src.iter().zip(dst.iter()) {
        let (px, py) = (p.x - sx, p.y - sy);
        let (qx, qy) = (q.0 - dx, q.1 - dy);
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
        norm += px * px + py * py;
    }
    if norm < 1e-6 {
        return (1.0, 0.0, dx - sx, dy - sy);
    }

    let a = dot / norm;
    let b = cross / norm;
    (a, b, dx - (a * sx - b * sy), dy - (b * sx + a * sy))
}

/// Warp the face onto the canonical 112x112 crop with bilinear sampling.
fn align(image: &RgbImage, keypoints: &[Point; 5]) -> RgbImage {
    let (a, b, tx, ty) = similarity(keypoints, &REFERENCE);
    let det = a * a + b * b;
    let mut out = RgbImage::new(INPUT_SIZE, INPUT_SIZE);
    if det < 1e-12 {
        return out;
    }

    for (u, v, px) in out.enumerate_pixels_mut() {
        let (du, dv) = (u as f32 - tx, v as f32 - ty);
        let x = (a * du + b * dv) / det;
        let y = (-b * du + a * dv) / det;
        *px = sample(image, x, y);
    }
    out
}

fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    if x < 0.0 || y < 0.0 || x > w - 1.0 || y > h - 1.0 {
        return Rgb([0, 0, 0]);
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let (tl, tr) = (image.get_pixel(x0, y0), image.get_pixel(x1, y0));
    let (bl, br) = (image.get_pixel(x0, y1), image.get_pixel(x1, y1));
    let mut rgb = [0u8; 3];
    for (c, out) in rgb.iter_mut().enumerate() {
        let v = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + tr[c] as f32 * fx * (1.0 - fy)
            + bl[c] as f32 * (1.0 - fx) * fy
            + br[c] as f32 * fx * fy;
        *out = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(rgb)
}

fn to_tensor(aligned: &RgbImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - MEAN) / STD;
        }
    }
    tensor
}
