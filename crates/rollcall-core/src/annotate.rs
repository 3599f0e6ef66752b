//! Bounding-box and label overlays for the live stream.

use crate::frame::Frame;
use crate::types::FaceRegion;
use ab_glyph::{FontVec, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 18.0;
const LABEL_OFFSET: i32 = 4;

pub const UNKNOWN_LABEL: &str = "Unknown";

/// One face to draw on a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub region: FaceRegion,
    pub label: String,
    pub known: bool,
}

impl Overlay {
    pub fn known(region: FaceRegion, label: impl Into<String>) -> Self {
        Self {
            region,
            label: label.into(),
            known: true,
        }
    }

    pub fn unknown(region: FaceRegion) -> Self {
        Self {
            region,
            label: UNKNOWN_LABEL.to_string(),
            known: false,
        }
    }
}

/// A frame together with the overlays drawn onto it.
#[derive(Clone)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub overlays: Vec<Overlay>,
    /// False for frames skipped by the recognizer.
    pub processed: bool,
}

impl AnnotatedFrame {
    pub fn passthrough(frame: Frame) -> Self {
        Self {
            frame,
            overlays: Vec::new(),
            processed: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FontError {
    #[error("cannot read label font {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid label font {0}")]
    Invalid(String),
}

/// Draws overlays. Label text needs a TrueType font; without one only boxes
/// are drawn and labels travel as overlay metadata.
#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font_file(path: &Path) -> Result<Self, FontError> {
        let bytes = std::fs::read(path).map_err(|source| FontError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| FontError::Invalid(path.display().to_string()))?;
        Ok(Self { font: Some(font) })
    }

    pub fn annotate(&self, mut frame: Frame, overlays: Vec<Overlay>) -> AnnotatedFrame {
        for overlay in &overlays {
            self.draw(&mut frame, overlay);
        }
        AnnotatedFrame {
            frame,
            overlays,
            processed: true,
        }
    }

    fn draw(&self, frame: &mut Frame, overlay: &Overlay) {
        let color = if overlay.known { KNOWN_COLOR } else { UNKNOWN_COLOR };
        let (fw, fh) = (frame.width() as i32, frame.height() as i32);

        let left = (overlay.region.x.round() as i32).clamp(0, fw);
        let top = (overlay.region.y.round() as i32).clamp(0, fh);
        let right = (overlay.region.right().round() as i32).clamp(0, fw);
        let bottom = (overlay.region.bottom().round() as i32).clamp(0, fh);

        // Rect panics on zero size.
        for inset in 0..BOX_THICKNESS {
            let w = right - left - 2 * inset;
            let h = bottom - top - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(left + inset, top + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut frame.image, rect, color);
        }

        if let Some(font) = &self.font {
            draw_text_mut(
                &mut frame.image,
                color,
                left,
                bottom + LABEL_OFFSET,
                PxScale::from(LABEL_SCALE),
                font,
                &overlay.label,
            );
        }
    }
}
