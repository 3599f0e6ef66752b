//! Coarse head-pose estimate from 2D landmark geometry.
//!
//! Not a PnP solve: the angles are only meaningful relative to each other,
//! which is all the enrollment sampler needs to tell views apart.

use crate::types::{FaceRegion, Landmarks};
use serde::{Deserialize, Serialize};

/// Yaw used by the position fallback when the face sits at the frame edge.
const POSITION_YAW_RANGE: f32 = 30.0;

/// Head orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl Pose {
    pub fn new(yaw: f32, pitch: f32, roll: f32) -> Self {
        Self { yaw, pitch, roll }
    }

    /// Euclidean distance in (yaw, pitch, roll) space.
    pub fn distance(&self, other: &Pose) -> f32 {
        ((self.yaw - other.yaw).powi(2)
            + (self.pitch - other.pitch).powi(2)
            + (self.roll - other.roll).powi(2))
        .sqrt()
    }
}

/// Estimate pose from landmarks.
///
/// Yaw and pitch are the nose-tip offsets from the eye centre and nose
/// bridge, taken as angles against the inter-eye distance and doubled.
/// Roll is the angle of the eye line.
pub fn estimate_pose(landmarks: &Landmarks) -> Pose {
    let left = landmarks.left_eye;
    let right = landmarks.right_eye;
    let eye_center = left.midpoint(&right);
    let eye_span = left.distance(&right);

    let yaw = (landmarks.nose_tip.x - eye_center.x).atan2(eye_span).to_degrees() * 2.0;
    let pitch = (landmarks.nose_tip.y - landmarks.nose_bridge.y)
        .atan2(eye_span)
        .to_degrees()
        * 2.0;
    let roll = (right.y - left.y).atan2(right.x - left.x).to_degrees();

    Pose { yaw, pitch, roll }
}

/// Fallback when the analyzer has no landmarks: yaw from the horizontal
/// position of the face in the frame, pitch and roll zero.
pub fn estimate_pose_from_position(face: &FaceRegion, frame_width: u32) -> Pose {
    let half = frame_width as f32 / 2.0;
    if half <= 0.0 {
        return Pose::default();
    }
    let yaw = (face.center().x - half) / half * POSITION_YAW_RANGE;
    Pose::new(yaw, 0.0, 0.0)
}
