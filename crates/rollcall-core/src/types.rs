use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Enrollment role of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Staff => "staff",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role {0:?} (expected \"student\" or \"staff\")")]
pub struct ParseRoleError(String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "staff" => Ok(Role::Staff),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// A point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned face region reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceRegion {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Map a region found on a resized frame back onto the original frame.
    pub fn rescale(&self, sx: f32, sy: f32) -> FaceRegion {
        FaceRegion {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
            confidence: self.confidence,
        }
    }
}

/// Facial landmarks used for pose estimation.
///
/// Five-point detectors have no nose bridge; they report the eye midpoint
/// in its place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose_bridge: Point,
    pub nose_tip: Point,
    pub mouth_left: Point,
    pub mouth_right: Point,
}

/// Face embedding vector (128-dim for dlib-style encoders, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Embeddings of different length are never comparable and report
    /// `f32::INFINITY`.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled person with one or more reference embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub embeddings: Vec<Embedding>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// Fraction of this identity's stored vectors within `tolerance` of the probe.
    ///
    /// An identity without vectors has a ratio of 0.
    pub fn match_ratio(&self, probe: &Embedding, tolerance: f32) -> f32 {
        if self.embeddings.is_empty() {
            return 0.0;
        }
        let hits = self
            .embeddings
            .iter()
            .filter(|e| e.euclidean_distance(probe) <= tolerance)
            .count();
        hits as f32 / self.embeddings.len() as f32
    }
}

/// One matched face in one processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub identity_id: String,
    pub name: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(vectors: Vec<Vec<f32>>) -> Identity {
        Identity {
            id: "S001".into(),
            name: "Ada".into(),
            role: Role::Student,
            embeddings: vectors.into_iter().map(Embedding::new).collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_length_mismatch() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert!(a.euclidean_distance(&b).is_infinite());
    }

    #[test]
    fn test_match_ratio_counts_vectors_within_tolerance() {
        let id = identity(vec![vec![0.0, 0.0], vec![0.1, 0.0], vec![5.0, 5.0], vec![0.0, 0.2]]);
        let probe = Embedding::new(vec![0.0, 0.0]);
        assert!((id.match_ratio(&probe, 0.42) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_match_ratio_empty_identity() {
        let id = identity(vec![]);
        assert_eq!(id.match_ratio(&Embedding::new(vec![0.0]), 1.0), 0.0);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Staff".parse::<Role>().unwrap(), Role::Staff);
        assert_eq!(" student ".parse::<Role>().unwrap(), Role::Student);
        assert!("visitor".parse::<Role>().is_err());
    }

    #[test]
    fn test_region_rescale() {
        let r = FaceRegion::new(10.0, 20.0, 30.0, 40.0).rescale(2.0, 2.0);
        assert_eq!((r.x, r.y, r.width, r.height), (20.0, 40.0, 60.0, 80.0));
    }
}
