//! Daemon configuration from `ROLLCALL_*` environment variables.

use crate::controller::ControllerConfig;
use rollcall_core::{RecognitionConfig, SamplerConfig};
use rollcall_hw::SystemSource;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera index, device path or still-image directory (default: 0).
    pub camera_source: String,
    /// Root for persistent data (default: $XDG_DATA_HOME/rollcall).
    pub data_dir: PathBuf,
    /// One JSON file per enrolled identity.
    pub faces_dir: PathBuf,
    /// Append-only attendance journal.
    pub journal_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub frame_skip: u32,
    pub scale: f32,
    /// Euclidean distance under which a stored vector counts as a hit.
    pub tolerance: f32,
    /// Fraction of an identity's vectors that must hit.
    pub threshold: f32,
    pub cooldown_secs: u64,
    pub join_timeout_ms: u64,
    pub frame_queue_capacity: usize,
    /// Samples collected per enrollment.
    pub capture_count: usize,
    pub angle_threshold: f32,
    pub crop_margin: u32,
    /// Idle time after which an enrollment session is discarded.
    pub session_expiry_secs: u64,
    pub jpeg_quality: u8,
    /// TrueType font for label text; boxes only when unset.
    pub label_font: Option<PathBuf>,
    /// Start monitoring immediately in `run`.
    pub auto_start: bool,
    /// Minimum spacing between frames read from a still-image directory.
    pub still_interval_ms: Option<u64>,
    /// Replay a still-image directory from the start when it runs out.
    pub loop_stills: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                lookup("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("rollcall")
            });

        let path_or = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);

        Self {
            camera_source: lookup("ROLLCALL_CAMERA_SOURCE").unwrap_or_else(|| "0".to_string()),
            faces_dir: path_or("ROLLCALL_FACES_DIR", data_dir.join("face_data")),
            journal_path: path_or("ROLLCALL_JOURNAL_PATH", data_dir.join("attendance.jsonl")),
            model_dir: path_or("ROLLCALL_MODEL_DIR", data_dir.join("models")),
            frame_skip: parse_or(&lookup, "ROLLCALL_FRAME_SKIP", 2),
            scale: parse_or(&lookup, "ROLLCALL_SCALE", 0.5f32).clamp(0.05, 1.0),
            tolerance: parse_in(&lookup, "ROLLCALL_TOLERANCE", 0.42, f32::MIN_POSITIVE..=f32::MAX),
            threshold: parse_in(&lookup, "ROLLCALL_THRESHOLD", 0.6, 0.0..=1.0),
            cooldown_secs: parse_or(&lookup, "ROLLCALL_COOLDOWN_SECS", 30),
            join_timeout_ms: parse_or(&lookup, "ROLLCALL_JOIN_TIMEOUT_MS", 2000),
            frame_queue_capacity: parse_or(&lookup, "ROLLCALL_FRAME_QUEUE", 2usize).max(1),
            capture_count: parse_or(&lookup, "ROLLCALL_CAPTURE_COUNT", 5usize).max(1),
            angle_threshold: parse_or(&lookup, "ROLLCALL_ANGLE_THRESHOLD", 15.0),
            crop_margin: parse_or(&lookup, "ROLLCALL_CROP_MARGIN", 50),
            session_expiry_secs: parse_or(&lookup, "ROLLCALL_SESSION_EXPIRY_SECS", 600),
            jpeg_quality: parse_or(&lookup, "ROLLCALL_JPEG_QUALITY", 80u8).clamp(1, 100),
            label_font: lookup("ROLLCALL_LABEL_FONT").map(PathBuf::from),
            auto_start: flag(&lookup, "ROLLCALL_AUTO_START", true),
            still_interval_ms: Some(parse_or(&lookup, "ROLLCALL_STILL_INTERVAL_MS", 0u64)).filter(|ms| *ms > 0),
            loop_stills: flag(&lookup, "ROLLCALL_LOOP_STILLS", false),
            data_dir,
        }
    }

    pub fn recognition(&self) -> RecognitionConfig {
        RecognitionConfig {
            frame_skip: self.frame_skip,
            scale: self.scale,
            tolerance: self.tolerance,
            threshold: self.threshold,
        }
    }

    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig {
            target_count: self.capture_count,
            angle_threshold: self.angle_threshold,
            crop_margin: self.crop_margin,
        }
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            cooldown: Duration::from_secs(self.cooldown_secs),
            frame_queue_capacity: self.frame_queue_capacity,
            jpeg_quality: self.jpeg_quality,
            ..ControllerConfig::default()
        }
    }

    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry_secs)
    }

    /// Source resolver for `ROLLCALL_CAMERA_SOURCE` and `--source`.
    pub fn video_source(&self) -> SystemSource {
        SystemSource {
            still_interval: self.still_interval_ms.map(Duration::from_millis),
            loop_stills: self.loop_stills,
        }
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(default)
}

/// Like `parse_or`, but values outside `range` (or NaN) also fall back.
fn parse_in(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32, range: RangeInclusive<f32>) -> f32 {
    let value = parse_or(lookup, key, default);
    if range.contains(&value) {
        value
    } else {
        tracing::warn!(key, value, min = range.start(), max = range.end(), "config value out of range; using default");
        default
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable config value; using default");
            default
        }),
        None => default,
    }
}
