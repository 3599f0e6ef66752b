//! Video source abstraction.

use rollcall_core::Frame;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported: {0}")]
    StreamingNotSupported(String),
    /// A single read failed; the next one may succeed.
    #[error("frame read failed: {0}")]
    Transient(String),
    #[error("device disconnected: {0}")]
    Disconnected(String),
    /// A finite source has no more frames.
    #[error("end of stream")]
    Exhausted,
    #[error("unsupported source {0}")]
    Unsupported(String),
}

impl CameraError {
    /// Whether the capture loop should keep reading after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::Transient(_))
    }
}

/// Opens capture devices by source descriptor.
pub trait VideoSource: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

/// An open, exclusively owned capture device.
pub trait CaptureDevice: Send {
    /// Next frame. Blocks until one is available.
    fn read(&mut self) -> Result<Frame, CameraError>;

    /// Release the underlying device. Called once; later reads may fail.
    fn release(&mut self);

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Resolves descriptors the way the daemon expects: a directory is read as a
/// sequence of still images, anything else is a V4L2 device path or index.
#[derive(Debug, Default, Clone)]
pub struct SystemSource {
    /// Minimum spacing between frames from still-image directories.
    pub still_interval: Option<std::time::Duration>,
    /// Restart still-image directories from the first file at the end.
    pub loop_stills: bool,
}

impl VideoSource for SystemSource {
    fn open(&self, source: &str) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let path = Path::new(source);
        if path.is_dir() {
            let stills = crate::stills::StillSequence::open(path)?
                .with_interval(self.still_interval)
                .looping(self.loop_stills);
            return Ok(Box::new(stills));
        }
        open_camera(source)
    }
}

#[cfg(feature = "v4l2")]
fn open_camera(source: &str) -> Result<Box<dyn CaptureDevice>, CameraError> {
    Ok(Box::new(crate::camera::V4l2Camera::open(&device_path(source))?))
}

#[cfg(not(feature = "v4l2"))]
fn open_camera(source: &str) -> Result<Box<dyn CaptureDevice>, CameraError> {
    Err(CameraError::Unsupported(format!(
        "{source}: live capture requires the v4l2 feature"
    )))
}

/// `"0"` becomes `/dev/video0`; paths pass through.
pub fn device_path(source: &str) -> String {
    match source.trim().parse::<u32>() {
        Ok(index) => format!("/dev/video{index}"),
        Err(_) => source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path_from_index() {
        assert_eq!(device_path("0"), "/dev/video0");
        assert_eq!(device_path(" 2 "), "/dev/video2");
        assert_eq!(device_path("/dev/video4"), "/dev/video4");
    }

    #[test]
    fn test_only_transient_is_transient() {
        assert!(CameraError::Transient("timeout".into()).is_transient());
        assert!(!CameraError::Exhausted.is_transient());
        assert!(!CameraError::Disconnected("gone".into()).is_transient());
    }

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn test_camera_without_feature_is_unsupported() {
        let err = SystemSource::default().open("/dev/video0").err();
        assert!(matches!(err, Some(CameraError::Unsupported(_))));
    }

    #[test]
    fn test_directory_opens_stills() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbImage::new(4, 4).save(dir.path().join("a.png")).unwrap();
        let mut dev = SystemSource::default().open(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(dev.read().unwrap().width(), 4);
    }
}
