//! rollcall-hw: video sources for the capture pipeline.
//!
//! Still-image directories are always available; live V4L2 capture is
//! behind the `v4l2` feature.

#[cfg(feature = "v4l2")]
pub mod camera;
pub mod convert;
pub mod source;
pub mod stills;

#[cfg(feature = "v4l2")]
pub use camera::{DeviceInfo, V4l2Camera};
pub use source::{CameraError, CaptureDevice, SystemSource, VideoSource};
pub use stills::StillSequence;
