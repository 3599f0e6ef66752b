//! V4L2 camera capture via the `v4l` crate.

use crate::convert;
use crate::source::{CameraError, CaptureDevice};
use rollcall_core::Frame;
use std::io;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 480;
const BUFFER_COUNT: u32 = 4;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
    Rgb24,
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// Streaming V4L2 capture.
pub struct V4l2Camera {
    // Dropped before the device it was created from.
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    path: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
}

impl V4l2Camera {
    /// Open a device (e.g. "/dev/video0"), negotiate a format and start streaming.
    pub fn open(path: &str) -> Result<Self, CameraError> {
        if !Path::new(path).exists() {
            return Err(CameraError::DeviceNotFound(path.to_string()));
        }

        let device = Device::with_path(path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy(path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::DeviceNotFound(format!("{path}: query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(v4l::capability::Flags::STREAMING)
        {
            return Err(CameraError::StreamingNotSupported(path.to_string()));
        }
        tracing::info!(device = path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUEST_WIDTH;
        fmt.height = REQUEST_HEIGHT;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {} (need YUYV, MJPG, RGB3 or GREY)",
                negotiated.fourcc
            ))
        })?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %negotiated.fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, BUFFER_COUNT)
            .map_err(|e| CameraError::StreamingNotSupported(format!("{path}: mmap stream: {e}")))?;

        Ok(Self {
            stream: Some(stream),
            device: Some(device),
            path: path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            format,
            sequence: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// List video capture devices under /dev/video0..15.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

fn classify(path: &str, e: io::Error) -> CameraError {
    match e.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            CameraError::Transient(format!("{path}: {e}"))
        }
        _ => CameraError::Disconnected(format!("{path}: {e}")),
    }
}

impl CaptureDevice for V4l2Camera {
    fn read(&mut self) -> Result<Frame, CameraError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::Disconnected(format!("{}: released", self.path)))?;
        let (buf, _meta) = stream.next().map_err(|e| classify(&self.path, e))?;

        let (w, h) = (self.width, self.height);
        let image = match self.format {
            PixelFormat::Yuyv => convert::yuyv_to_rgb(buf, w, h),
            PixelFormat::Mjpeg => convert::mjpeg_to_rgb(buf),
            PixelFormat::Rgb24 => convert::rgb24_to_rgb(buf, w, h),
            PixelFormat::Grey => convert::grey_to_rgb(buf, w, h),
        }
        .map_err(|e| CameraError::Transient(e.to_string()))?;

        let frame = Frame::new(image, self.sequence);
        self.sequence += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            self.device = None;
            tracing::info!(device = %self.path, "released camera");
        }
    }

    fn describe(&self) -> String {
        format!("v4l2:{} {}x{} {:?}", self.path, self.width, self.height, self.format)
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_io_error_classification() {
        let e = classify("/dev/video0", io::Error::from(io::ErrorKind::Interrupted));
        assert!(e.is_transient());
        let e = classify("/dev/video0", io::Error::from_raw_os_error(19));
        assert!(matches!(e, CameraError::Disconnected(_)));
    }

    #[test]
    fn test_missing_device() {
        assert!(matches!(
            V4l2Camera::open("/dev/video-does-not-exist"),
            Err(CameraError::DeviceNotFound(_))
        ));
    }
}
