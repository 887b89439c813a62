//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("invalid camera selector {0:?} (expected an index or a /dev/video* path)")]
    InvalidSelector(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

/// A source of frames for the capture loop.
pub trait FrameSource {
    /// Block until the next frame arrives or the source's wait bound passes.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        (**self).next_frame()
    }
}

/// Resolve a camera selector to a device path.
///
/// A bare index `N` means `/dev/videoN`; anything starting with `/` is used
/// as a path.
pub fn resolve_device(selector: &str) -> Result<String, CameraError> {
    let selector = selector.trim();
    if let Ok(index) = selector.parse::<u32>() {
        return Ok(format!("/dev/video{index}"));
    }
    if selector.starts_with('/') {
        return Ok(selector.to_string());
    }
    Err(CameraError::InvalidSelector(selector.to_string()))
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG per frame.
    Mjpeg,
    /// Packed 24-bit RGB.
    Rgb24,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"RGB3" => Some(Self::Rgb24),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// V4L2 camera with a running capture stream.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    timeout: Duration,
}

impl Camera {
    /// Open a camera by selector (index or path) and start streaming.
    ///
    /// `timeout` bounds each blocking frame wait.
    pub fn open(selector: &str, timeout: Duration) -> Result<Self, CameraError> {
        let device_path = resolve_device(selector)?;
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::with_path(&device_path).map_err(|e| open_error(&device_path, e))?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;
        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, RGB3 or GREY)",
                negotiated.fourcc
            ))
        })?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(timeout);

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path,
            fourcc: negotiated.fourcc,
            pixel_format,
            timeout,
        })
    }

    /// Capture a single frame as RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => CameraError::Timeout(self.timeout),
            _ => CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")),
        })?;
        let sequence = meta.sequence;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        let image = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(data, self.width, self.height)?,
            PixelFormat::Mjpeg => frame::mjpeg_to_rgb(data)?,
            PixelFormat::Rgb24 => frame::rgb24_to_rgb(data, self.width, self.height)?,
            PixelFormat::Grey => frame::grey_to_rgb(data, self.width, self.height)?,
        };

        Ok(Frame {
            image,
            captured_at: std::time::Instant::now(),
            sequence,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

fn open_error(device_path: &str, e: io::Error) -> CameraError {
    if e.raw_os_error() == Some(libc::EBUSY) {
        CameraError::DeviceBusy
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_device_index() {
        assert_eq!(resolve_device("0").unwrap(), "/dev/video0");
        assert_eq!(resolve_device(" 2 ").unwrap(), "/dev/video2");
    }

    #[test]
    fn test_resolve_device_path() {
        assert_eq!(
            resolve_device("/dev/v4l/by-id/usb-cam").unwrap(),
            "/dev/v4l/by-id/usb-cam"
        );
    }

    #[test]
    fn test_resolve_device_rejects_garbage() {
        assert!(matches!(
            resolve_device("front-door"),
            Err(CameraError::InvalidSelector(_))
        ));
        assert!(resolve_device("-1").is_err());
    }

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_open_error_busy_device() {
        let busy = io::Error::from_raw_os_error(libc::EBUSY);
        assert!(matches!(open_error("/dev/video0", busy), CameraError::DeviceBusy));

        let denied = io::Error::from_raw_os_error(libc::EACCES);
        assert!(matches!(
            open_error("/dev/video0", denied),
            CameraError::DeviceNotFound(_)
        ));
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-does-not-exist", Duration::from_secs(1)).err();
        assert!(matches!(err, Some(CameraError::DeviceNotFound(_))));
    }
}
