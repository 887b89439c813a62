//! rollcall-hw — Camera capture for the attendance loop.
//!
//! Provides V4L2-based camera access and conversion of raw frames to RGB.

pub mod camera;
pub mod frame;

pub use camera::{resolve_device, Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
