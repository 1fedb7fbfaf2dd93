//! vigil-hw: frame acquisition for the identification pipeline.
//!
//! Frames come either from a local V4L2 device or from an HTTP MJPEG
//! stream, and are delivered as RGB images behind the [`FrameSource`] trait.

pub mod camera;
pub mod frame;
pub mod mjpeg;

pub use camera::{open_source, CameraError, DeviceInfo, FrameSource, V4l2Camera};
pub use frame::{Frame, FrameError};
pub use mjpeg::MjpegStream;
