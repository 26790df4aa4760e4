//! presence-hw — V4L2 camera capture for the attendance pipeline.
//!
//! Negotiates a capture format, converts raw buffers into
//! [`presence_core::Frame`]s and exposes the stream as a `FrameSource`.

pub mod camera;
pub mod convert;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, WireFormat};
pub use convert::is_dark_frame;
