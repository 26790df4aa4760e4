//! V4L2 camera capture via the `v4l` crate.

use crate::convert;
use presence_core::{Frame, FrameSource, PixelFormat, SourceError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated wire format of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// Packed RGB24.
    Rgb3,
    /// 8-bit grayscale (native IR camera output).
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl WireFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb3),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    /// Pixel format of the frames produced from this wire format.
    pub fn frame_format(self) -> PixelFormat {
        match self {
            Self::Yuyv | Self::Rgb3 => PixelFormat::Rgb8,
            Self::Grey | Self::Y16 => PixelFormat::Gray8,
        }
    }

    /// Convert one raw buffer into frame bytes.
    pub fn convert(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, convert::ConvertError> {
        match self {
            Self::Yuyv => convert::yuyv_to_rgb(buf, width, height),
            Self::Rgb3 => convert::rgb3_to_rgb(buf, width, height),
            Self::Grey => convert::grey_to_gray(buf, width, height),
            Self::Y16 => convert::y16_to_gray(buf, width, height),
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    wire_format: WireFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and request
    /// `width` x `height`. The driver may negotiate a different size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; IR cameras commonly negotiate GREY or Y16 instead.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let wire_format = WireFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, RGB3, GREY, or Y16)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            wire_format,
        })
    }

    pub fn wire_format(&self) -> WireFormat {
        self.wire_format
    }

    /// Start streaming. The returned source yields frames until dropped.
    pub fn into_stream(self) -> Result<CameraStream, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        Ok(CameraStream {
            camera: self,
            stream,
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

/// A streaming camera; implements [`FrameSource`].
pub struct CameraStream {
    camera: Camera,
    stream: MmapStream<'static>,
}

impl CameraStream {
    /// Dequeue and convert the next buffer.
    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let camera = &self.camera;
        let data = camera
            .wire_format
            .convert(buf, camera.width, camera.height)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;

        Frame::new(
            data,
            camera.width,
            camera.height,
            camera.wire_format.frame_format(),
            meta.sequence,
        )
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

impl FrameSource for CameraStream {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        self.capture()
            .map(Some)
            .map_err(|e| SourceError::Failed(e.to_string()))
    }
}
