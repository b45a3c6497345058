//! V4L2 camera capture via the `v4l` crate.

use crate::convert::{self, PixelFormat};
use rollcall_core::{CapabilityError, Frame, FrameSource};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Buffers queued in the mmap stream.
const STREAM_BUFFERS: u32 = 4;
/// Highest `/dev/videoN` index probed by [`Camera::list_devices`].
const MAX_DEVICE_INDEX: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error(transparent)]
    Convert(#[from] convert::ConvertError),
}

impl From<CameraError> for CapabilityError {
    fn from(e: CameraError) -> Self {
        CapabilityError::Acquisition(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// An open V4L2 capture device producing grayscale frames.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") and request `width` x `height`.
    ///
    /// YUYV is requested; GREY and Y16 are accepted if the driver insists.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let mut requested = device
            .format()
            .map_err(|e| CameraError::FormatNegotiation(format!("get format: {e}")))?;
        requested.fourcc = FourCC::new(b"YUYV");
        requested.width = width;
        requested.height = height;

        let negotiated = device
            .set_format(&requested)
            .map_err(|e| CameraError::FormatNegotiation(format!("set format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc.repr).ok_or_else(|| {
            CameraError::FormatNegotiation(format!(
                "unsupported pixel format {} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %negotiated.fourcc,
            "camera opened"
        );

        Ok(Self {
            device,
            stream: None,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    /// Dequeue the next frame, starting the stream on first use.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("start mmap stream: {e}")))?;
            tracing::debug!(device = %self.device_path, buffers = STREAM_BUFFERS, "stream started");
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::CaptureFailed("stream not started".into()));
        };

        let (buf, meta) = stream.next().map_err(|e| {
            CameraError::CaptureFailed(format!("dequeue buffer: {e}"))
        })?;
        let gray = convert::to_grayscale(self.pixel_format, buf, self.width, self.height)?;
        Ok(Frame::new(gray, self.width, self.height, meta.sequence))
    }

    /// Stop streaming. The next capture restarts it.
    pub fn stop_stream(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(device = %self.device_path, "stream stopped");
        }
    }

    /// Video capture devices among `/dev/video0..15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_DEVICE_INDEX)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CapabilityError> {
        Ok(self.capture_frame()?)
    }

    fn release(&mut self) {
        self.stop_stream();
        tracing::info!(device = %self.device_path, "camera released");
    }
}
