//! rollcall-hw: V4L2 camera capture.

pub mod camera;
pub mod convert;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use convert::PixelFormat;
