//! Multi-planar NV12 video capture.
//!
//! This crate negotiates a format with a capture device, maps the driver's buffers, runs the
//! non-blocking dequeue/requeue loop and converts captured frames to packed BGRA. Devices are
//! reached through the [`CaptureDevice`] trait; the `v4l2` feature provides the kernel backend
//! and [`VirtualBackend`] a hardware-free one.

mod convert;
mod device;
mod error;
mod format;
mod frame;
mod pool;
mod stream;
#[cfg(all(feature = "v4l2", target_os = "linux"))]
mod v4l2;
mod virtual_device;

#[cfg(test)]
mod mock;

pub use convert::{nv12_to_bgra, yuv_to_rgb};
pub use device::{
    fourcc_name, CaptureDevice, DeviceFormat, Dequeued, FormatRequest, Mapping, PixelFormat,
    PlaneFormat, PlaneLocation, VideoBackend,
};
pub use error::CaptureError;
pub use format::{negotiate, NegotiatedFormat};
pub use frame::{bgra_buffer_size, nv12_buffer_size, Nv12Frame, BGRA_BYTES_PER_PIXEL};
pub use pool::{BufferPool, MappedBuffer, PlaneLayout};
pub use stream::{CaptureStream, DequeuedBuffer};
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub use v4l2::{MmapRegion, V4l2Backend, V4l2Device};
pub use virtual_device::{
    HeapRegion, VirtualBackend, VirtualDevice, VirtualOptions, VIRTUAL_PATH_PREFIX,
};

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;
