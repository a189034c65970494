//! The capture device protocol consumed by the session.
//!
//! A [`CaptureDevice`] is the narrow surface of a kernel video-capture node this crate relies
//! on: format negotiation, buffer reservation and mapping, the capture queue and the streaming
//! switch. Backends implement it for real hardware (see the `v4l2` feature) or in memory.

use std::io;

/// Pixel layouts understood by the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4:2:0 semi-planar: full resolution luma followed by interleaved Cb/Cr pairs.
    #[default]
    Nv12,
}

impl PixelFormat {
    /// Little-endian four character code as used on the wire.
    pub fn fourcc(self) -> u32 {
        match self {
            Self::Nv12 => u32::from_le_bytes(*b"NV12"),
        }
    }
}

/// Renders a four character code such as `NV12`.
pub fn fourcc_name(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}

/// A format request sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// Per-plane layout reported by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    /// Bytes per row, including driver padding. Zero when the driver leaves it unset.
    pub bytes_per_line: u32,

    /// Bytes needed to hold the plane.
    pub size_image: u32,
}

/// The format the driver actually settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub planes: Vec<PlaneFormat>,
}

/// Where one plane of a driver buffer lives in the device's mappable space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLocation {
    pub offset: u32,
    pub length: usize,
}

/// A completed buffer handed back by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub sequence: u32,
}

/// A region of device memory mapped into the process.
///
/// The region stays mapped for as long as the value lives; dropping it unmaps it.
pub trait Mapping: Send {
    /// The mapped bytes.
    fn as_slice(&self) -> &[u8];

    /// Length of the mapping in bytes.
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns true for a zero-length mapping.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An opened capture device.
pub trait CaptureDevice: Send {
    /// Owned mapping type produced by [`CaptureDevice::map`].
    type Mapping: Mapping;

    /// Requests a format. The returned format is authoritative even when it differs from
    /// the request.
    fn set_format(&mut self, request: &FormatRequest) -> io::Result<DeviceFormat>;

    /// Reads back the current format.
    fn get_format(&mut self) -> io::Result<DeviceFormat>;

    /// Reserves `count` buffers and returns how many the driver granted. Zero frees them.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Returns the plane locations of buffer `index`.
    fn query_buffer(&mut self, index: u32) -> io::Result<Vec<PlaneLocation>>;

    /// Maps one plane into process memory.
    fn map(&mut self, plane: &PlaneLocation) -> io::Result<Self::Mapping>;

    /// Hands buffer `index` (with `planes` planes) to the driver's capture queue.
    fn queue(&mut self, index: u32, planes: u32) -> io::Result<()>;

    /// Takes one completed buffer without blocking. `Ok(None)` means none is ready yet.
    fn dequeue(&mut self) -> io::Result<Option<Dequeued>>;

    /// Starts streaming.
    fn stream_on(&mut self) -> io::Result<()>;

    /// Stops streaming; the driver reclaims every queued buffer.
    fn stream_off(&mut self) -> io::Result<()>;
}

/// Opens capture devices by path.
pub trait VideoBackend: Send + Sync {
    /// Device type produced by this backend.
    type Device: CaptureDevice;

    /// Opens the device node at `path`.
    fn open(&self, path: &str) -> io::Result<Self::Device>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nv12_fourcc() {
        assert_eq!(PixelFormat::Nv12.fourcc(), 0x3231_564e);
        assert_eq!(fourcc_name(PixelFormat::Nv12.fourcc()), "NV12");
    }

    #[test]
    fn test_fourcc_name_masks_unprintable() {
        assert_eq!(fourcc_name(0), "????");
    }
}
