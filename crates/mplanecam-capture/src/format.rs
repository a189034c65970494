//! Format negotiation.

use mplanecam_ipc::FormatInfo;
use tracing::{debug, info, instrument, warn};

use crate::device::{fourcc_name, CaptureDevice, DeviceFormat, FormatRequest, PixelFormat};
use crate::frame::bgra_buffer_size;

/// The working parameters of a session, as settled by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,

    /// Planes per buffer: 1 (contiguous luma + chroma) or 2.
    pub plane_count: u32,

    /// Bytes per luma row. Never smaller than `width`.
    pub luma_stride: u32,

    /// Bytes per chroma row.
    pub chroma_stride: u32,

    pub pixel_format: PixelFormat,
}

impl NegotiatedFormat {
    /// Best-effort parameters used when the driver reports nothing usable.
    pub fn fallback(request: &FormatRequest) -> Self {
        Self {
            width: request.width,
            height: request.height,
            plane_count: 1,
            luma_stride: request.width,
            chroma_stride: request.width,
            pixel_format: request.pixel_format,
        }
    }

    /// Canonicalizes the driver's answer. The driver wins on every field it actually filled in.
    pub fn canonicalize(request: &FormatRequest, reported: &DeviceFormat) -> Self {
        let width = if reported.width == 0 {
            request.width
        } else {
            reported.width
        };
        let height = if reported.height == 0 {
            request.height
        } else {
            reported.height
        };

        if reported.fourcc != 0 && reported.fourcc != request.pixel_format.fourcc() {
            warn!(
                requested = %fourcc_name(request.pixel_format.fourcc()),
                reported = %fourcc_name(reported.fourcc),
                "Driver reported a different pixel format, decoding as NV12 anyway"
            );
        }

        let plane_count = reported.planes.len().clamp(1, 2) as u32;

        let luma_stride = match reported.planes.first() {
            Some(plane) if plane.bytes_per_line >= width => plane.bytes_per_line,
            _ => width,
        };

        let chroma_stride = match reported.planes.get(1) {
            Some(plane) if plane.bytes_per_line != 0 => plane.bytes_per_line,
            _ => luma_stride,
        };

        Self {
            width,
            height,
            plane_count,
            luma_stride,
            chroma_stride,
            pixel_format: request.pixel_format,
        }
    }

    /// Bytes of the luma plane including row padding.
    pub fn luma_size(&self) -> usize {
        self.luma_stride as usize * self.height as usize
    }

    /// Bytes of one packed BGRA frame at the negotiated size.
    pub fn rgb_len(&self) -> usize {
        bgra_buffer_size(self.width, self.height)
    }

    /// Snapshot for the host.
    pub fn info(&self, buffer_count: u32) -> FormatInfo {
        FormatInfo {
            width: self.width,
            height: self.height,
            plane_count: self.plane_count,
            luma_stride: self.luma_stride,
            chroma_stride: self.chroma_stride,
            buffer_count,
        }
    }
}

/// Asks the device for `width`x`height` NV12 and settles on whatever it reports.
///
/// Never fails: a rejected request is logged and the current format (or, failing that, the
/// request itself) is used instead. Hard failures surface later, during buffer allocation.
#[instrument(name = "negotiate_format", skip(device))]
pub fn negotiate<D: CaptureDevice>(device: &mut D, width: u32, height: u32) -> NegotiatedFormat {
    let request = FormatRequest {
        width,
        height,
        pixel_format: PixelFormat::Nv12,
    };

    let reported = match device.set_format(&request) {
        Ok(format) => Some(format),
        Err(e) => {
            warn!(error = %e, "VIDIOC_S_FMT failed, continuing with the driver's current format");
            match device.get_format() {
                Ok(format) => Some(format),
                Err(e) => {
                    debug!(error = %e, "VIDIOC_G_FMT failed, using requested parameters");
                    None
                }
            }
        }
    };

    let format = match reported {
        Some(reported) => NegotiatedFormat::canonicalize(&request, &reported),
        None => NegotiatedFormat::fallback(&request),
    };

    info!(
        width = format.width,
        height = format.height,
        planes = format.plane_count,
        luma_stride = format.luma_stride,
        chroma_stride = format.chroma_stride,
        "Negotiated capture format"
    );

    format
}
