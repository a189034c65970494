//! Borrowed views of captured NV12 frames.

use crate::error::CaptureError;
use crate::CaptureResult;

/// Bytes per pixel of the packed output format.
pub const BGRA_BYTES_PER_PIXEL: usize = 4;

/// A semi-planar 4:2:0 frame borrowed from a dequeued buffer.
///
/// The planes are only valid while the buffer is out of the driver's queue, which the borrow
/// on the dequeued buffer enforces.
#[derive(Debug, Clone, Copy)]
pub struct Nv12Frame<'a> {
    /// Luma plane.
    pub luma: &'a [u8],

    /// Bytes between the starts of consecutive luma rows.
    pub luma_stride: usize,

    /// Interleaved Cb/Cr plane, one pair per 2x2 luma block.
    pub chroma: &'a [u8],

    /// Bytes between the starts of consecutive chroma rows.
    pub chroma_stride: usize,

    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,
}

impl<'a> Nv12Frame<'a> {
    /// Number of chroma rows (one per two luma rows, rounded up).
    pub fn chroma_rows(&self) -> usize {
        (self.height as usize).div_ceil(2)
    }

    /// Readable bytes of one chroma row: both samples of every column pair, limited by stride.
    pub fn chroma_row_bytes(&self) -> usize {
        let pairs = (self.width as usize).div_ceil(2);
        (pairs * 2).min(self.chroma_stride)
    }

    /// Checks that both planes cover every row the dimensions and strides describe.
    pub fn validate(&self) -> CaptureResult<()> {
        let width = self.width as usize;
        let height = self.height as usize;

        if width == 0 || height == 0 {
            return Err(CaptureError::FrameConversion(format!(
                "empty frame {}x{}",
                self.width, self.height
            )));
        }

        if self.luma_stride < width {
            return Err(CaptureError::FrameConversion(format!(
                "luma stride {} shorter than width {}",
                self.luma_stride, width
            )));
        }

        let luma_needed = (height - 1) * self.luma_stride + width;
        if self.luma.len() < luma_needed {
            return Err(CaptureError::FrameConversion(format!(
                "luma plane holds {} bytes, need {}",
                self.luma.len(),
                luma_needed
            )));
        }

        let row_bytes = self.chroma_row_bytes();
        if row_bytes < 2 {
            return Err(CaptureError::FrameConversion(format!(
                "chroma stride {} cannot hold a sample pair",
                self.chroma_stride
            )));
        }

        let chroma_needed = (self.chroma_rows() - 1) * self.chroma_stride + row_bytes;
        if self.chroma.len() < chroma_needed {
            return Err(CaptureError::FrameConversion(format!(
                "chroma plane holds {} bytes, need {}",
                self.chroma.len(),
                chroma_needed
            )));
        }

        Ok(())
    }
}

/// Size of a tightly packed BGRA frame.
pub fn bgra_buffer_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * BGRA_BYTES_PER_PIXEL
}

/// Size of a tightly packed NV12 frame: luma plane plus half-height interleaved chroma.
pub fn nv12_buffer_size(width: u32, height: u32) -> usize {
    let y_size = width as usize * height as usize;
    let uv_size = (width as usize).div_ceil(2) * 2 * (height as usize).div_ceil(2);
    y_size + uv_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame<'a>(luma: &'a [u8], chroma: &'a [u8], width: u32, height: u32) -> Nv12Frame<'a> {
        Nv12Frame {
            luma,
            luma_stride: width as usize,
            chroma,
            chroma_stride: width as usize,
            width,
            height,
        }
    }

    #[test]
    fn test_buffer_sizes() {
        assert_eq!(nv12_buffer_size(4, 2), 12);
        assert_eq!(nv12_buffer_size(3, 3), 9 + 8);
        assert_eq!(bgra_buffer_size(1920, 1080), 1920 * 1080 * 4);
    }

    #[test]
    fn test_validate_accepts_tight_planes() {
        let luma = [0u8; 16];
        let chroma = [0u8; 8];
        assert!(frame(&luma, &chroma, 4, 4).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_chroma() {
        let luma = [0u8; 16];
        let chroma = [0u8; 5];
        assert!(frame(&luma, &chroma, 4, 4).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_stride_below_width() {
        let luma = [0u8; 64];
        let chroma = [0u8; 64];
        let mut view = frame(&luma, &chroma, 8, 4);
        view.luma_stride = 6;
        assert!(view.validate().is_err());
    }

    #[test]
    fn test_odd_width_chroma_row_limited_by_stride() {
        let luma = [0u8; 15];
        let chroma = [0u8; 10];
        let view = frame(&luma, &chroma, 5, 3);
        assert_eq!(view.chroma_row_bytes(), 5);
        assert_eq!(view.chroma_rows(), 2);
        assert!(view.validate().is_ok());
    }
}
