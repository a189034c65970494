//! NV12 to BGRA conversion.
//!
//! Studio-range BT.601 with the usual 8-bit fixed point coefficients. The arithmetic is integer
//! only and uses arithmetic shifts, so output is bit-exact across platforms.

use crate::error::CaptureError;
use crate::frame::{bgra_buffer_size, Nv12Frame, BGRA_BYTES_PER_PIXEL};
use crate::CaptureResult;

/// Converts one studio-range sample to `[r, g, b]`.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Converts `frame` into tightly packed BGRA rows of `frame.width * 4` bytes.
///
/// `out` must hold exactly `width * height * 4` bytes. Alpha is always 255.
pub fn nv12_to_bgra(frame: &Nv12Frame<'_>, out: &mut [u8]) -> CaptureResult<()> {
    frame.validate()?;

    let width = frame.width as usize;
    let expected = bgra_buffer_size(frame.width, frame.height);
    if out.len() != expected {
        return Err(CaptureError::FrameConversion(format!(
            "output holds {} bytes, expected {}",
            out.len(),
            expected
        )));
    }

    // Last column pair that still fits inside a chroma row; odd trailing pixels reuse it.
    let last_pair = (frame.chroma_row_bytes() / 2 - 1) * 2;
    let row_bytes = width * BGRA_BYTES_PER_PIXEL;

    for (y, out_row) in out.chunks_exact_mut(row_bytes).enumerate() {
        let luma_row = &frame.luma[y * frame.luma_stride..][..width];
        let chroma_row = &frame.chroma[(y / 2) * frame.chroma_stride..];

        for (x, (pixel, &luma)) in out_row
            .chunks_exact_mut(BGRA_BYTES_PER_PIXEL)
            .zip(luma_row)
            .enumerate()
        {
            let pair = (x & !1).min(last_pair);
            let [r, g, b] = yuv_to_rgb(luma, chroma_row[pair], chroma_row[pair + 1]);
            pixel.copy_from_slice(&[b, g, r, 255]);
        }
    }

    Ok(())
}
