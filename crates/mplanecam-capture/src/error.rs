//! Error types for the capture module.

use std::io;

use thiserror::Error;

/// Errors that can occur during capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device node could not be opened.
    #[error("Failed to open {path}: {source}")]
    DeviceOpen {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A device control request failed.
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The driver granted no buffers.
    #[error("Driver granted zero buffers")]
    NoBuffers,

    /// The driver reported a buffer without planes.
    #[error("Driver returned zero planes for buffer {index}")]
    ZeroPlanes { index: u32 },

    /// Mapping a buffer plane into process memory failed.
    #[error("mmap failed for buffer {index} plane {plane}: {source}")]
    Mmap {
        index: u32,
        plane: usize,
        #[source]
        source: io::Error,
    },

    /// A single-plane buffer is too small to hold the luma plane plus chroma.
    #[error("Single-plane buffer too small for NV12 layout (total={total}, luma={luma})")]
    InconsistentLayout { total: usize, luma: usize },

    /// The pool already holds mapped buffers.
    #[error("Buffer pool already allocated")]
    AlreadyAllocated,

    /// The stream is not running.
    #[error("Capture stream not started")]
    NotStreaming,

    /// The driver handed back a buffer index the pool does not know.
    #[error("Dequeued buffer index {index} out of range (pool holds {count})")]
    InvalidIndex { index: u32, count: usize },

    /// Frame conversion error.
    #[error("Frame conversion error: {0}")]
    FrameConversion(String),
}

impl CaptureError {
    /// Wraps an OS error from the named control request.
    pub(crate) fn ioctl(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Ioctl { op, source }
    }
}
