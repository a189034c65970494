//! A streaming capture session over one opened device.
//!
//! [`CaptureStream::start`] acquires resources in order (format, driver buffers, mappings,
//! streaming) and relies on `Drop` to unwind whatever was acquired if a later step fails.

use tracing::{debug, error, info, instrument};

use crate::device::CaptureDevice;
use crate::error::CaptureError;
use crate::format::{negotiate, NegotiatedFormat};
use crate::frame::Nv12Frame;
use crate::pool::{BufferPool, MappedBuffer};
use crate::CaptureResult;
use mplanecam_ipc::FormatInfo;

/// An open device with mapped buffers and streaming enabled.
pub struct CaptureStream<D: CaptureDevice> {
    // Declared before `device` so mappings drop before the descriptor closes.
    pool: BufferPool<D::Mapping>,
    format: NegotiatedFormat,
    buffer_count: u32,
    buffers_requested: bool,
    streaming: bool,
    device: D,
}

impl<D: CaptureDevice> CaptureStream<D> {
    /// Negotiates `width`x`height`, maps up to `buffer_count` buffers and starts streaming.
    #[instrument(name = "stream_start", skip(device))]
    pub fn start(mut device: D, width: u32, height: u32, buffer_count: u32) -> CaptureResult<Self> {
        let format = negotiate(&mut device, width, height);

        let mut stream = Self {
            pool: BufferPool::new(),
            format,
            buffer_count: 0,
            buffers_requested: false,
            streaming: false,
            device,
        };

        stream.buffers_requested = true;
        stream.buffer_count = stream
            .pool
            .allocate(&mut stream.device, &format, buffer_count)?;

        stream
            .device
            .stream_on()
            .map_err(CaptureError::ioctl("VIDIOC_STREAMON"))?;
        stream.streaming = true;

        info!(
            width = stream.format.width,
            height = stream.format.height,
            buffers = stream.buffer_count,
            "Capture streaming"
        );
        Ok(stream)
    }

    /// Working parameters of this session.
    pub fn format(&self) -> &NegotiatedFormat {
        &self.format
    }

    /// Host-facing snapshot of the session format.
    pub fn info(&self) -> FormatInfo {
        self.format.info(self.buffer_count)
    }

    /// Buffers owned by the session.
    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    /// Whether streaming is on.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Takes one completed buffer without blocking.
    ///
    /// `Ok(None)` means no buffer is ready. A buffer index outside the pool is handed straight
    /// back to the driver and reported as [`CaptureError::InvalidIndex`].
    pub fn dequeue(&mut self) -> CaptureResult<Option<DequeuedBuffer<'_, D>>> {
        if !self.streaming {
            return Err(CaptureError::NotStreaming);
        }

        let Some(done) = self
            .device
            .dequeue()
            .map_err(CaptureError::ioctl("VIDIOC_DQBUF"))?
        else {
            return Ok(None);
        };

        let Self {
            pool,
            format,
            device,
            ..
        } = self;

        let Some(buffer) = pool.get(done.index) else {
            if let Err(e) = device.queue(done.index, format.plane_count) {
                error!(index = done.index, error = %e, "Failed to requeue out-of-range buffer");
            }
            return Err(CaptureError::InvalidIndex {
                index: done.index,
                count: pool.len(),
            });
        };

        Ok(Some(DequeuedBuffer {
            device,
            buffer,
            format,
            sequence: done.sequence,
            requeued: false,
        }))
    }

    /// Stops streaming. The driver reclaims every queued buffer; mappings stay until drop.
    #[instrument(name = "stream_stop", skip(self))]
    pub fn stop(&mut self) -> CaptureResult<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        self.device
            .stream_off()
            .map_err(CaptureError::ioctl("VIDIOC_STREAMOFF"))
    }
}

impl<D: CaptureDevice> Drop for CaptureStream<D> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            // ENODEV after unplug is expected here.
            debug!(error = %e, "Stream off during teardown failed");
        }

        self.pool.release();

        if self.buffers_requested {
            if let Err(e) = self.device.request_buffers(0) {
                debug!(error = %e, "Failed to free driver buffers");
            }
        }
    }
}

/// A buffer taken out of the driver's queue.
///
/// Its planes are readable only through this value, and the value hands the buffer back to
/// the driver when consumed by [`DequeuedBuffer::requeue`] or dropped.
pub struct DequeuedBuffer<'a, D: CaptureDevice> {
    device: &'a mut D,
    buffer: &'a MappedBuffer<D::Mapping>,
    format: &'a NegotiatedFormat,
    sequence: u32,
    requeued: bool,
}

impl<'a, D: CaptureDevice> DequeuedBuffer<'a, D> {
    /// Driver index of the buffer.
    pub fn index(&self) -> u32 {
        self.buffer.index()
    }

    /// Driver frame sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// The captured frame.
    pub fn frame(&self) -> Nv12Frame<'_> {
        Nv12Frame {
            luma: self.buffer.luma(),
            luma_stride: self.format.luma_stride as usize,
            chroma: self.buffer.chroma(),
            chroma_stride: self.format.chroma_stride as usize,
            width: self.format.width,
            height: self.format.height,
        }
    }

    /// Hands the buffer back to the driver's capture queue.
    pub fn requeue(mut self) -> CaptureResult<()> {
        self.requeued = true;
        self.device
            .queue(self.buffer.index(), self.buffer.plane_count())
            .map_err(CaptureError::ioctl("VIDIOC_QBUF"))
    }
}

impl<D: CaptureDevice> Drop for DequeuedBuffer<'_, D> {
    fn drop(&mut self) {
        if self.requeued {
            return;
        }
        if let Err(e) = self
            .device
            .queue(self.buffer.index(), self.buffer.plane_count())
        {
            error!(index = self.buffer.index(), error = %e, "Failed to requeue buffer");
        }
    }
}
